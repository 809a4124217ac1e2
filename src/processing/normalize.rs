// Shared field normalization used by both parsing strategies, so a value
// recovered from the barcode and the same value recovered from OCR text
// land in the record in identical form.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

const CM_PER_INCH: f64 = 2.54;
const KG_PER_POUND: f64 = 0.453_592_37;

lazy_static! {
    static ref SEPARATED_DATE: Regex =
        Regex::new(r"(\d{1,4})[\s/.\-](\d{1,2})[\s/.\-](\d{2,4})").unwrap();
    static ref MONTH_NAME_DATE: Regex =
        Regex::new(r"(?i)(\d{1,2})\s+([A-Za-z]{3,9})\s+(\d{2,4})").unwrap();
    static ref FEET_INCHES: Regex = Regex::new(r#"(\d)\s*'\s*-?\s*(\d{1,2})\s*"?"#).unwrap();
    static ref SUFFIX_TAIL: Regex =
        Regex::new(r"(?i)[,\s]+(JR|SR|II|III|IV|V)\.?$").unwrap();
}

/// Parse the fixed 8-digit date form embedded in structured payloads.
/// `MMDDCCYY` is the standard layout; `CCYYMMDD` is tolerated for older
/// payload versions.
pub fn parse_compact_date(digits: &str) -> Option<NaiveDate> {
    let digits = digits.trim();
    if digits.len() != 8 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let num = |range: std::ops::Range<usize>| digits[range].parse::<u32>().ok();

    if let (Some(month), Some(day), Some(year)) = (num(0..2), num(2..4), num(4..8)) {
        if let Some(date) = NaiveDate::from_ymd_opt(year as i32, month, day) {
            return Some(date);
        }
    }
    if let (Some(year), Some(month), Some(day)) = (num(0..4), num(4..6), num(6..8)) {
        if let Some(date) = NaiveDate::from_ymd_opt(year as i32, month, day) {
            return Some(date);
        }
    }
    None
}

/// Normalize a free-form date string to a calendar date. Accepts `/`, `-`,
/// `.` and space separators, two- or four-digit years, spelled-out months,
/// and the bare 8-digit form. Month-first is tried before day-first, which
/// matches the documents this pipeline reads.
pub fn normalize_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();

    if let Some(caps) = MONTH_NAME_DATE.captures(text) {
        let day = caps[1].parse::<u32>().ok()?;
        let month = month_from_name(&caps[2])?;
        let year = expand_year(caps[3].parse::<i32>().ok()?);
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    if let Some(caps) = SEPARATED_DATE.captures(text) {
        let a = caps[1].parse::<i32>().ok()?;
        let b = caps[2].parse::<u32>().ok()?;
        let c = caps[3].parse::<i32>().ok()?;

        // Four digits up front can only be a year.
        if caps[1].len() == 4 {
            return NaiveDate::from_ymd_opt(a, b, c as u32);
        }
        let year = expand_year(c);
        // Month-first, then day-first when the first part cannot be a month.
        if let Some(date) = NaiveDate::from_ymd_opt(year, a as u32, b) {
            return Some(date);
        }
        return NaiveDate::from_ymd_opt(year, b, a as u32);
    }

    parse_compact_date(text)
}

fn month_from_name(name: &str) -> Option<u32> {
    let month = match name.to_lowercase().as_str() {
        "jan" | "january" => 1,
        "feb" | "february" => 2,
        "mar" | "march" => 3,
        "apr" | "april" => 4,
        "may" => 5,
        "jun" | "june" => 6,
        "jul" | "july" => 7,
        "aug" | "august" => 8,
        "sep" | "sept" | "september" => 9,
        "oct" | "october" => 10,
        "nov" | "november" => 11,
        "dec" | "december" => 12,
        _ => return None,
    };
    Some(month)
}

fn expand_year(year: i32) -> i32 {
    if year >= 100 {
        year
    } else if year >= 50 {
        1900 + year
    } else {
        2000 + year
    }
}

/// Height in centimeters from either measurement form: `069 in`, `175 cm`,
/// or the colloquial `5'-09"`.
pub fn parse_height(text: &str) -> Option<f64> {
    let text = text.trim();
    let upper = text.to_uppercase();

    if let Some(value) = upper.strip_suffix("IN") {
        let inches = value.trim().parse::<f64>().ok()?;
        return Some(inches * CM_PER_INCH);
    }
    if let Some(value) = upper.strip_suffix("CM") {
        return value.trim().parse::<f64>().ok();
    }
    if let Some(caps) = FEET_INCHES.captures(text) {
        let feet = caps[1].parse::<f64>().ok()?;
        let inches = caps[2].parse::<f64>().ok()?;
        return Some((feet * 12.0 + inches) * CM_PER_INCH);
    }
    None
}

/// Weight in kilograms from a pounds figure (the structured payload form).
pub fn weight_from_pounds(text: &str) -> Option<f64> {
    let pounds = text.trim().parse::<f64>().ok()?;
    if !(20.0..=700.0).contains(&pounds) {
        return None;
    }
    Some(pounds * KG_PER_POUND)
}

/// Weight in kilograms from free text, unit-suffixed either way.
pub fn parse_weight_text(text: &str) -> Option<f64> {
    let upper = text.trim().to_uppercase();
    if let Some(value) = upper.strip_suffix("KG") {
        return value.trim().parse::<f64>().ok();
    }
    let value = upper
        .strip_suffix("LBS")
        .or_else(|| upper.strip_suffix("LB"))
        .unwrap_or(&upper);
    weight_from_pounds(value)
}

/// Uppercase a name, collapse runs of whitespace, and split off a trailing
/// generational suffix.
pub fn clean_name(text: &str) -> (String, Option<String>) {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    if let Some(caps) = SUFFIX_TAIL.captures(&collapsed) {
        let suffix = caps[1].to_uppercase();
        let base = SUFFIX_TAIL.replace(&collapsed, "").trim().to_string();
        return (base, Some(suffix));
    }
    (collapsed, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_date_month_first() {
        assert_eq!(
            parse_compact_date("01151990"),
            NaiveDate::from_ymd_opt(1990, 1, 15)
        );
    }

    #[test]
    fn compact_date_year_first_tolerated() {
        assert_eq!(
            parse_compact_date("19900115"),
            NaiveDate::from_ymd_opt(1990, 1, 15)
        );
    }

    #[test]
    fn date_round_trips_across_separator_styles() {
        let expected = NaiveDate::from_ymd_opt(1990, 1, 15);
        assert_eq!(normalize_date_text("01/15/1990"), expected);
        assert_eq!(normalize_date_text("01-15-1990"), expected);
        assert_eq!(normalize_date_text("01.15.1990"), expected);
        assert_eq!(normalize_date_text("1990-01-15"), expected);
        assert_eq!(normalize_date_text("01151990"), expected);
    }

    #[test]
    fn day_first_salvaged_when_month_slot_overflows() {
        // 15 cannot be a month, so the parts must be day-first.
        assert_eq!(
            normalize_date_text("15/01/1990"),
            NaiveDate::from_ymd_opt(1990, 1, 15)
        );
    }

    #[test]
    fn two_digit_years_pivot() {
        assert_eq!(
            normalize_date_text("03/04/98"),
            NaiveDate::from_ymd_opt(1998, 3, 4)
        );
        assert_eq!(
            normalize_date_text("03/04/24"),
            NaiveDate::from_ymd_opt(2024, 3, 4)
        );
    }

    #[test]
    fn month_names_accepted() {
        assert_eq!(
            normalize_date_text("15 JAN 1990"),
            NaiveDate::from_ymd_opt(1990, 1, 15)
        );
    }

    #[test]
    fn garbage_dates_rejected() {
        assert_eq!(normalize_date_text("13/45/1990"), None);
        assert_eq!(normalize_date_text("NOT A DATE"), None);
        assert_eq!(parse_compact_date("9912"), None);
    }

    #[test]
    fn height_forms_agree() {
        let from_inches = parse_height("069 in").unwrap();
        let from_feet = parse_height("5'-09\"").unwrap();
        assert!((from_inches - from_feet).abs() < 0.01);
        assert!((parse_height("175 cm").unwrap() - 175.0).abs() < f64::EPSILON);
    }

    #[test]
    fn weight_converts_pounds() {
        let kg = weight_from_pounds("185").unwrap();
        assert!((kg - 83.91).abs() < 0.01);
        assert!(weight_from_pounds("5000").is_none());
        let kg = parse_weight_text("84 kg").unwrap();
        assert!((kg - 84.0).abs() < f64::EPSILON);
    }

    #[test]
    fn name_suffix_split_off() {
        assert_eq!(
            clean_name("Doe,  Jr"),
            ("DOE".to_string(), Some("JR".to_string()))
        );
        assert_eq!(clean_name("  de la  Cruz "), ("DE LA CRUZ".to_string(), None));
        assert_eq!(
            clean_name("SMITH III"),
            ("SMITH".to_string(), Some("III".to_string()))
        );
    }
}
