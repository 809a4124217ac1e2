// Character-level OCR error correction for fields with a known expected
// shape. Free-form text such as names is never run through these tables;
// a legitimate "O" in a surname must not become a zero.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::models::RegionRule;

/// Shape classes a correction can be anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldShape {
    DocumentNumber,
    Date,
    PostalCode,
}

lazy_static! {
    // Confusions resolved toward digits, for positions that must be numeric.
    static ref ALPHA_TO_DIGIT: HashMap<char, char> = {
        let mut m = HashMap::new();
        m.insert('O', '0');
        m.insert('Q', '0');
        m.insert('I', '1');
        m.insert('L', '1');
        m.insert('Z', '2');
        m.insert('S', '5');
        m.insert('G', '6');
        m.insert('B', '8');
        m
    };

    // Confusions resolved toward letters, for positions that must be alpha.
    static ref DIGIT_TO_ALPHA: HashMap<char, char> = {
        let mut m = HashMap::new();
        m.insert('0', 'O');
        m.insert('1', 'I');
        m.insert('2', 'Z');
        m.insert('5', 'S');
        m.insert('6', 'G');
        m.insert('8', 'B');
        m
    };
}

/// Correct a shaped field. Document numbers consult the region's number
/// template when one exists; dates and postal codes are digit-dominant
/// everywhere.
pub fn correct_shaped(text: &str, shape: FieldShape, region: Option<&RegionRule>) -> String {
    match shape {
        FieldShape::DocumentNumber => {
            correct_document_number(text, region.and_then(|r| r.number_template))
        }
        FieldShape::Date => correct_date(text),
        FieldShape::PostalCode => correct_digits_only(text),
    }
}

/// Apply a region's `A`/`#` template position-by-position; without a
/// template, only resolve characters inside digit runs.
fn correct_document_number(text: &str, template: Option<&str>) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    match template {
        Some(template) if template.len() == cleaned.len() => cleaned
            .chars()
            .zip(template.chars())
            .map(|(c, slot)| match slot {
                '#' => *ALPHA_TO_DIGIT.get(&c).unwrap_or(&c),
                'A' => *DIGIT_TO_ALPHA.get(&c).unwrap_or(&c),
                _ => c,
            })
            .collect(),
        _ => correct_in_digit_runs(&cleaned),
    }
}

/// Resolve a confusable letter to its digit only when both neighbors are
/// digits, so mixed alphanumeric serials survive untouched.
fn correct_in_digit_runs(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut corrected = String::with_capacity(chars.len());
    for (i, &c) in chars.iter().enumerate() {
        let prev_digit = i > 0 && chars[i - 1].is_ascii_digit();
        let next_digit = i + 1 < chars.len() && chars[i + 1].is_ascii_digit();
        if prev_digit && next_digit {
            corrected.push(*ALPHA_TO_DIGIT.get(&c).unwrap_or(&c));
        } else {
            corrected.push(c);
        }
    }
    corrected
}

fn correct_date(text: &str) -> String {
    text.chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if c == '|' {
                '/'
            } else {
                *ALPHA_TO_DIGIT.get(&c).unwrap_or(&c)
            }
        })
        .filter(|c| c.is_ascii_digit() || matches!(c, '/' | '-' | '.' | ' '))
        .collect::<String>()
        .trim()
        .to_string()
}

fn correct_digits_only(text: &str) -> String {
    text.chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            *ALPHA_TO_DIGIT.get(&c).unwrap_or(&c)
        })
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::REGION_RULES;

    #[test]
    fn template_fixes_both_directions() {
        let ca = REGION_RULES.rule_for("CA");
        // Leading digit becomes a letter, embedded letters become digits.
        assert_eq!(
            correct_shaped("01Z345B7", FieldShape::DocumentNumber, Some(ca)),
            "O1234587"
        );
        assert_eq!(
            correct_shaped("DI23456O", FieldShape::DocumentNumber, Some(ca)),
            "D1234560"
        );
    }

    #[test]
    fn no_template_only_touches_digit_runs() {
        let wa = REGION_RULES.rule_for("WA");
        // The serial's alpha block stays alpha; only a letter sandwiched
        // between digits is resolved.
        assert_eq!(
            correct_shaped("WDLABCD1O345", FieldShape::DocumentNumber, Some(wa)),
            "WDLABCD10345"
        );
    }

    #[test]
    fn date_correction_resolves_confusables() {
        assert_eq!(correct_shaped("O1/I5/2O22", FieldShape::Date, None), "01/15/2022");
        assert_eq!(correct_shaped("Ol|I5|1990", FieldShape::Date, None), "01/15/1990");
    }

    #[test]
    fn postal_correction_digits_only() {
        assert_eq!(correct_shaped("9S8I4", FieldShape::PostalCode, None), "95814");
        assert_eq!(correct_shaped("95814-1234", FieldShape::PostalCode, None), "95814-1234");
    }

    #[test]
    fn length_mismatch_skips_template() {
        let ca = REGION_RULES.rule_for("CA");
        // Too short for the template; generic run correction applies.
        assert_eq!(
            correct_shaped("1O3", FieldShape::DocumentNumber, Some(ca)),
            "103"
        );
    }
}
