// Structured payload parser for the fixed-grammar barcode record: an
// `@`-led envelope, an "ANSI " file signature, issuer number, subfile
// designators, and LF-separated three-letter element records with 8-digit
// embedded dates.

use std::collections::HashMap;

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::models::{NormalizedRecord, ParseResult, Sex, REGION_RULES};
use crate::processing::normalize;
use crate::utils::ScanError;

/// Highest envelope version accepted. Newer minor revisions keep the same
/// grammar, so anything in range parses; the version is surfaced in
/// `raw_elements` for diagnostics.
const MAX_TOLERATED_VERSION: u32 = 99;

lazy_static! {
    static ref SUBFILE_DESIGNATOR: Regex = Regex::new(r"^[A-Z]{2}\d{8}$").unwrap();
    static ref ELEMENT_CODE: Regex = Regex::new(r"^[A-Z]{3}$").unwrap();
}

/// Element codes that are recognized but carry no record field; they are
/// preserved in the overflow map instead of failing the parse.
const KNOWN_UNMAPPED: &[&str] = &[
    "DCF", // document discriminator
    "DCK", // inventory control number
    "DDB", // card revision date
    "DDC", // hazmat endorsement expiry
    "DDD", // limited-duration indicator
    "DAH", // address line 2
    "DCI", // place of birth
    "DCJ", // audit information
    "DCL", // race / ethnicity
    "DCE", // weight range
    "DDE", // family-name truncation flag
    "DDF", // first-name truncation flag
    "DDG", // middle-name truncation flag
    "DDH", // under-18 until
    "DDI", // under-19 until
    "DDJ", // under-21 until
];

pub struct BarcodeParser;

impl Default for BarcodeParser {
    fn default() -> Self {
        BarcodeParser
    }
}

impl BarcodeParser {
    pub fn new() -> Self {
        BarcodeParser
    }

    /// Decode a structured payload into a normalized record.
    ///
    /// Pure function: no shared state, safe to call concurrently for
    /// independent inputs. Envelope violations reject the whole payload;
    /// a valid envelope with unmappable content fails with `ParsingFailed`
    /// and never yields a partial record.
    pub fn parse(&self, payload: &str) -> ParseResult {
        let body = match Self::validate_envelope(payload) {
            Ok(body) => body,
            Err(e) => return ParseResult::failure(e),
        };

        let mut raw_elements = body.version_tag;
        let elements = Self::split_elements(body.data);
        if elements.is_empty() {
            return ParseResult::failure(ScanError::ParsingFailed(
                "payload contains no element records".into(),
            ));
        }

        let mut record = NormalizedRecord::default();
        let mut field_confidence = HashMap::new();
        let mut mapped = 0usize;

        for (code, value) in elements {
            if value.is_empty() || value == "NONE" || value.eq_ignore_ascii_case("unavl") {
                continue;
            }
            match Self::apply_element(&mut record, &code, &value) {
                Applied::Mapped(field) => {
                    mapped += 1;
                    field_confidence.insert(field.to_string(), 1.0);
                }
                Applied::Overflow => {
                    raw_elements.insert(code, value);
                }
                Applied::Dropped(reason) => {
                    debug!("dropping element {}: {}", code, reason);
                    raw_elements.insert(code, value);
                }
                Applied::UnknownRequired => {
                    return ParseResult::failure(ScanError::ParsingFailed(format!(
                        "unrecognized required element '{}'",
                        code
                    )));
                }
            }
        }

        if mapped == 0 {
            return ParseResult::failure(ScanError::ParsingFailed(
                "no element could be mapped to a record field".into(),
            ));
        }

        Self::enforce_number_shape(&mut record, &mut field_confidence, &mut raw_elements);

        debug!("structured parse mapped {} elements", mapped);
        ParseResult::completed(record, field_confidence, 1.0, raw_elements)
    }

    fn validate_envelope(payload: &str) -> Result<EnvelopeBody<'_>, ScanError> {
        if !payload.starts_with('@') {
            return Err(ScanError::InvalidFormat(
                "missing compliance marker".into(),
            ));
        }
        let signature_at = payload
            .find("ANSI ")
            .or_else(|| payload.find("AAMVA"))
            .ok_or_else(|| ScanError::InvalidFormat("missing file type signature".into()))?;
        if signature_at > 8 {
            return Err(ScanError::InvalidFormat(
                "file type signature out of place".into(),
            ));
        }
        let header = &payload[signature_at + 5..];
        let (issuer, version_digits) = match (header.get(..6), header.get(6..8)) {
            (Some(issuer), Some(version)) => (issuer, version),
            _ => return Err(ScanError::InvalidFormat("truncated header".into())),
        };
        if !issuer.chars().all(|c| c.is_ascii_digit()) {
            return Err(ScanError::InvalidFormat(
                "issuer identification number must be numeric".into(),
            ));
        }
        let version: u32 = version_digits
            .parse()
            .map_err(|_| ScanError::InvalidFormat("version marker must be numeric".into()))?;
        if version == 0 || version > MAX_TOLERATED_VERSION {
            return Err(ScanError::InvalidFormat(format!(
                "unsupported version marker {:?}",
                version_digits
            )));
        }

        let mut version_tag = HashMap::new();
        version_tag.insert("issuer_id".to_string(), issuer.to_string());
        version_tag.insert("payload_version".to_string(), format!("{:02}", version));

        let rest = header.get(8..).unwrap_or("");
        let data = Self::skip_designators(rest, version).unwrap_or_else(|| {
            // Designator block is malformed; fall back to locating the
            // first subfile marker so newer layouts still parse.
            rest.find("DL")
                .or_else(|| rest.find("ID"))
                .map(|at| &rest[at..])
                .unwrap_or(rest)
        });

        Ok(EnvelopeBody { version_tag, data })
    }

    /// Walk the fixed-width subfile designator block. Versions from 2 on
    /// carry a jurisdiction version before the entry count.
    fn skip_designators(rest: &str, version: u32) -> Option<&str> {
        let mut cursor = rest;
        if version >= 2 {
            if !cursor.get(..2)?.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            cursor = cursor.get(2..)?;
        }
        let entries: usize = cursor.get(..2)?.parse().ok()?;
        if entries == 0 {
            return None;
        }
        cursor = cursor.get(2..)?;
        let block = entries.checked_mul(10)?;
        for i in 0..entries {
            if !SUBFILE_DESIGNATOR.is_match(cursor.get(i * 10..(i + 1) * 10)?) {
                return None;
            }
        }
        cursor.get(block..)
    }

    fn split_elements(data: &str) -> Vec<(String, String)> {
        let mut elements = Vec::new();
        for (i, segment) in data.split(|c| c == '\n' || c == '\r').enumerate() {
            let mut segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            // The first record of a subfile leads with its two-letter
            // subfile type glued to the first element code.
            if i == 0 && (segment.starts_with("DL") || segment.starts_with("ID")) {
                if let Some(stripped) = segment.get(2..) {
                    if stripped
                        .get(..3)
                        .map(|code| code.chars().all(|c| c.is_ascii_uppercase()))
                        .unwrap_or(false)
                    {
                        segment = stripped;
                    }
                }
            }
            let (Some(code), Some(value)) = (segment.get(..3), segment.get(3..)) else {
                debug!("skipping stray fragment {:?}", segment);
                continue;
            };
            if !ELEMENT_CODE.is_match(code) {
                debug!("skipping malformed element line {:?}", segment);
                continue;
            }
            elements.push((code.to_string(), value.trim().to_string()));
        }
        elements
    }

    fn apply_element(record: &mut NormalizedRecord, code: &str, value: &str) -> Applied {
        match code {
            "DAQ" => {
                record.document_number = Some(value.to_uppercase());
                Applied::Mapped("document_number")
            }
            "DCS" => {
                let (name, suffix) = normalize::clean_name(value);
                record.last_name = Some(name);
                if record.name_suffix.is_none() {
                    record.name_suffix = suffix;
                }
                Applied::Mapped("last_name")
            }
            "DAC" => {
                record.first_name = Some(normalize::clean_name(value).0);
                Applied::Mapped("first_name")
            }
            "DAD" => {
                record.middle_name = Some(normalize::clean_name(value).0);
                Applied::Mapped("middle_name")
            }
            "DCU" => {
                record.name_suffix = Some(value.to_uppercase());
                Applied::Mapped("name_suffix")
            }
            "DBB" => match normalize::parse_compact_date(value) {
                Some(date) => {
                    record.date_of_birth = Some(date);
                    Applied::Mapped("date_of_birth")
                }
                None => Applied::Dropped("unparseable date of birth"),
            },
            "DBD" => match normalize::parse_compact_date(value) {
                Some(date) => {
                    record.issue_date = Some(date);
                    Applied::Mapped("issue_date")
                }
                None => Applied::Dropped("unparseable issue date"),
            },
            "DBA" => match normalize::parse_compact_date(value) {
                Some(date) => {
                    record.expiry_date = Some(date);
                    Applied::Mapped("expiry_date")
                }
                None => Applied::Dropped("unparseable expiry date"),
            },
            "DBC" => {
                record.sex = Some(match value {
                    "1" | "M" => Sex::Male,
                    "2" | "F" => Sex::Female,
                    _ => Sex::Unspecified,
                });
                Applied::Mapped("sex")
            }
            "DAU" => match normalize::parse_height(value) {
                Some(cm) => {
                    record.height_cm = Some(cm);
                    Applied::Mapped("height_cm")
                }
                None => Applied::Dropped("unparseable height"),
            },
            "DAW" => match normalize::weight_from_pounds(value) {
                Some(kg) => {
                    record.weight_kg = Some(kg);
                    Applied::Mapped("weight_kg")
                }
                None => Applied::Dropped("unparseable weight"),
            },
            "DAX" => match value.trim().parse::<f64>() {
                Ok(kg) if (10.0..=400.0).contains(&kg) => {
                    record.weight_kg = Some(kg);
                    Applied::Mapped("weight_kg")
                }
                _ => Applied::Dropped("unparseable metric weight"),
            },
            "DAY" => {
                record.eye_color = Some(value.to_uppercase());
                Applied::Mapped("eye_color")
            }
            "DAZ" => {
                record.hair_color = Some(value.to_uppercase());
                Applied::Mapped("hair_color")
            }
            "DAG" => {
                record.street = Some(value.to_uppercase());
                Applied::Mapped("street")
            }
            "DAI" => {
                record.city = Some(value.to_uppercase());
                Applied::Mapped("city")
            }
            "DAJ" => {
                let region = value.to_uppercase();
                record.region = Some(region.clone());
                record.issuing_region = Some(region);
                Applied::Mapped("issuing_region")
            }
            "DAK" => {
                record.postal_code = Some(value.split_whitespace().collect::<String>());
                Applied::Mapped("postal_code")
            }
            "DCG" => {
                record.country = Some(value.to_uppercase());
                Applied::Mapped("country")
            }
            "DCA" => {
                record.document_class = Some(value.to_uppercase());
                Applied::Mapped("document_class")
            }
            "DCB" => {
                record.restriction_codes = Some(value.to_uppercase());
                Applied::Mapped("restriction_codes")
            }
            "DCD" => {
                record.endorsement_codes = Some(value.to_uppercase());
                Applied::Mapped("endorsement_codes")
            }
            "DDK" => {
                record.organ_donor = Some(value == "1");
                Applied::Mapped("organ_donor")
            }
            "DDL" => {
                record.veteran = Some(value == "1");
                Applied::Mapped("veteran")
            }
            "DDA" => {
                record.enhanced_credential = Some(value == "F");
                Applied::Mapped("enhanced_credential")
            }
            _ if code.starts_with('Z') => Applied::Overflow,
            _ if KNOWN_UNMAPPED.contains(&code) => Applied::Overflow,
            _ => Applied::UnknownRequired,
        }
    }

    /// A document number that does not fit the issuing region's shape is
    /// dropped from the record (kept in the overflow map), never returned
    /// malformed.
    fn enforce_number_shape(
        record: &mut NormalizedRecord,
        field_confidence: &mut HashMap<String, f64>,
        raw_elements: &mut HashMap<String, String>,
    ) {
        let Some(number) = record.document_number.clone() else {
            return;
        };
        let rule = record
            .issuing_region
            .as_deref()
            .map(|code| REGION_RULES.rule_for(code))
            .unwrap_or_else(|| REGION_RULES.default_rule());
        if !rule.number_matches(&number) {
            warn!(
                "document number {:?} fails the {} shape check; dropping field",
                number, rule.name
            );
            record.document_number = None;
            field_confidence.remove("document_number");
            raw_elements.insert("DAQ".to_string(), number);
        }
    }
}

struct EnvelopeBody<'a> {
    version_tag: HashMap<String, String>,
    data: &'a str,
}

enum Applied {
    Mapped(&'static str),
    Overflow,
    Dropped(&'static str),
    UnknownRequired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_payload() -> String {
        let subfile = "DLDAQD1234567\nDCSDOE\nDACJOHN\nDADQUINCY\nDBB01151990\nDBD06012020\n\
                       DBA06012028\nDBC1\nDAU069 in\nDAW185\nDAYBRO\nDAZBLK\nDAG123 MAIN ST\n\
                       DAISACRAMENTO\nDAJCA\nDAK95814\nDCGUSA\nDCAC\nDCBNONE\nDCDNONE\nDDK1\n\
                       DCFABC123XYZ\rZCZCAJURISDATA\r";
        format!("@\n\x1e\rANSI 636014090002DL00410278ZC03190008{}", subfile)
    }

    fn parse(payload: &str) -> ParseResult {
        BarcodeParser::new().parse(payload)
    }

    #[test]
    fn rejects_payload_without_compliance_marker() {
        let result = parse("BADDATA");
        assert!(!result.success);
        assert!(result.record.is_none());
        assert_eq!(result.error.unwrap().code(), "invalid_format");
    }

    #[test]
    fn rejects_missing_signature() {
        let result = parse("@\n\x1e\rNOPE 636014090002");
        assert_eq!(result.error.unwrap().code(), "invalid_format");
    }

    #[test]
    fn parses_well_formed_payload() {
        let result = parse(&sample_payload());
        assert!(result.success, "error: {:?}", result.error);
        let record = result.record.unwrap();
        assert_eq!(record.first_name.as_deref(), Some("JOHN"));
        assert_eq!(record.last_name.as_deref(), Some("DOE"));
        assert_eq!(record.document_number.as_deref(), Some("D1234567"));
        assert_eq!(
            record.date_of_birth,
            NaiveDate::from_ymd_opt(1990, 1, 15)
        );
        assert_eq!(
            record.expiry_date,
            NaiveDate::from_ymd_opt(2028, 6, 1)
        );
        assert_eq!(record.sex, Some(Sex::Male));
        assert_eq!(record.issuing_region.as_deref(), Some("CA"));
        assert_eq!(record.postal_code.as_deref(), Some("95814"));
        assert_eq!(record.organ_donor, Some(true));
        let height = record.height_cm.unwrap();
        assert!((height - 175.26).abs() < 0.01);
        // "NONE" marks an absent value, not an empty string.
        assert_eq!(record.restriction_codes, None);
    }

    #[test]
    fn preserves_unknown_optional_elements() {
        let result = parse(&sample_payload());
        assert_eq!(
            result.raw_elements.get("DCF").map(String::as_str),
            Some("ABC123XYZ")
        );
        // Jurisdiction-namespace element from the second subfile.
        assert_eq!(
            result.raw_elements.get("ZCZ").map(String::as_str),
            Some("CAJURISDATA")
        );
        assert_eq!(
            result.raw_elements.get("payload_version").map(String::as_str),
            Some("09")
        );
    }

    #[test]
    fn unknown_required_element_fails_the_parse() {
        let payload = format!(
            "@\n\x1e\rANSI 636014090001DL00410050{}",
            "DLDAQD1234567\nQQQSOMETHING\nDCSDOE\r"
        );
        let result = parse(&payload);
        assert!(!result.success);
        assert!(result.record.is_none());
        assert_eq!(result.error.unwrap().code(), "parsing_failed");
    }

    #[test]
    fn region_shape_violation_drops_number_not_parse() {
        // An eight-digit number is Texas-shaped, not California-shaped.
        let payload = format!(
            "@\n\x1e\rANSI 636014090001DL00410050{}",
            "DLDAQ12345678\nDCSDOE\nDACJOHN\nDAJCA\r"
        );
        let result = parse(&payload);
        assert!(result.success);
        let record = result.record.unwrap();
        assert_eq!(record.document_number, None);
        assert_eq!(
            result.raw_elements.get("DAQ").map(String::as_str),
            Some("12345678")
        );
        assert_eq!(record.last_name.as_deref(), Some("DOE"));
    }

    #[test]
    fn tolerates_future_version_markers() {
        let payload = format!(
            "@\n\x1e\rANSI 636014990001DL00410050{}",
            "DLDAQD1234567\nDCSDOE\nDAJCA\r"
        );
        let result = parse(&payload);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(
            result.raw_elements.get("payload_version").map(String::as_str),
            Some("99")
        );
    }

    #[test]
    fn malformed_designators_fall_back_to_subfile_scan() {
        // Garbled designator area, but the subfile itself is intact.
        let payload = "@\n\x1e\rANSI 636014090junkDLDAQD1234567\nDCSDOE\nDAJCA\r";
        let result = parse(payload);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(
            result.record.unwrap().document_number.as_deref(),
            Some("D1234567")
        );
    }

    #[test]
    fn valid_envelope_with_no_elements_is_parsing_failed() {
        let result = parse("@\n\x1e\rANSI 63601409");
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code(), "parsing_failed");
    }

    #[test]
    fn name_suffix_split_from_family_name() {
        let payload = format!(
            "@\n\x1e\rANSI 636014090001DL00410050{}",
            "DLDAQD1234567\nDCSDOE JR\nDACJOHN\nDAJCA\r"
        );
        let record = parse(&payload).record.unwrap();
        assert_eq!(record.last_name.as_deref(), Some("DOE"));
        assert_eq!(record.name_suffix.as_deref(), Some("JR"));
    }
}
