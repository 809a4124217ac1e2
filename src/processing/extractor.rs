// Free-text field extractor: turns uncertain OCR observations into a
// normalized record via spatial line assembly, label-anchored pattern
// matching, region rule selection, shaped-field error correction, and
// confidence aggregation.

use std::collections::HashMap;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::models::{
    NormalizedRecord, ParseResult, RegionRule, Sex, TextObservation, REGION_RULES,
};
use crate::processing::correction::{correct_shaped, FieldShape};
use crate::processing::normalize;
use crate::utils::ScanError;

/// Fields that make a record usable at all. Recovering fewer than
/// `MIN_REQUIRED_FIELDS` of them is `InsufficientData`.
const REQUIRED_FIELDS: &[&str] = &[
    "first_name",
    "last_name",
    "document_number",
    "date_of_birth",
];
const MIN_REQUIRED_FIELDS: usize = 2;

/// Weight of a required field in the overall confidence aggregate,
/// relative to weight 1.0 for everything else.
const REQUIRED_FIELD_WEIGHT: f64 = 2.0;

/// Match strength for label-anchored hits versus positional fallbacks.
const LABELED_STRENGTH: f64 = 1.0;
const FALLBACK_STRENGTH: f64 = 0.7;

lazy_static! {
    static ref DOC_NUMBER_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(?:DL|LIC|LICENSE|ID)\s*(?:NO|NUM|NUMBER)?\.?\s*[:#]?\s+([A-Z0-9]{4,15})\b").unwrap(),
        Regex::new(r"(?i)\b(?:DL|LIC|LICENSE|ID)\s*(?:NO|NUM|NUMBER|#)\.?\s*[:#]?\s*([A-Z0-9]{4,15})\b").unwrap(),
        Regex::new(r"(?i)\bDOCUMENT\s*(?:NO|NUMBER)?\.?\s*[:#]?\s*([A-Z0-9]{4,15})\b").unwrap(),
    ];
    // Name captures admit digits: an OCR zero in "D0E" must survive to the
    // record untouched rather than be lost at the match stage.
    static ref LAST_NAME_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(?:LN|LAST\s*NAME|FAMILY\s*NAME|SURNAME)\s*[:#]?\s+([A-Z0-9][A-Z0-9' \-]+)").unwrap(),
    ];
    static ref FIRST_NAME_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(?:FN|FIRST\s*NAME|GIVEN\s*NAMES?)\s*[:#]?\s+([A-Z0-9][A-Z0-9' \-]+)").unwrap(),
    ];
    static ref DOB_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(?:DOB|DATE\s+OF\s+BIRTH|BIRTH\s*DATE)\s*[:#]?\s*([0-9A-Z|/.\- ]{6,14})").unwrap(),
    ];
    static ref EXPIRY_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(?:EXP|EXPIRES|EXPIRATION(?:\s*DATE)?)\s*[:#]?\s*([0-9A-Z|/.\- ]{6,14})").unwrap(),
    ];
    static ref ISSUE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(?:ISS|ISSUED|ISSUE\s*DATE)\s*[:#]?\s*([0-9A-Z|/.\- ]{6,14})").unwrap(),
    ];
    static ref SEX_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\bSEX\s*[:#]?\s*([MF12])\b").unwrap(),
    ];
    static ref HEIGHT_PATTERNS: Vec<Regex> = vec![
        Regex::new(r#"(?i)\bHGT\s*[:#]?\s*([0-9OILSZB'" \-]{2,9})"#).unwrap(),
        Regex::new(r"(?i)\bHEIGHT\s*[:#]?\s*([0-9OILSZB'\x22 \-]{2,9})").unwrap(),
    ];
    static ref WEIGHT_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(?:WGT|WEIGHT)\s*[:#]?\s*([0-9OILSZB]{2,3})\s*(?:LBS?)?\b").unwrap(),
    ];
    static ref EYES_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\bEYES?\s*[:#]?\s*([A-Z]{3})\b").unwrap(),
    ];
    static ref HAIR_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\bHAIR\s*[:#]?\s*([A-Z]{3})\b").unwrap(),
    ];
    static ref CLASS_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\bCLASS\s*[:#]?\s*([A-Z0-9]{1,3})\b").unwrap(),
    ];
    static ref RESTRICTION_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\bREST(?:RICTIONS)?\s*[:#]?\s*([A-Z0-9][A-Z0-9, ]{0,9})").unwrap(),
    ];
    static ref ENDORSEMENT_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\bEND(?:ORSEMENTS)?\s*[:#]?\s*([A-Z0-9][A-Z0-9, ]{0,9})").unwrap(),
    ];
    static ref DONOR_PATTERN: Regex = Regex::new(r"(?i)\b(?:ORGAN\s+)?DONOR\b").unwrap();
    static ref VETERAN_PATTERN: Regex = Regex::new(r"(?i)\bVETERAN\b").unwrap();
    static ref STREET_PATTERN: Regex =
        Regex::new(r"(?i)^\d+\s+[A-Z0-9 .]+\b(?:ST|STREET|AVE|AVENUE|BLVD|RD|ROAD|DR|DRIVE|LN|LANE|WAY|CT|COURT)\b\.?$").unwrap();
    static ref CITY_STATE_ZIP: Regex =
        Regex::new(r"^([A-Z .'\-]{2,}?)[, ]+([A-Z]{2})\s+(\d{5}(?:-\d{4})?)$").unwrap();
    static ref COMMA_NAME: Regex =
        Regex::new(r"^([A-Z][A-Z'\-]{1,}),\s*([A-Z][A-Z'\-]{1,})(?:\s+([A-Z][A-Z'\-]*))?$").unwrap();
    static ref POSTAL_SHAPE: Regex = Regex::new(r"^\d{5}(-\d{4})?$").unwrap();
}

/// One spatial line assembled from adjacent observations.
#[derive(Debug, Clone)]
struct Line {
    text: String,
    confidence: f64,
}

/// A candidate value for a record field, with the evidence that produced it.
#[derive(Debug, Clone)]
struct Candidate {
    value: String,
    confidence: f64,
    line_index: usize,
}

pub struct FreeTextExtractor {
    confidence_threshold: f64,
}

impl FreeTextExtractor {
    pub fn new(confidence_threshold: f64) -> Self {
        FreeTextExtractor {
            confidence_threshold,
        }
    }

    /// Extract a record from OCR observations.
    ///
    /// Idempotent: the extractor holds no per-call state, so identical
    /// observations always yield an identical result.
    pub fn parse(
        &self,
        observations: &[TextObservation],
        region_hint: Option<&str>,
    ) -> ParseResult {
        if observations.is_empty() {
            return ParseResult::failure(ScanError::InsufficientData {
                recovered: 0,
                required: MIN_REQUIRED_FIELDS,
            });
        }

        let lines = assemble_lines(observations);
        let full_text = lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut candidates = extract_candidates(&lines);

        let rule = self.select_region(region_hint, &full_text, &candidates);
        debug!("free-text extraction using {} rules", rule.name);

        correct_and_validate(&mut candidates, rule);

        let (record, field_confidence) = build_record(&candidates, rule);

        let recovered_required = REQUIRED_FIELDS
            .iter()
            .filter(|f| field_confidence.contains_key(**f))
            .count();
        if recovered_required < MIN_REQUIRED_FIELDS {
            return ParseResult::failure(ScanError::InsufficientData {
                recovered: recovered_required,
                required: MIN_REQUIRED_FIELDS,
            });
        }

        let overall = overall_confidence(&field_confidence)
            * layout_adherence_factor(&candidates, rule);
        if overall < self.confidence_threshold {
            let mut result = ParseResult::failure(ScanError::LowConfidence {
                confidence: overall,
                threshold: self.confidence_threshold,
            });
            // Field evidence is kept for diagnostics even when the record
            // itself is withheld.
            result.field_confidence = field_confidence;
            result.overall_confidence = overall;
            return result;
        }

        ParseResult::completed(record, field_confidence, overall, HashMap::new())
    }

    /// Region rule selection: explicit hint, then jurisdiction text, then
    /// document-number shape, then the generic default.
    fn select_region(
        &self,
        region_hint: Option<&str>,
        full_text: &str,
        candidates: &HashMap<&'static str, Candidate>,
    ) -> &'static RegionRule {
        if let Some(hint) = region_hint {
            if REGION_RULES.is_known(hint) {
                return REGION_RULES.rule_for(hint);
            }
            debug!("ignoring unknown region hint {:?}", hint);
        }
        if let Some(rule) = REGION_RULES.detect_in_text(full_text) {
            return rule;
        }
        if let Some(candidate) = candidates.get("document_number") {
            let generic = correct_shaped(&candidate.value, FieldShape::DocumentNumber, None);
            if let Some(rule) = REGION_RULES.detect_by_number_shape(&generic) {
                return rule;
            }
        }
        REGION_RULES.default_rule()
    }
}

fn assemble_lines(observations: &[TextObservation]) -> Vec<Line> {
    let mut sorted: Vec<&TextObservation> = observations.iter().collect();
    sorted.sort_by(|a, b| {
        a.bounds
            .center_y()
            .partial_cmp(&b.bounds.center_y())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mean_height = sorted
        .iter()
        .map(|o| o.bounds.height)
        .sum::<f64>()
        / sorted.len() as f64;
    let tolerance = (mean_height * 0.6).max(0.015);

    let mut rows: Vec<Vec<&TextObservation>> = Vec::new();
    for obs in sorted {
        match rows.last_mut() {
            Some(row)
                if (obs.bounds.center_y() - row[0].bounds.center_y()).abs() <= tolerance =>
            {
                row.push(obs);
            }
            _ => rows.push(vec![obs]),
        }
    }

    rows.into_iter()
        .map(|mut row| {
            row.sort_by(|a, b| {
                a.bounds
                    .center_x()
                    .partial_cmp(&b.bounds.center_x())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let text = row
                .iter()
                .map(|o| o.text.trim())
                .collect::<Vec<_>>()
                .join(" ");
            // Weight token confidence by its share of the line's text.
            let total_len: usize = row.iter().map(|o| o.text.len()).sum();
            let confidence = if total_len == 0 {
                0.0
            } else {
                row.iter()
                    .map(|o| o.confidence * o.text.len() as f64)
                    .sum::<f64>()
                    / total_len as f64
            };
            Line { text, confidence }
        })
        .collect()
}

fn offer(
    candidates: &mut HashMap<&'static str, Candidate>,
    field: &'static str,
    value: String,
    confidence: f64,
    line_index: usize,
) {
    let value = value.trim().to_string();
    if value.is_empty() {
        return;
    }
    let better = candidates
        .get(field)
        .map(|existing| confidence > existing.confidence)
        .unwrap_or(true);
    if better {
        candidates.insert(
            field,
            Candidate {
                value,
                confidence,
                line_index,
            },
        );
    }
}

fn extract_candidates(lines: &[Line]) -> HashMap<&'static str, Candidate> {
    let mut candidates: HashMap<&'static str, Candidate> = HashMap::new();

    for (index, line) in lines.iter().enumerate() {
        let text = line.text.to_uppercase();
        let labeled = line.confidence * LABELED_STRENGTH;
        let fallback = line.confidence * FALLBACK_STRENGTH;

        for (field, patterns) in [
            ("document_number", &*DOC_NUMBER_PATTERNS),
            ("last_name", &*LAST_NAME_PATTERNS),
            ("first_name", &*FIRST_NAME_PATTERNS),
            ("date_of_birth", &*DOB_PATTERNS),
            ("expiry_date", &*EXPIRY_PATTERNS),
            ("issue_date", &*ISSUE_PATTERNS),
            ("sex", &*SEX_PATTERNS),
            ("height_cm", &*HEIGHT_PATTERNS),
            ("weight_kg", &*WEIGHT_PATTERNS),
            ("eye_color", &*EYES_PATTERNS),
            ("hair_color", &*HAIR_PATTERNS),
            ("document_class", &*CLASS_PATTERNS),
            ("restriction_codes", &*RESTRICTION_PATTERNS),
            ("endorsement_codes", &*ENDORSEMENT_PATTERNS),
        ] {
            for pattern in patterns.iter() {
                if let Some(caps) = pattern.captures(&text) {
                    if let Some(m) = caps.get(1) {
                        offer(&mut candidates, field, m.as_str().to_string(), labeled, index);
                        break;
                    }
                }
            }
        }

        if DONOR_PATTERN.is_match(&text) {
            offer(&mut candidates, "organ_donor", "1".into(), labeled, index);
        }
        if VETERAN_PATTERN.is_match(&text) {
            offer(&mut candidates, "veteran", "1".into(), labeled, index);
        }
        if STREET_PATTERN.is_match(&text) {
            offer(&mut candidates, "street", text.clone(), fallback, index);
        }
        if let Some(caps) = CITY_STATE_ZIP.captures(&text) {
            offer(&mut candidates, "city", caps[1].to_string(), fallback, index);
            offer(&mut candidates, "region", caps[2].to_string(), fallback, index);
            offer(&mut candidates, "postal_code", caps[3].to_string(), fallback, index);
        }
        // "DOE, JOHN Q" with no label at all.
        if !candidates.contains_key("last_name") {
            if let Some(caps) = COMMA_NAME.captures(&text) {
                offer(&mut candidates, "last_name", caps[1].to_string(), fallback, index);
                offer(&mut candidates, "first_name", caps[2].to_string(), fallback, index);
                if let Some(middle) = caps.get(3) {
                    offer(
                        &mut candidates,
                        "middle_name",
                        middle.as_str().to_string(),
                        fallback,
                        index,
                    );
                }
            }
        }
    }

    candidates
}

/// Apply character-level correction to fields with a known expected shape
/// and drop values that still fail validation afterwards. Name fields are
/// deliberately left alone.
fn correct_and_validate(candidates: &mut HashMap<&'static str, Candidate>, rule: &RegionRule) {
    if let Some(candidate) = candidates.get_mut("document_number") {
        candidate.value =
            correct_shaped(&candidate.value, FieldShape::DocumentNumber, Some(rule));
    }
    let number_ok = candidates
        .get("document_number")
        .map(|c| rule.number_matches(&c.value))
        .unwrap_or(false);
    if !number_ok {
        if let Some(dropped) = candidates.remove("document_number") {
            debug!(
                "document number {:?} fails the {} shape check; dropping field",
                dropped.value, rule.name
            );
        }
    }

    for field in ["date_of_birth", "expiry_date", "issue_date"] {
        if let Some(candidate) = candidates.get_mut(field) {
            candidate.value = correct_shaped(&candidate.value, FieldShape::Date, None);
        }
        let parsed = candidates
            .get(field)
            .and_then(|c| normalize::normalize_date_text(&c.value));
        if parsed.is_none() {
            candidates.remove(field);
        }
    }

    if let Some(candidate) = candidates.get_mut("postal_code") {
        candidate.value = correct_shaped(&candidate.value, FieldShape::PostalCode, None);
        if !POSTAL_SHAPE.is_match(&candidate.value) {
            candidates.remove("postal_code");
        }
    }
}

fn build_record(
    candidates: &HashMap<&'static str, Candidate>,
    rule: &RegionRule,
) -> (NormalizedRecord, HashMap<String, f64>) {
    let mut record = NormalizedRecord::default();
    let mut field_confidence = HashMap::new();

    let mut set = |field: &'static str, confidence: f64| {
        field_confidence.insert(field.to_string(), confidence.clamp(0.0, 1.0));
    };

    for (field, candidate) in candidates {
        let value = candidate.value.as_str();
        match *field {
            "document_number" => {
                record.document_number = Some(value.to_string());
                set(field, candidate.confidence);
            }
            "last_name" => {
                let (name, suffix) = normalize::clean_name(value);
                record.last_name = Some(name);
                if suffix.is_some() {
                    record.name_suffix = suffix;
                }
                set(field, candidate.confidence);
            }
            "first_name" => {
                record.first_name = Some(normalize::clean_name(value).0);
                set(field, candidate.confidence);
            }
            "middle_name" => {
                record.middle_name = Some(normalize::clean_name(value).0);
                set(field, candidate.confidence);
            }
            "date_of_birth" => {
                if let Some(date) = normalize::normalize_date_text(value) {
                    record.date_of_birth = Some(date);
                    set(field, candidate.confidence);
                }
            }
            "expiry_date" => {
                if let Some(date) = normalize::normalize_date_text(value) {
                    record.expiry_date = Some(date);
                    set(field, candidate.confidence);
                }
            }
            "issue_date" => {
                if let Some(date) = normalize::normalize_date_text(value) {
                    record.issue_date = Some(date);
                    set(field, candidate.confidence);
                }
            }
            "sex" => {
                record.sex = Some(match value {
                    "M" | "1" => Sex::Male,
                    "F" | "2" => Sex::Female,
                    _ => Sex::Unspecified,
                });
                set(field, candidate.confidence);
            }
            "height_cm" => {
                if let Some(cm) = normalize::parse_height(value)
                    .or_else(|| normalize::parse_height(&correct_shaped(value, FieldShape::Date, None)))
                {
                    record.height_cm = Some(cm);
                    set(field, candidate.confidence);
                }
            }
            "weight_kg" => {
                let cleaned = correct_shaped(value, FieldShape::PostalCode, None);
                if let Some(kg) = normalize::parse_weight_text(&cleaned) {
                    record.weight_kg = Some(kg);
                    set(field, candidate.confidence);
                }
            }
            "eye_color" => {
                record.eye_color = Some(value.to_string());
                set(field, candidate.confidence);
            }
            "hair_color" => {
                record.hair_color = Some(value.to_string());
                set(field, candidate.confidence);
            }
            "street" => {
                record.street = Some(value.to_string());
                set(field, candidate.confidence);
            }
            "city" => {
                record.city = Some(value.trim_matches(|c: char| c == ' ' || c == ',').to_string());
                set(field, candidate.confidence);
            }
            "region" => {
                record.region = Some(value.to_string());
                set(field, candidate.confidence);
            }
            "postal_code" => {
                record.postal_code = Some(value.to_string());
                set(field, candidate.confidence);
            }
            "document_class" => {
                record.document_class = Some(value.to_string());
                set(field, candidate.confidence);
            }
            "restriction_codes" => {
                record.restriction_codes = Some(value.trim().to_string());
                set(field, candidate.confidence);
            }
            "endorsement_codes" => {
                record.endorsement_codes = Some(value.trim().to_string());
                set(field, candidate.confidence);
            }
            "organ_donor" => {
                record.organ_donor = Some(true);
                set(field, candidate.confidence);
            }
            "veteran" => {
                record.veteran = Some(true);
                set(field, candidate.confidence);
            }
            _ => {}
        }
    }

    if rule.code != "GEN" {
        record.issuing_region = Some(rule.code.to_string());
    } else if let Some(region) = record.region.clone() {
        record.issuing_region = Some(region);
    }

    (record, field_confidence)
}

/// Weighted aggregate of the recovered fields' confidences. Required
/// fields dominate so a pile of weak auxiliary fields cannot carry a
/// record whose core identity is shaky.
fn overall_confidence(field_confidence: &HashMap<String, f64>) -> f64 {
    // Accumulate in sorted field order so identical inputs always produce
    // bit-identical aggregates.
    let mut entries: Vec<(&String, &f64)> = field_confidence.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut weighted = 0.0;
    let mut weights = 0.0;
    for (field, confidence) in entries {
        let weight = if REQUIRED_FIELDS.contains(&field.as_str()) {
            REQUIRED_FIELD_WEIGHT
        } else {
            1.0
        };
        weighted += *confidence * weight;
        weights += weight;
    }
    if weights == 0.0 {
        0.0
    } else {
        weighted / weights
    }
}

/// Fraction of the region's expected layout order that the recovered
/// fields respect, mapped into a gentle multiplier. Out-of-order fields
/// suggest a mis-assembled read, not necessarily a wrong one.
fn layout_adherence_factor(
    candidates: &HashMap<&'static str, Candidate>,
    rule: &RegionRule,
) -> f64 {
    let positions: Vec<usize> = rule
        .layout
        .iter()
        .filter_map(|field| candidates.get(field).map(|c| c.line_index))
        .collect();
    if positions.len() < 2 {
        return 1.0;
    }
    let pairs = positions.len() - 1;
    let ordered = positions.windows(2).filter(|w| w[0] <= w[1]).count();
    0.9 + 0.1 * (ordered as f64 / pairs as f64)
}
