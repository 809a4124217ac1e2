use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::utils::ScanError;

/// Parsing strategy a scan session is currently pursuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Structured,
    FreeText,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Structured => write!(f, "structured"),
            Strategy::FreeText => write!(f, "free-text"),
        }
    }
}

/// Caller-selected scan mode. `Auto` starts structured and may fall back;
/// the forced modes never switch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Auto,
    Structured,
    FreeText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
    Unspecified,
}

/// Canonical output of both parsing strategies. Every field is optional;
/// absence is distinct from an empty string.
///
/// Invariant: a present `document_number` has already passed the issuing
/// region's shape check. Parsers drop the field rather than keep a
/// malformed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub name_suffix: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub issue_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub eye_color: Option<String>,
    pub hair_color: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub document_number: Option<String>,
    pub document_class: Option<String>,
    pub restriction_codes: Option<String>,
    pub endorsement_codes: Option<String>,
    pub issuing_region: Option<String>,
    pub organ_donor: Option<bool>,
    pub veteran: Option<bool>,
    pub enhanced_credential: Option<bool>,
}

impl NormalizedRecord {
    /// Number of populated fields, used for sufficiency checks.
    pub fn field_count(&self) -> usize {
        let mut n = 0;
        macro_rules! count {
            ($($field:ident),*) => {
                $(if self.$field.is_some() { n += 1; })*
            };
        }
        count!(
            first_name,
            middle_name,
            last_name,
            name_suffix,
            date_of_birth,
            issue_date,
            expiry_date,
            sex,
            height_cm,
            weight_kg,
            eye_color,
            hair_color,
            street,
            city,
            region,
            postal_code,
            country,
            document_number,
            document_class,
            restriction_codes,
            endorsement_codes,
            issuing_region,
            organ_donor,
            veteran,
            enhanced_credential
        );
        n
    }
}

/// One OCR-recognized token with its confidence and normalized location.
/// Immutable once received from the capture layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextObservation {
    pub text: String,
    /// Recognition confidence in `[0, 1]`.
    pub confidence: f64,
    pub bounds: BoundingBox,
}

/// Axis-aligned box in normalized `[0, 1]` image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center_x(&self) -> f64 {
        self.x + self.width / 2.0
    }

    pub fn center_y(&self) -> f64 {
        self.y + self.height / 2.0
    }
}

/// Input handed to a scan session by the capture layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RawInput {
    StructuredPayload(String),
    Observations(Vec<TextObservation>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceCategory {
    TooClose,
    Good,
    TooFar,
}

/// One capture-quality measurement. Produced by the capture collaborator,
/// consumed (never mutated) by the quality engine. `blur` is lower-better;
/// the remaining scalars are higher-better, all in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub blur: f64,
    pub brightness: f64,
    pub uniformity: f64,
    pub alignment: f64,
    pub document_detected: bool,
    pub distance: DistanceCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    Good,
    Warning,
    Poor,
}

/// Scalar summary of capture quality plus a coarse status for UI guidance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadinessScore {
    pub score: f64,
    pub status: ReadinessStatus,
}

/// Uniform result type returned by both parsers so the orchestrator can
/// treat them interchangeably.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub success: bool,
    pub record: Option<NormalizedRecord>,
    pub error: Option<ScanError>,
    /// Per-field confidence keyed by record field name.
    pub field_confidence: HashMap<String, f64>,
    pub overall_confidence: f64,
    /// Elements that could not be mapped to a record field, preserved
    /// verbatim for diagnostics.
    pub raw_elements: HashMap<String, String>,
}

impl ParseResult {
    pub fn failure(error: ScanError) -> Self {
        ParseResult {
            success: false,
            record: None,
            error: Some(error),
            field_confidence: HashMap::new(),
            overall_confidence: 0.0,
            raw_elements: HashMap::new(),
        }
    }

    pub fn completed(
        record: NormalizedRecord,
        field_confidence: HashMap<String, f64>,
        overall_confidence: f64,
        raw_elements: HashMap<String, String>,
    ) -> Self {
        ParseResult {
            success: true,
            record: Some(record),
            error: None,
            field_confidence,
            overall_confidence,
            raw_elements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_record_has_no_fields() {
        assert_eq!(NormalizedRecord::default().field_count(), 0);
    }

    #[test]
    fn field_count_tracks_population() {
        let record = NormalizedRecord {
            first_name: Some("JOHN".into()),
            last_name: Some("DOE".into()),
            document_number: Some("D1234567".into()),
            ..Default::default()
        };
        assert_eq!(record.field_count(), 3);
    }

    #[test]
    fn failure_result_carries_no_record() {
        let result = ParseResult::failure(ScanError::InvalidFormat("junk".into()));
        assert!(!result.success);
        assert!(result.record.is_none());
        assert_eq!(result.error.as_ref().map(|e| e.code()), Some("invalid_format"));
    }
}
