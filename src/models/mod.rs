pub mod data;
pub mod rules;

pub use data::{
    BoundingBox, DistanceCategory, NormalizedRecord, ParseResult, QualitySample, RawInput,
    ReadinessScore, ReadinessStatus, ScanMode, Sex, Strategy, TextObservation,
};
pub use rules::{RegionRule, RegionRuleTable, REGION_RULES};
