pub mod config;
pub mod models;
pub mod processing;
pub mod quality;
pub mod runtime;
pub mod scanner;
pub mod utils;

pub use config::{ActiveSessionPolicy, ScanConfig};
pub use models::{NormalizedRecord, QualitySample, RawInput, ScanMode, TextObservation};
pub use scanner::{ScanEvent, ScanOrchestrator};
pub use utils::ScanError;
