use thiserror::Error;

use crate::models::Strategy;

/// Error taxonomy shared by both parsing strategies and the orchestrator.
///
/// Every variant carries a short machine code for telemetry and a
/// recoverability flag so a UI can decide whether "try again" makes sense.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScanError {
    /// The payload envelope or structure is unrecognized. Never retried;
    /// an immediate fallback candidate.
    #[error("invalid payload format: {0}")]
    InvalidFormat(String),

    /// Structurally valid input whose content could not be mapped.
    #[error("parsing failed: {0}")]
    ParsingFailed(String),

    /// Too few fields were recovered to produce a usable record.
    #[error("insufficient data: recovered {recovered} of {required} required fields")]
    InsufficientData { recovered: usize, required: usize },

    /// Fields were recovered but the aggregate confidence is unreliable.
    #[error("low confidence: {confidence:.2} below threshold {threshold:.2}")]
    LowConfidence { confidence: f64, threshold: f64 },

    /// A single attempt exceeded its deadline.
    #[error("{strategy} attempt timed out after {elapsed_ms}ms")]
    Timeout { strategy: Strategy, elapsed_ms: u64 },

    /// The retry budget for a strategy is spent.
    #[error("{strategy} retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        strategy: Strategy,
        attempts: u32,
        last: Box<ScanError>,
    },

    /// Caller misuse, e.g. the wrong input shape for a forced mode.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The session was cancelled by the caller.
    #[error("scan cancelled")]
    Cancelled,
}

impl ScanError {
    /// Short machine-readable code, stable across message changes.
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::InvalidFormat(_) => "invalid_format",
            ScanError::ParsingFailed(_) => "parsing_failed",
            ScanError::InsufficientData { .. } => "insufficient_data",
            ScanError::LowConfidence { .. } => "low_confidence",
            ScanError::Timeout { .. } => "timeout",
            ScanError::RetryExhausted { .. } => "retry_exhausted",
            ScanError::InvalidInput(_) => "invalid_input",
            ScanError::Cancelled => "cancelled",
        }
    }

    /// Whether a fresh session against the same document could plausibly
    /// succeed. Drives the UI's "try again" affordance.
    pub fn recoverable(&self) -> bool {
        !matches!(self, ScanError::InvalidInput(_) | ScanError::Cancelled)
    }

    /// Whether another attempt of the *same* strategy inside the current
    /// session is worthwhile. Format rejections and data-poverty errors are
    /// deterministic for a fixed input, so repeating them is wasted budget.
    pub fn retryable_within_strategy(&self) -> bool {
        matches!(
            self,
            ScanError::ParsingFailed(_) | ScanError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ScanError::InvalidFormat("x".into()).code(), "invalid_format");
        assert_eq!(
            ScanError::Timeout {
                strategy: Strategy::Structured,
                elapsed_ms: 50
            }
            .code(),
            "timeout"
        );
        assert_eq!(ScanError::Cancelled.code(), "cancelled");
    }

    #[test]
    fn caller_misuse_is_not_recoverable() {
        assert!(!ScanError::InvalidInput("bad mode".into()).recoverable());
        assert!(!ScanError::Cancelled.recoverable());
        assert!(ScanError::InvalidFormat("junk".into()).recoverable());
        assert!(ScanError::LowConfidence {
            confidence: 0.5,
            threshold: 0.7
        }
        .recoverable());
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(ScanError::ParsingFailed("garbled".into()).retryable_within_strategy());
        assert!(ScanError::Timeout {
            strategy: Strategy::FreeText,
            elapsed_ms: 10
        }
        .retryable_within_strategy());
        assert!(!ScanError::InvalidFormat("junk".into()).retryable_within_strategy());
        assert!(!ScanError::InsufficientData {
            recovered: 1,
            required: 2
        }
        .retryable_within_strategy());
    }
}
