use serde::{Deserialize, Serialize};

use crate::utils::ScanError;

/// What to do when `scan` is called while another session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveSessionPolicy {
    /// Reject the new call with `InvalidInput`.
    Reject,
    /// Cancel the active session, then run the new one.
    Preempt,
}

/// Recognized configuration surface of the scan pipeline.
///
/// Deserializable from JSON so hosts can ship tuning without recompiling.
/// Unknown keys are ignored; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Per-attempt deadline for a structured parse, in milliseconds.
    pub structured_timeout_ms: u64,
    /// Per-attempt deadline for a free-text parse, in milliseconds.
    pub free_text_timeout_ms: u64,
    pub max_structured_attempts: u32,
    pub max_free_text_attempts: u32,
    /// Fixed delay between retries of the same strategy.
    pub retry_delay_ms: u64,
    /// Minimum readiness score treated as "adequate capture". Used to
    /// suppress a fallback caused by momentary capture problems.
    pub quality_switch_threshold: f64,
    /// Whether auto mode may switch from structured to free-text at all.
    pub auto_fallback: bool,
    /// Minimum overall confidence for accepting a free-text result.
    pub confidence_threshold: f64,
    pub on_active_session: ActiveSessionPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            structured_timeout_ms: 1_000,
            free_text_timeout_ms: 2_000,
            max_structured_attempts: 3,
            max_free_text_attempts: 2,
            retry_delay_ms: 100,
            quality_switch_threshold: 0.6,
            auto_fallback: true,
            confidence_threshold: 0.7,
            on_active_session: ActiveSessionPolicy::Reject,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.structured_timeout_ms == 0 || self.free_text_timeout_ms == 0 {
            return Err(ScanError::InvalidInput(
                "strategy timeouts must be positive".into(),
            ));
        }
        if self.max_structured_attempts == 0 || self.max_free_text_attempts == 0 {
            return Err(ScanError::InvalidInput(
                "attempt budgets must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold)
            || !(0.0..=1.0).contains(&self.quality_switch_threshold)
        {
            return Err(ScanError::InvalidInput(
                "thresholds must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ScanConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_budget_rejected() {
        let config = ScanConfig {
            max_structured_attempts: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().code(),
            "invalid_input"
        );
    }

    #[test]
    fn deserializes_partial_json() {
        let config: ScanConfig =
            serde_json::from_str(r#"{"structured_timeout_ms": 250, "auto_fallback": false}"#)
                .unwrap();
        assert_eq!(config.structured_timeout_ms, 250);
        assert!(!config.auto_fallback);
        // Untouched keys keep their defaults.
        assert_eq!(config.max_structured_attempts, 3);
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let config = ScanConfig {
            confidence_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
