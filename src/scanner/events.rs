use serde::{Deserialize, Serialize};

use crate::models::Strategy;
use crate::runtime::ScanMetrics;
use crate::scanner::state::{ScanState, SwitchReason};

/// Events published to the observing collaborator over the session's
/// event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Emitted on every state transition.
    Progress {
        state: ScanState,
        strategy: Strategy,
        elapsed_ms: u64,
        structured_attempts: u32,
        free_text_attempts: u32,
        reason: String,
    },
    /// Emitted once per strategy hand-off.
    ModeSwitch {
        from: Strategy,
        to: Strategy,
        reason: SwitchReason,
    },
    /// Emitted when the session's metrics are finalized.
    Metrics(ScanMetrics),
}
