// Session state machine. Transitions are pure: `(state, event)` yields the
// next state plus a list of effects for the orchestrator to perform, so no
// call site mutates session state ad hoc.

use serde::{Deserialize, Serialize};

use crate::models::Strategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Structured,
    Switching,
    FreeText,
    Completed,
    Failed,
}

impl ScanState {
    /// Terminal states require a new session to retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Failed)
    }
}

/// Why a strategy was abandoned. Recorded for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    MaxAttempts,
    Timeout,
    NonRecoverableError,
}

impl SwitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchReason::MaxAttempts => "max_attempts",
            SwitchReason::Timeout => "timeout",
            SwitchReason::NonRecoverableError => "non_recoverable_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Started(Strategy),
    ParseSucceeded,
    StrategyExhausted(SwitchReason),
    SwitchCompleted,
    CancelRequested,
}

/// Side effects a transition asks the orchestrator to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    EmitProgress(&'static str),
    EmitSwitch {
        from: Strategy,
        to: Strategy,
        reason: SwitchReason,
    },
}

/// Pure transition function. Unexpected events in a given state are
/// ignored; terminal states absorb everything, which makes cancellation
/// idempotent by construction.
pub fn transition(
    state: ScanState,
    event: SessionEvent,
    fallback_allowed: bool,
) -> (ScanState, Vec<Effect>) {
    use ScanState::*;
    use SessionEvent::*;

    if state.is_terminal() {
        return (state, Vec::new());
    }

    match (state, event) {
        (Idle, Started(Strategy::Structured)) => {
            (Structured, vec![Effect::EmitProgress("session_started")])
        }
        (Idle, Started(Strategy::FreeText)) => {
            (FreeText, vec![Effect::EmitProgress("session_started")])
        }
        (Structured, ParseSucceeded) | (FreeText, ParseSucceeded) => {
            (Completed, vec![Effect::EmitProgress("completed")])
        }
        (Structured, StrategyExhausted(reason)) if fallback_allowed => (
            Switching,
            vec![Effect::EmitSwitch {
                from: Strategy::Structured,
                to: Strategy::FreeText,
                reason,
            }],
        ),
        (Structured, StrategyExhausted(_)) | (FreeText, StrategyExhausted(_)) => {
            (Failed, vec![Effect::EmitProgress("failed")])
        }
        (Switching, SwitchCompleted) => {
            (FreeText, vec![Effect::EmitProgress("strategy_switched")])
        }
        (_, CancelRequested) => (Failed, vec![Effect::EmitProgress("cancelled")]),
        (state, _) => (state, Vec::new()),
    }
}
