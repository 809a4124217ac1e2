use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::models::Strategy;
use crate::runtime::PerformanceMonitor;
use crate::scanner::state::ScanState;

/// Mutable orchestration state for one scan. Owned exclusively by the
/// orchestrator's session loop; nothing else holds a reference, and it is
/// discarded when the session reaches a terminal state.
pub struct ScanSession {
    pub strategy: Strategy,
    pub state: ScanState,
    pub started: Instant,
    /// Attempt counters are shared with the retry closure only, which
    /// records the current attempt number as it runs.
    pub structured_attempts: Arc<AtomicU32>,
    pub free_text_attempts: Arc<AtomicU32>,
    /// Whether the single quality-based fallback suppression was spent.
    pub quality_grace_used: bool,
    pub monitor: PerformanceMonitor,
}

impl ScanSession {
    pub fn new(strategy: Strategy, monitor: PerformanceMonitor) -> Self {
        ScanSession {
            strategy,
            state: ScanState::Idle,
            started: Instant::now(),
            structured_attempts: Arc::new(AtomicU32::new(0)),
            free_text_attempts: Arc::new(AtomicU32::new(0)),
            quality_grace_used: false,
            monitor,
        }
    }

    pub fn id(&self) -> u64 {
        self.monitor.session_id()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn structured_attempt_count(&self) -> u32 {
        self.structured_attempts.load(Ordering::SeqCst)
    }

    pub fn free_text_attempt_count(&self) -> u32 {
        self.free_text_attempts.load(Ordering::SeqCst)
    }
}
