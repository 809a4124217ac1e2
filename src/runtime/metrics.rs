// Performance monitoring for scan sessions: wall-clock checkpoints, memory
// and resource tracking, and comparison against fixed budgets. Budget
// violations annotate the session; they never fail it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Fixed performance targets for one session.
pub const TOTAL_TIME_BUDGET_MS: u64 = 3_000;
pub const FALLBACK_TIME_BUDGET_MS: u64 = 2_000;
pub const MEMORY_BUDGET_BYTES: i64 = 50 * 1024 * 1024;
pub const CPU_BUDGET_PCT: f64 = 80.0;

/// Phase name whose duration is held to the fallback budget.
pub const FALLBACK_PHASE: &str = "free_text";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Structured budget-violation notice attached to the session metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfAlert {
    pub severity: AlertSeverity,
    pub metric: String,
    pub measured: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub name: String,
    pub duration_ms: u64,
}

/// Whether each budget was respected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub total_time_ok: bool,
    pub fallback_time_ok: bool,
    pub memory_ok: bool,
    pub cpu_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMetrics {
    pub session_id: u64,
    pub kind: String,
    pub total_ms: u64,
    pub phases: Vec<PhaseTiming>,
    pub memory_delta_bytes: i64,
    pub peak_cpu_pct: Option<f64>,
    pub average_cpu_pct: Option<f64>,
    pub peak_gpu_pct: Option<f64>,
    pub targets: TargetReport,
    pub alerts: Vec<PerfAlert>,
}

/// Per-session monitor. Created at session start, consumed at session end.
#[derive(Debug)]
pub struct PerformanceMonitor {
    session_id: u64,
    kind: String,
    started: Instant,
    checkpoints: Vec<(String, Instant)>,
    memory_delta_bytes: i64,
    cpu_samples: Vec<f64>,
    gpu_samples: Vec<f64>,
}

impl PerformanceMonitor {
    pub fn start_session(kind: &str) -> Self {
        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("performance session {} ({}) started", session_id, kind);
        PerformanceMonitor {
            session_id,
            kind: kind.to_string(),
            started: Instant::now(),
            checkpoints: Vec::new(),
            memory_delta_bytes: 0,
            cpu_samples: Vec::new(),
            gpu_samples: Vec::new(),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Record a named instant. Phase durations are derived from pairs named
    /// `<phase>_start` / `<phase>_end`.
    pub fn checkpoint(&mut self, name: &str) {
        self.checkpoints.push((name.to_string(), Instant::now()));
    }

    /// Record an allocation (positive) or release (negative) attributed to
    /// this session.
    pub fn track_memory(&mut self, op: &str, bytes: i64) {
        debug!("session {} memory {}: {} bytes", self.session_id, op, bytes);
        self.memory_delta_bytes += bytes;
    }

    pub fn track_resources(&mut self, cpu_pct: f64, gpu_pct: Option<f64>) {
        self.cpu_samples.push(cpu_pct);
        if let Some(gpu) = gpu_pct {
            self.gpu_samples.push(gpu);
        }
    }

    pub fn end_session(self) -> ScanMetrics {
        let total_ms = self.started.elapsed().as_millis() as u64;
        let phases = self.phase_timings();

        let fallback_ms = phases
            .iter()
            .find(|p| p.name == FALLBACK_PHASE)
            .map(|p| p.duration_ms);
        let peak_cpu = self
            .cpu_samples
            .iter()
            .copied()
            .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))));
        let average_cpu = if self.cpu_samples.is_empty() {
            None
        } else {
            Some(self.cpu_samples.iter().sum::<f64>() / self.cpu_samples.len() as f64)
        };
        let peak_gpu = self
            .gpu_samples
            .iter()
            .copied()
            .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))));

        let mut alerts = Vec::new();
        let total_time_ok = check(
            &mut alerts,
            "total_time_ms",
            total_ms as f64,
            TOTAL_TIME_BUDGET_MS as f64,
        );
        let fallback_time_ok = match fallback_ms {
            Some(ms) => check(
                &mut alerts,
                "fallback_time_ms",
                ms as f64,
                FALLBACK_TIME_BUDGET_MS as f64,
            ),
            None => true,
        };
        let memory_ok = check(
            &mut alerts,
            "memory_delta_bytes",
            self.memory_delta_bytes as f64,
            MEMORY_BUDGET_BYTES as f64,
        );
        let cpu_ok = match peak_cpu {
            Some(cpu) => check(&mut alerts, "peak_cpu_pct", cpu, CPU_BUDGET_PCT),
            None => true,
        };

        ScanMetrics {
            session_id: self.session_id,
            kind: self.kind,
            total_ms,
            phases,
            memory_delta_bytes: self.memory_delta_bytes,
            peak_cpu_pct: peak_cpu,
            average_cpu_pct: average_cpu,
            peak_gpu_pct: peak_gpu,
            targets: TargetReport {
                total_time_ok,
                fallback_time_ok,
                memory_ok,
                cpu_ok,
            },
            alerts,
        }
    }

    fn phase_timings(&self) -> Vec<PhaseTiming> {
        let mut phases = Vec::new();
        for (name, at) in &self.checkpoints {
            let Some(phase) = name.strip_suffix("_start") else {
                continue;
            };
            let end_name = format!("{phase}_end");
            if let Some((_, end_at)) = self
                .checkpoints
                .iter()
                .find(|(n, end_at)| *n == end_name && end_at >= at)
            {
                phases.push(PhaseTiming {
                    name: phase.to_string(),
                    duration_ms: end_at.duration_since(*at).as_millis() as u64,
                });
            }
        }
        phases
    }
}

/// Compare a measurement against its budget, pushing an alert on
/// violation. Twice the budget escalates to critical.
fn check(alerts: &mut Vec<PerfAlert>, metric: &str, measured: f64, threshold: f64) -> bool {
    if measured <= threshold {
        return true;
    }
    let severity = if measured > threshold * 2.0 {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    };
    warn!(
        "{} exceeded budget: {:.1} > {:.1} ({:?})",
        metric, measured, threshold, severity
    );
    alerts.push(PerfAlert {
        severity,
        metric: metric.to_string(),
        measured,
        threshold,
    });
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn session_ids_are_unique() {
        let a = PerformanceMonitor::start_session("scan");
        let b = PerformanceMonitor::start_session("scan");
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn phase_breakdown_from_checkpoint_pairs() {
        let mut monitor = PerformanceMonitor::start_session("scan");
        monitor.checkpoint("structured_start");
        thread::sleep(Duration::from_millis(15));
        monitor.checkpoint("structured_end");
        monitor.checkpoint("free_text_start");
        monitor.checkpoint("free_text_end");
        let metrics = monitor.end_session();
        let structured = metrics
            .phases
            .iter()
            .find(|p| p.name == "structured")
            .expect("structured phase present");
        assert!(structured.duration_ms >= 10);
        assert!(metrics.phases.iter().any(|p| p.name == "free_text"));
    }

    #[test]
    fn within_budget_session_has_no_alerts() {
        let mut monitor = PerformanceMonitor::start_session("scan");
        monitor.track_memory("observations", 1024);
        monitor.track_resources(35.0, None);
        let metrics = monitor.end_session();
        assert!(metrics.targets.total_time_ok);
        assert!(metrics.targets.memory_ok);
        assert!(metrics.targets.cpu_ok);
        assert!(metrics.alerts.is_empty());
    }

    #[test]
    fn memory_budget_violation_reports_not_fails() {
        let mut monitor = PerformanceMonitor::start_session("scan");
        monitor.track_memory("frame buffer", MEMORY_BUDGET_BYTES + 1);
        let metrics = monitor.end_session();
        assert!(!metrics.targets.memory_ok);
        let alert = metrics
            .alerts
            .iter()
            .find(|a| a.metric == "memory_delta_bytes")
            .expect("memory alert present");
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert!((alert.threshold - MEMORY_BUDGET_BYTES as f64).abs() < f64::EPSILON);
    }

    #[test]
    fn double_overrun_escalates_to_critical() {
        let mut monitor = PerformanceMonitor::start_session("scan");
        monitor.track_resources(CPU_BUDGET_PCT * 2.5, None);
        let metrics = monitor.end_session();
        let alert = metrics
            .alerts
            .iter()
            .find(|a| a.metric == "peak_cpu_pct")
            .expect("cpu alert present");
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }

    #[test]
    fn cpu_stats_aggregate() {
        let mut monitor = PerformanceMonitor::start_session("scan");
        monitor.track_resources(10.0, Some(5.0));
        monitor.track_resources(30.0, Some(15.0));
        let metrics = monitor.end_session();
        assert_eq!(metrics.peak_cpu_pct, Some(30.0));
        assert_eq!(metrics.average_cpu_pct, Some(20.0));
        assert_eq!(metrics.peak_gpu_pct, Some(15.0));
    }
}
