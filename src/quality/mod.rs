// Capture-quality assessment. The actual blur/lighting/alignment numbers
// come from the capture collaborator; this module only combines them into
// a readiness signal and answers stability questions over a short window.

use std::collections::VecDeque;

use log::debug;

use crate::models::{QualitySample, ReadinessScore, ReadinessStatus};

/// Samples kept for the "consistently adequate" question.
pub const WINDOW_CAPACITY: usize = 10;

/// Ceiling applied when no document is detected in frame; nothing else in
/// the sample can lift the score past it.
const NO_DOCUMENT_CEILING: f64 = 0.2;

const GOOD_CUTOFF: f64 = 0.75;
const WARNING_CUTOFF: f64 = 0.45;

const FOCUS_WEIGHT: f64 = 0.4;
const EXPOSURE_WEIGHT: f64 = 0.35;
const ALIGNMENT_WEIGHT: f64 = 0.25;

/// Deterministic sample scorer. Holds no per-session state, so a single
/// instance is safely reusable across sessions; the rolling window lives
/// with the session instead.
#[derive(Debug, Clone, Default)]
pub struct QualityEngine;

impl QualityEngine {
    pub fn new() -> Self {
        QualityEngine
    }

    pub fn assess(&self, sample: &QualitySample) -> ReadinessScore {
        let focus = (1.0 - sample.blur).clamp(0.0, 1.0);
        let exposure = (sample.brightness * sample.uniformity).clamp(0.0, 1.0);
        let alignment = sample.alignment.clamp(0.0, 1.0);

        let mut score =
            FOCUS_WEIGHT * focus + EXPOSURE_WEIGHT * exposure + ALIGNMENT_WEIGHT * alignment;
        if !sample.document_detected {
            score = score.min(NO_DOCUMENT_CEILING);
        }

        let status = if score >= GOOD_CUTOFF {
            ReadinessStatus::Good
        } else if score >= WARNING_CUTOFF {
            ReadinessStatus::Warning
        } else {
            ReadinessStatus::Poor
        };
        debug!("quality sample scored {:.3} ({:?})", score, status);
        ReadinessScore { score, status }
    }
}

/// Bounded ring of recent readiness scores, owned by the session context.
#[derive(Debug, Clone)]
pub struct QualityWindow {
    scores: VecDeque<f64>,
    capacity: usize,
}

impl Default for QualityWindow {
    fn default() -> Self {
        QualityWindow::new(WINDOW_CAPACITY)
    }
}

impl QualityWindow {
    pub fn new(capacity: usize) -> Self {
        QualityWindow {
            scores: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, score: f64) {
        if self.scores.len() == self.capacity {
            self.scores.pop_front();
        }
        self.scores.push_back(score);
    }

    pub fn clear(&mut self) {
        self.scores.clear();
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.scores.back().copied()
    }

    /// Whether the last `n` samples all reached `threshold`. Fewer than
    /// `n` samples means the question cannot be answered affirmatively.
    pub fn consistently_adequate(&self, n: usize, threshold: f64) -> bool {
        let n = n.max(1);
        if self.scores.len() < n {
            return false;
        }
        self.scores
            .iter()
            .rev()
            .take(n)
            .all(|score| *score >= threshold)
    }
}
