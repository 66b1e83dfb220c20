//! Improvement and plateau arithmetic for the refinement loop.

use crate::domain::types::{BacktestResult, FocusMetric, PLATEAU_WINDOW};

/// Guards the relative-improvement division when the best value is zero.
const EPSILON: f64 = 1e-9;

/// Computes the signed relative improvement of a backtest against the best
/// value seen so far for the focus metric.
///
/// Comparing against best-ever rather than the previous iteration keeps an
/// oscillating strategy from registering spurious gains.
pub struct ImprovementCalculator;

impl ImprovementCalculator {
    /// `None` when no baseline exists yet (first completed backtest).
    pub fn improvement(
        metric: FocusMetric,
        best_value: Option<f64>,
        result: &BacktestResult,
    ) -> Option<f64> {
        let best = best_value?;
        let new = metric.extract(result);
        Some(metric.orientation() * (new - best) / best.abs().max(EPSILON))
    }
}

/// Tracks consecutive sub-threshold iterations. The counter itself lives in
/// `LoopState`; this just encodes the update rule.
pub struct PlateauDetector {
    threshold: f64,
}

impl PlateauDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// An unknown improvement (failed iteration, missing baseline) counts as
    /// a non-improvement.
    pub fn update(&self, consecutive: u32, improvement: Option<f64>) -> u32 {
        match improvement {
            Some(value) if value >= self.threshold => 0,
            _ => consecutive + 1,
        }
    }

    pub fn is_plateau(&self, consecutive: u32) -> bool {
        consecutive >= PLATEAU_WINDOW
    }
}
