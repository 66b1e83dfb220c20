use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::LoopError;

/// Number of consecutive sub-threshold iterations that constitutes a plateau.
pub const PLATEAU_WINDOW: u32 = 3;

/// A trading strategy under refinement.
///
/// `code` and `current_version` are only mutated by the refinement loop at
/// iteration commit time; everything else is set at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub code: String,
    /// Backtest provider project this strategy is bound to.
    pub qc_project_id: String,
    pub created_at: DateTime<Utc>,
    /// Starts at 1, incremented exactly once per Completed iteration.
    pub current_version: u32,
    /// Best observed value of the configured focus metric. `None` until the
    /// first completed backtest establishes a baseline.
    pub best_metric_value: Option<f64>,
    pub best_version: u32,
}

impl Strategy {
    pub fn new(
        name: impl Into<String>,
        code: impl Into<String>,
        qc_project_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            code: code.into(),
            qc_project_id: qc_project_id.into(),
            created_at: Utc::now(),
            current_version: 1,
            best_metric_value: None,
            best_version: 1,
        }
    }
}

/// Performance metrics returned by a completed backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub sharpe_ratio: f64,
    /// Peak-to-trough loss as a positive fraction (0.20 = 20% drawdown).
    pub max_drawdown: f64,
    pub total_return: f64,
    pub win_rate: f64,
    pub trade_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// Diagnosis and proposed change produced by the analysis step.
///
/// `proposed_code` is filled in by the separate generation call, not by
/// `analyze` itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub diagnosis: String,
    pub hypothesis: String,
    pub confidence: Confidence,
    #[serde(default)]
    pub proposed_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Completed,
    Failed,
}

/// One refinement iteration. Immutable once written; the history store is
/// append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub strategy_id: String,
    /// The version produced by this iteration. Failed iterations record the
    /// current, unadvanced version.
    pub version: u32,
    pub backtest_result: Option<BacktestResult>,
    pub analysis: Option<Analysis>,
    pub improvement: Option<f64>,
    pub status: IterationStatus,
    pub created_at: DateTime<Utc>,
}

impl Iteration {
    pub fn completed(
        strategy_id: &str,
        version: u32,
        result: BacktestResult,
        analysis: Analysis,
        improvement: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy_id: strategy_id.to_string(),
            version,
            backtest_result: Some(result),
            analysis: Some(analysis),
            improvement,
            status: IterationStatus::Completed,
            created_at: Utc::now(),
        }
    }

    pub fn failed(
        strategy_id: &str,
        version: u32,
        result: Option<BacktestResult>,
        analysis: Option<Analysis>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy_id: strategy_id.to_string(),
            version,
            backtest_result: result,
            analysis,
            improvement: None,
            status: IterationStatus::Failed,
            created_at: Utc::now(),
        }
    }
}

/// The single metric improvement is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusMetric {
    Sharpe,
    Drawdown,
    Return,
}

impl FocusMetric {
    /// +1 when higher is better, -1 when lower is better.
    pub fn orientation(&self) -> f64 {
        match self {
            FocusMetric::Sharpe | FocusMetric::Return => 1.0,
            FocusMetric::Drawdown => -1.0,
        }
    }

    pub fn extract(&self, result: &BacktestResult) -> f64 {
        match self {
            FocusMetric::Sharpe => result.sharpe_ratio,
            FocusMetric::Drawdown => result.max_drawdown,
            FocusMetric::Return => result.total_return,
        }
    }
}

impl std::fmt::Display for FocusMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FocusMetric::Sharpe => write!(f, "sharpe"),
            FocusMetric::Drawdown => write!(f, "drawdown"),
            FocusMetric::Return => write!(f, "return"),
        }
    }
}

impl std::str::FromStr for FocusMetric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sharpe" => Ok(FocusMetric::Sharpe),
            "drawdown" => Ok(FocusMetric::Drawdown),
            "return" => Ok(FocusMetric::Return),
            _ => anyhow::bail!(
                "Invalid FOCUS_METRIC: {}. Must be 'sharpe', 'drawdown' or 'return'",
                s
            ),
        }
    }
}

/// Loop configuration, validated once at `start()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// `None` = unbounded. Failed iterations count toward the cap.
    pub max_iterations: Option<u32>,
    pub cooldown_seconds: u64,
    pub focus_metric: FocusMetric,
    pub improvement_threshold: f64,
    pub auto_stop_on_plateau: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            cooldown_seconds: 60,
            focus_metric: FocusMetric::Sharpe,
            improvement_threshold: 0.01,
            auto_stop_on_plateau: true,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<(), LoopError> {
        if let Some(max) = self.max_iterations
            && max == 0
        {
            return Err(LoopError::InvalidConfig {
                reason: "max_iterations must be greater than 0 when set".to_string(),
            });
        }
        if !self.improvement_threshold.is_finite() || self.improvement_threshold < 0.0 {
            return Err(LoopError::InvalidConfig {
                reason: format!(
                    "improvement_threshold must be a non-negative number, got {}",
                    self.improvement_threshold
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

/// Snapshot of the controller state. Readers always get a copy, never a
/// shared mutable reference.
#[derive(Debug, Clone, Serialize)]
pub struct LoopState {
    pub status: LoopStatus,
    pub strategy_id: Option<String>,
    pub current_iteration: u32,
    pub consecutive_non_improvements: u32,
    pub last_error: Option<String>,
}

impl LoopState {
    pub fn idle() -> Self {
        Self {
            status: LoopStatus::Idle,
            strategy_id: None,
            current_iteration: 0,
            consecutive_non_improvements: 0,
            last_error: None,
        }
    }
}
