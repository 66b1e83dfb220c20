use async_trait::async_trait;
use serde::Serialize;

use crate::domain::errors::ProviderError;
use crate::domain::types::{Analysis, BacktestResult, FocusMetric};

/// Opaque reference to a submitted backtest.
#[derive(Debug, Clone)]
pub struct BacktestHandle {
    pub backtest_id: String,
    pub project_id: String,
}

#[derive(Debug, Clone)]
pub enum BacktestPoll {
    Pending,
    Done(BacktestResult),
    Failed(String),
}

/// Runs strategy code against historical data and reports metrics.
#[async_trait]
pub trait BacktestService: Send + Sync {
    async fn submit(&self, code: &str, project_id: &str) -> Result<BacktestHandle, ProviderError>;

    async fn poll(&self, handle: &BacktestHandle) -> Result<BacktestPoll, ProviderError>;
}

/// One prior iteration, reduced to what the analysis step needs to avoid
/// re-proposing changes already shown ineffective.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub version: u32,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub win_rate: Option<f64>,
    pub hypothesis: Option<String>,
    pub improvement: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub strategy_name: String,
    pub current_code: String,
    pub metrics: BacktestResult,
    /// Newest first.
    pub history: Vec<HistoryEntry>,
    pub focus_metric: FocusMetric,
    pub improvement_threshold: f64,
}

/// Diagnoses backtest results and generates modified strategy code.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Returns an analysis without `proposed_code`; code comes from the
    /// separate `generate` call.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, ProviderError>;

    async fn generate(&self, hypothesis: &str, current_code: &str)
    -> Result<String, ProviderError>;
}
