//! Builds the bounded history context handed to the analysis step.

use crate::domain::ports::{AnalysisRequest, HistoryEntry};
use crate::domain::types::{BacktestResult, Iteration, LoopConfig, Strategy};

/// How many prior iterations are summarized for the analysis prompt. Bounded
/// so context stays useful without growing with loop age.
pub const HISTORY_WINDOW: usize = 5;

/// Reduce recent iterations (newest first) to the summary the analysis
/// service sees. Failed iterations are kept: a failed attempt at a
/// hypothesis is exactly what the next analysis must not repeat.
pub fn build_analysis_request(
    strategy: &Strategy,
    result: &BacktestResult,
    recent: &[Iteration],
    config: &LoopConfig,
) -> AnalysisRequest {
    let history = recent
        .iter()
        .take(HISTORY_WINDOW)
        .map(|iteration| HistoryEntry {
            version: iteration.version,
            sharpe_ratio: iteration.backtest_result.as_ref().map(|r| r.sharpe_ratio),
            max_drawdown: iteration.backtest_result.as_ref().map(|r| r.max_drawdown),
            win_rate: iteration.backtest_result.as_ref().map(|r| r.win_rate),
            hypothesis: iteration.analysis.as_ref().map(|a| a.hypothesis.clone()),
            improvement: iteration.improvement,
        })
        .collect();

    AnalysisRequest {
        strategy_name: strategy.name.clone(),
        current_code: strategy.code.clone(),
        metrics: result.clone(),
        history,
        focus_metric: config.focus_metric,
        improvement_threshold: config.improvement_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Analysis, Confidence};

    fn sample_result(sharpe: f64) -> BacktestResult {
        BacktestResult {
            sharpe_ratio: sharpe,
            max_drawdown: 0.1,
            total_return: 0.2,
            win_rate: 0.55,
            trade_count: 80,
        }
    }

    fn sample_analysis(hypothesis: &str) -> Analysis {
        Analysis {
            diagnosis: "too many trades in chop".to_string(),
            hypothesis: hypothesis.to_string(),
            confidence: Confidence::Medium,
            proposed_code: None,
        }
    }

    #[test]
    fn window_is_bounded() {
        let strategy = Strategy::new("s", "code", "1");
        let iterations: Vec<Iteration> = (2..=10)
            .rev()
            .map(|v| {
                Iteration::completed(
                    &strategy.id,
                    v,
                    sample_result(1.0),
                    sample_analysis("widen stop"),
                    Some(0.01),
                )
            })
            .collect();
        let request = build_analysis_request(
            &strategy,
            &sample_result(1.2),
            &iterations,
            &LoopConfig::default(),
        );
        assert_eq!(request.history.len(), HISTORY_WINDOW);
        // Newest first is preserved.
        assert_eq!(request.history[0].version, 10);
    }

    #[test]
    fn failed_iteration_has_no_metrics_but_keeps_hypothesis() {
        let strategy = Strategy::new("s", "code", "1");
        let failed = Iteration::failed(
            &strategy.id,
            3,
            Some(sample_result(0.8)),
            Some(sample_analysis("tighten entry filter")),
        );
        let request = build_analysis_request(
            &strategy,
            &sample_result(1.0),
            &[failed],
            &LoopConfig::default(),
        );
        assert_eq!(request.history.len(), 1);
        assert_eq!(
            request.history[0].hypothesis.as_deref(),
            Some("tighten entry filter")
        );
        assert!(request.history[0].improvement.is_none());
    }
}
