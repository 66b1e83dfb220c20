//! One full refinement cycle: backtest, analyze, generate, apply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::application::context::{HISTORY_WINDOW, build_analysis_request};
use crate::application::controller::ControlSignal;
use crate::application::retry::{RetryPolicy, StepFailure, sleep_cancellable, with_retry};
use crate::domain::events::{PipelinePhase, RefinementEvent};
use crate::domain::ports::{AnalysisService, BacktestHandle, BacktestPoll, BacktestService};
use crate::domain::refinement::ImprovementCalculator;
use crate::domain::repositories::{IterationRepository, StrategyRepository};
use crate::domain::types::{Analysis, BacktestResult, Iteration, LoopConfig, Strategy};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub poll_interval: Duration,
    pub backtest_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            backtest_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of one pipeline cycle, as seen by the loop controller.
#[derive(Debug)]
pub enum CycleOutcome {
    Completed {
        new_version: u32,
        improvement: Option<f64>,
    },
    /// Exactly one Failed iteration was recorded; the loop continues.
    Failed { reason: String },
    /// The loop must transition to `Error`.
    Fatal { reason: String },
    /// A stop request was honored mid-cycle; nothing was committed.
    Cancelled,
}

pub struct IterationPipeline {
    backtest: Arc<dyn BacktestService>,
    analysis: Arc<dyn AnalysisService>,
    strategies: Arc<dyn StrategyRepository>,
    history: Arc<dyn IterationRepository>,
    events: EventBus,
    retry: RetryPolicy,
    settings: PipelineSettings,
}

impl IterationPipeline {
    pub fn new(
        backtest: Arc<dyn BacktestService>,
        analysis: Arc<dyn AnalysisService>,
        strategies: Arc<dyn StrategyRepository>,
        history: Arc<dyn IterationRepository>,
        events: EventBus,
        retry: RetryPolicy,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            backtest,
            analysis,
            strategies,
            history,
            events,
            retry,
            settings,
        }
    }

    /// Run one cycle. Mutates `strategy` only on a fully committed iteration;
    /// any failure leaves code, version and best value untouched.
    pub async fn run_cycle(
        &self,
        strategy: &mut Strategy,
        config: &LoopConfig,
        control: &watch::Receiver<ControlSignal>,
    ) -> CycleOutcome {
        // Step 1: backtest.
        self.events
            .publish(RefinementEvent::Phase {
                phase: PipelinePhase::Backtest,
            })
            .await;
        let result = match self.backtest_step(strategy, control).await {
            Ok(result) => result,
            Err(failure) => return self.fail_iteration(strategy, failure, None, None).await,
        };
        self.events
            .publish(RefinementEvent::BacktestComplete {
                sharpe: result.sharpe_ratio,
                max_drawdown: result.max_drawdown,
                total_return: result.total_return,
                win_rate: result.win_rate,
                trade_count: result.trade_count,
            })
            .await;

        // Step 2: analyze against recent history.
        self.events
            .publish(RefinementEvent::Phase {
                phase: PipelinePhase::Analysis,
            })
            .await;
        let recent = match self.history.recent(&strategy.id, HISTORY_WINDOW).await {
            Ok(recent) => recent,
            Err(e) => {
                return CycleOutcome::Fatal {
                    reason: format!("failed to load iteration history: {e}"),
                };
            }
        };
        let request = build_analysis_request(strategy, &result, &recent, config);
        let analysis = match with_retry(&self.retry, control, "analysis", || {
            self.analysis.analyze(&request)
        })
        .await
        {
            Ok(analysis) => analysis,
            Err(failure) => {
                return self
                    .fail_iteration(strategy, failure, Some(result), None)
                    .await;
            }
        };
        self.events
            .publish(RefinementEvent::AnalysisComplete {
                diagnosis: analysis.diagnosis.clone(),
                hypothesis: analysis.hypothesis.clone(),
                confidence: analysis.confidence,
            })
            .await;

        // Step 3: generate modified code.
        self.events
            .publish(RefinementEvent::Phase {
                phase: PipelinePhase::Generation,
            })
            .await;
        let raw = match with_retry(&self.retry, control, "generation", || {
            self.analysis.generate(&analysis.hypothesis, &strategy.code)
        })
        .await
        {
            Ok(raw) => raw,
            Err(failure) => {
                return self
                    .fail_iteration(strategy, failure, Some(result), Some(analysis))
                    .await;
            }
        };
        let Some(new_code) = sanitize_generated(&raw) else {
            let failure = StepFailure::Transient("generation produced empty code".to_string());
            return self
                .fail_iteration(strategy, failure, Some(result), Some(analysis))
                .await;
        };

        // Step 4: improvement against best-ever, not the previous iteration.
        let improvement =
            ImprovementCalculator::improvement(config.focus_metric, strategy.best_metric_value, &result);

        // Step 5: apply. Nothing before this point has touched the strategy.
        self.events
            .publish(RefinementEvent::Phase {
                phase: PipelinePhase::Apply,
            })
            .await;
        let mut analysis = analysis;
        analysis.proposed_code = Some(new_code.clone());
        let new_version = strategy.current_version + 1;
        let new_value = config.focus_metric.extract(&result);

        strategy.code = new_code;
        strategy.current_version = new_version;
        match (strategy.best_metric_value, improvement) {
            (None, _) => {
                // First completed backtest establishes the baseline.
                strategy.best_metric_value = Some(new_value);
                strategy.best_version = new_version;
            }
            (Some(_), Some(delta)) if delta > 0.0 => {
                strategy.best_metric_value = Some(new_value);
                strategy.best_version = new_version;
            }
            _ => {}
        }

        let iteration = Iteration::completed(
            &strategy.id,
            new_version,
            result,
            analysis,
            improvement,
        );
        if let Err(e) = self.history.append(&iteration).await {
            return CycleOutcome::Fatal {
                reason: format!("failed to append iteration record: {e}"),
            };
        }
        if let Err(e) = self.strategies.save(strategy).await {
            return CycleOutcome::Fatal {
                reason: format!("failed to persist strategy v{new_version}: {e}"),
            };
        }

        info!(
            "Iteration committed: {} v{} (improvement: {:?})",
            strategy.name, new_version, improvement
        );
        self.events
            .publish(RefinementEvent::IterationComplete {
                new_version,
                improvement,
            })
            .await;

        CycleOutcome::Completed {
            new_version,
            improvement,
        }
    }

    /// Submit and poll a backtest to a terminal state, retrying transient
    /// failures by resubmitting.
    async fn backtest_step(
        &self,
        strategy: &Strategy,
        control: &watch::Receiver<ControlSignal>,
    ) -> Result<BacktestResult, StepFailure> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let failure = match self
                .backtest
                .submit(&strategy.code, &strategy.qc_project_id)
                .await
            {
                Ok(handle) => match self.await_backtest(&handle, control).await {
                    Ok(result) => return Ok(result),
                    Err(failure) => failure,
                },
                Err(e) if e.is_fatal() => return Err(StepFailure::Fatal(e.to_string())),
                Err(e) => StepFailure::Transient(e.to_string()),
            };
            match failure {
                StepFailure::Transient(reason) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Backtest attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.retry.max_attempts, reason, delay
                    );
                    if !sleep_cancellable(delay, control).await {
                        return Err(StepFailure::Cancelled);
                    }
                }
                StepFailure::Transient(reason) => {
                    return Err(StepFailure::Transient(format!(
                        "backtest failed after {attempt} attempts: {reason}"
                    )));
                }
                other => return Err(other),
            }
        }
    }

    async fn await_backtest(
        &self,
        handle: &BacktestHandle,
        control: &watch::Receiver<ControlSignal>,
    ) -> Result<BacktestResult, StepFailure> {
        let started = Instant::now();
        loop {
            match self.backtest.poll(handle).await {
                Ok(BacktestPoll::Done(result)) => return Ok(result),
                Ok(BacktestPoll::Failed(reason)) => {
                    return Err(StepFailure::Transient(format!("backtest failed: {reason}")));
                }
                Ok(BacktestPoll::Pending) => {}
                Err(e) if e.is_fatal() => return Err(StepFailure::Fatal(e.to_string())),
                // Transient poll errors just mean we keep polling until the
                // overall timeout.
                Err(e) => warn!("Backtest poll error (will keep polling): {}", e),
            }
            if started.elapsed() >= self.settings.backtest_timeout {
                return Err(StepFailure::Transient(format!(
                    "backtest timed out after {:?}",
                    self.settings.backtest_timeout
                )));
            }
            if !sleep_cancellable(self.settings.poll_interval, control).await {
                return Err(StepFailure::Cancelled);
            }
        }
    }

    /// Record exactly one Failed iteration for a non-fatal step failure. The
    /// recorded version is the current, unadvanced one.
    async fn fail_iteration(
        &self,
        strategy: &Strategy,
        failure: StepFailure,
        result: Option<BacktestResult>,
        analysis: Option<Analysis>,
    ) -> CycleOutcome {
        let reason = match failure {
            StepFailure::Cancelled => return CycleOutcome::Cancelled,
            StepFailure::Fatal(reason) => return CycleOutcome::Fatal { reason },
            StepFailure::Transient(reason) => reason,
        };
        let iteration = Iteration::failed(&strategy.id, strategy.current_version, result, analysis);
        if let Err(e) = self.history.append(&iteration).await {
            return CycleOutcome::Fatal {
                reason: format!("failed to record failed iteration: {e}"),
            };
        }
        warn!("Iteration failed for {}: {}", strategy.name, reason);
        self.events
            .publish(RefinementEvent::Error {
                message: reason.clone(),
                fatal: false,
            })
            .await;
        CycleOutcome::Failed { reason }
    }
}

/// Best-effort structural check on generated code: strip a surrounding code
/// fence if present and reject empty output. Deep validation is the backtest
/// provider's job.
pub fn sanitize_generated(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let body = if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Drop the language tag line, if any.
        let after = after
            .split_once('\n')
            .map(|(_, rest)| rest)
            .unwrap_or(after);
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else {
        trimmed
    };
    let body = body.trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_code_passes_through() {
        assert_eq!(
            sanitize_generated("def initialize(): pass\n").as_deref(),
            Some("def initialize(): pass")
        );
    }

    #[test]
    fn fenced_code_is_unwrapped() {
        let raw = "Here is the code:\n```python\ndef initialize(): pass\n```\n";
        assert_eq!(
            sanitize_generated(raw).as_deref(),
            Some("def initialize(): pass")
        );
    }

    #[test]
    fn unterminated_fence_is_tolerated() {
        let raw = "```python\ndef initialize(): pass";
        assert_eq!(
            sanitize_generated(raw).as_deref(),
            Some("def initialize(): pass")
        );
    }

    #[test]
    fn empty_output_is_rejected() {
        assert!(sanitize_generated("").is_none());
        assert!(sanitize_generated("   \n").is_none());
        assert!(sanitize_generated("```python\n```").is_none());
    }
}
