use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::domain::types::Confidence;

/// Pipeline step currently executing, announced before each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    Backtest,
    Analysis,
    Generation,
    Apply,
}

/// Events emitted by the refinement loop.
///
/// The serialized shapes are a stable contract consumed by transports and
/// observers; renaming a field here is a breaking change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RefinementEvent {
    LoopStarted {
        strategy_id: String,
    },
    Phase {
        phase: PipelinePhase,
    },
    BacktestComplete {
        sharpe: f64,
        max_drawdown: f64,
        total_return: f64,
        win_rate: f64,
        trade_count: u64,
    },
    AnalysisComplete {
        diagnosis: String,
        hypothesis: String,
        confidence: Confidence,
    },
    IterationComplete {
        new_version: u32,
        improvement: Option<f64>,
    },
    Cooldown {
        seconds: u64,
    },
    Error {
        message: String,
        fatal: bool,
    },
    LoopStopped,
}

/// Observer of refinement events. Implementations must not block; the loop
/// publishes from its own task.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &RefinementEvent);
}

/// Listener that traces every event.
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&self, event: &RefinementEvent) {
        match event {
            RefinementEvent::Error { message, fatal } => {
                error!(fatal, "Loop error: {}", message);
            }
            other => info!("Loop event: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loop_started_shape() {
        let event = RefinementEvent::LoopStarted {
            strategy_id: "s-1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "loop_started", "strategy_id": "s-1"})
        );
    }

    #[test]
    fn phase_shape() {
        let event = RefinementEvent::Phase {
            phase: PipelinePhase::Backtest,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "phase", "phase": "backtest"})
        );
    }

    #[test]
    fn backtest_complete_shape() {
        let event = RefinementEvent::BacktestComplete {
            sharpe: 1.2,
            max_drawdown: 0.15,
            total_return: 0.34,
            win_rate: 0.55,
            trade_count: 42,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "backtest_complete");
        assert_eq!(value["sharpe"], 1.2);
        assert_eq!(value["trade_count"], 42);
    }

    #[test]
    fn iteration_complete_shape() {
        let event = RefinementEvent::IterationComplete {
            new_version: 3,
            improvement: Some(0.05),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "iteration_complete", "new_version": 3, "improvement": 0.05})
        );
    }

    #[test]
    fn error_and_stopped_shapes() {
        let event = RefinementEvent::Error {
            message: "backtest timed out".to_string(),
            fatal: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["fatal"], false);

        assert_eq!(
            serde_json::to_value(&RefinementEvent::LoopStopped).unwrap(),
            json!({"type": "loop_stopped"})
        );
    }
}
