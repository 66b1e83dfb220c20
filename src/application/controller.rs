//! Loop controller: owns the running/paused/stopped state machine and drives
//! the iteration pipeline in a background task.
//!
//! All mutation of `LoopState` goes through this controller (single-writer);
//! any number of readers can take snapshots concurrently. Pause and stop are
//! delivered through a watch channel and honored at checkpoints: pause only
//! between iterations, stop at every suspension point.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::application::cooldown::CooldownScheduler;
use crate::application::pipeline::{CycleOutcome, IterationPipeline};
use crate::domain::errors::LoopError;
use crate::domain::events::RefinementEvent;
use crate::domain::refinement::PlateauDetector;
use crate::domain::repositories::StrategyRepository;
use crate::domain::types::{LoopConfig, LoopState, LoopStatus, Strategy};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Stop,
}

pub struct LoopController {
    state: Arc<RwLock<LoopState>>,
    control: watch::Sender<ControlSignal>,
    pipeline: Arc<IterationPipeline>,
    strategies: Arc<dyn StrategyRepository>,
    events: EventBus,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoopController {
    pub fn new(
        pipeline: Arc<IterationPipeline>,
        strategies: Arc<dyn StrategyRepository>,
        events: EventBus,
    ) -> Self {
        let (control, _) = watch::channel(ControlSignal::Stop);
        Self {
            state: Arc::new(RwLock::new(LoopState::idle())),
            control,
            pipeline,
            strategies,
            events,
            task: Mutex::new(None),
        }
    }

    /// Start the refinement loop for a strategy. Fails if a loop is already
    /// active or the config is invalid; on success the loop runs as a
    /// background task until stopped, capped, plateaued or errored.
    pub async fn start(&self, strategy_id: &str, config: LoopConfig) -> Result<(), LoopError> {
        config.validate()?;

        let strategy = self
            .strategies
            .get(strategy_id)
            .await
            .map_err(|e| LoopError::Storage {
                reason: e.to_string(),
            })?
            .ok_or_else(|| LoopError::StrategyNotFound {
                id: strategy_id.to_string(),
            })?;

        {
            let mut state = self.state.write().await;
            if matches!(
                state.status,
                LoopStatus::Running | LoopStatus::Paused | LoopStatus::Stopping
            ) {
                return Err(LoopError::AlreadyRunning {
                    strategy_id: state.strategy_id.clone().unwrap_or_default(),
                });
            }
            state.status = LoopStatus::Running;
            state.strategy_id = Some(strategy_id.to_string());
            state.current_iteration = 0;
            state.consecutive_non_improvements = 0;
            state.last_error = None;
        }
        self.control.send_replace(ControlSignal::Run);

        info!(
            "Starting refinement loop for strategy {} ({})",
            strategy.name, strategy.id
        );
        self.events
            .publish(RefinementEvent::LoopStarted {
                strategy_id: strategy_id.to_string(),
            })
            .await;

        let task = LoopTask {
            state: Arc::clone(&self.state),
            control: self.control.subscribe(),
            pipeline: Arc::clone(&self.pipeline),
            events: self.events.clone(),
            config,
            strategy,
        };
        let handle = tokio::spawn(task.run());
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Request a pause. Takes effect at the checkpoint between iterations,
    /// never mid-pipeline; `status()` reflects `Paused` once honored.
    pub async fn pause(&self) -> Result<(), LoopError> {
        let state = self.state.read().await;
        match state.status {
            LoopStatus::Running => {
                self.control.send_replace(ControlSignal::Pause);
                Ok(())
            }
            other => Err(LoopError::InvalidTransition {
                from: other,
                action: "pause",
            }),
        }
    }

    /// Resume a paused loop. Also legal while a pause is pending but not yet
    /// honored, in which case the pause is simply withdrawn.
    pub async fn resume(&self) -> Result<(), LoopError> {
        let mut state = self.state.write().await;
        let pause_pending = *self.control.borrow() == ControlSignal::Pause;
        match state.status {
            LoopStatus::Paused => {
                state.status = LoopStatus::Running;
                self.control.send_replace(ControlSignal::Run);
                Ok(())
            }
            LoopStatus::Running if pause_pending => {
                self.control.send_replace(ControlSignal::Run);
                Ok(())
            }
            other => Err(LoopError::InvalidTransition {
                from: other,
                action: "resume",
            }),
        }
    }

    /// Request a stop. Transitions to `Stopping` immediately, then `Stopped`
    /// once the loop reaches its next cancellation checkpoint. Idempotent
    /// when already stopped.
    pub async fn stop(&self) -> Result<(), LoopError> {
        let emit_stopped = {
            let mut state = self.state.write().await;
            match state.status {
                LoopStatus::Idle | LoopStatus::Stopped => return Ok(()),
                LoopStatus::Error => {
                    // The loop task is already gone; close out directly.
                    state.status = LoopStatus::Stopped;
                    true
                }
                LoopStatus::Running | LoopStatus::Paused | LoopStatus::Stopping => {
                    state.status = LoopStatus::Stopping;
                    false
                }
            }
        };
        if emit_stopped {
            self.events.publish(RefinementEvent::LoopStopped).await;
        } else {
            self.control.send_replace(ControlSignal::Stop);
        }
        Ok(())
    }

    /// Consistent snapshot of the loop state; safe to call from any number
    /// of concurrent readers.
    pub async fn status(&self) -> LoopState {
        self.state.read().await.clone()
    }

    /// Wait for the background loop task to finish. Used by shutdown and by
    /// tests; returns immediately when no loop is running.
    pub async fn join(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

enum Checkpoint {
    Continue,
    Halt,
}

struct LoopTask {
    state: Arc<RwLock<LoopState>>,
    control: watch::Receiver<ControlSignal>,
    pipeline: Arc<IterationPipeline>,
    events: EventBus,
    config: LoopConfig,
    strategy: Strategy,
}

impl LoopTask {
    async fn run(mut self) {
        let detector = PlateauDetector::new(self.config.improvement_threshold);
        let cooldown = CooldownScheduler::new(Duration::from_secs(self.config.cooldown_seconds));

        loop {
            if let Checkpoint::Halt = self.checkpoint().await {
                break;
            }

            if let Some(cap) = self.config.max_iterations {
                let done = self.state.read().await.current_iteration;
                if done >= cap {
                    info!("Iteration cap of {} reached; stopping loop", cap);
                    break;
                }
            }

            {
                let mut state = self.state.write().await;
                state.current_iteration += 1;
            }

            let outcome = self
                .pipeline
                .run_cycle(&mut self.strategy, &self.config, &self.control)
                .await;

            let improvement = match outcome {
                CycleOutcome::Completed { improvement, .. } => improvement,
                CycleOutcome::Failed { .. } => None,
                CycleOutcome::Cancelled => break,
                CycleOutcome::Fatal { reason } => {
                    error!("Fatal loop error: {}", reason);
                    {
                        let mut state = self.state.write().await;
                        state.status = LoopStatus::Error;
                        state.last_error = Some(reason.clone());
                    }
                    self.events
                        .publish(RefinementEvent::Error {
                            message: reason,
                            fatal: true,
                        })
                        .await;
                    return;
                }
            };

            let plateaued = {
                let mut state = self.state.write().await;
                state.consecutive_non_improvements =
                    detector.update(state.consecutive_non_improvements, improvement);
                detector.is_plateau(state.consecutive_non_improvements)
            };
            if plateaued && self.config.auto_stop_on_plateau {
                info!(
                    "Performance plateaued ({} consecutive sub-threshold iterations); stopping",
                    crate::domain::types::PLATEAU_WINDOW
                );
                break;
            }

            self.events
                .publish(RefinementEvent::Cooldown {
                    seconds: self.config.cooldown_seconds,
                })
                .await;
            // Either the cooldown elapses or a pause/stop interrupts it; the
            // checkpoint at the top of the loop sorts out which.
            let _ = cooldown.wait(&self.control).await;
        }

        {
            let mut state = self.state.write().await;
            state.status = LoopStatus::Stopped;
        }
        info!("Refinement loop stopped for strategy {}", self.strategy.id);
        self.events.publish(RefinementEvent::LoopStopped).await;
    }

    /// Honor pending pause/stop between iterations. Blocks while paused.
    async fn checkpoint(&mut self) -> Checkpoint {
        loop {
            let signal = *self.control.borrow_and_update();
            match signal {
                ControlSignal::Run => {
                    let mut state = self.state.write().await;
                    if state.status == LoopStatus::Paused {
                        state.status = LoopStatus::Running;
                    }
                    return Checkpoint::Continue;
                }
                ControlSignal::Stop => return Checkpoint::Halt,
                ControlSignal::Pause => {
                    {
                        let mut state = self.state.write().await;
                        if state.status == LoopStatus::Running {
                            info!("Refinement loop paused");
                            state.status = LoopStatus::Paused;
                        }
                    }
                    if self.control.changed().await.is_err() {
                        return Checkpoint::Halt;
                    }
                }
            }
        }
    }
}
