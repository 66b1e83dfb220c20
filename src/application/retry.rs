//! Bounded exponential backoff for transient provider failures.

use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::application::controller::ControlSignal;
use crate::domain::errors::ProviderError;

/// Why a pipeline step gave up.
#[derive(Debug)]
pub enum StepFailure {
    /// Transient failures exhausted their retry budget; the iteration is
    /// recorded as Failed and the loop continues.
    Transient(String),
    /// The loop must transition to `Error`.
    Fatal(String),
    /// A stop request arrived mid-step.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based), doubled each
    /// time, capped, with up to 25% jitter to spread retries.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        capped + capped.mul_f64(rand::random::<f64>() * 0.25)
    }
}

/// Sleep that aborts early when a stop is signalled. Returns `false` when
/// cancelled. Pause is deliberately ignored here: an in-flight step is never
/// interrupted by pause, only by stop.
pub async fn sleep_cancellable(
    duration: Duration,
    control: &watch::Receiver<ControlSignal>,
) -> bool {
    if *control.borrow() == ControlSignal::Stop {
        return false;
    }
    let mut rx = control.clone();
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = rx.changed() => match changed {
                Ok(()) => {
                    if *rx.borrow() == ControlSignal::Stop {
                        return false;
                    }
                }
                // Controller dropped; treat as stop.
                Err(_) => return false,
            },
        }
    }
}

/// Run `op`, retrying transient provider failures with backoff up to the
/// policy's attempt cap.
///
/// `op` is a plain `FnMut() -> Fut` rather than an `AsyncFnMut`: bounding the
/// returned future keeps `Send` inference working when the callers' futures
/// are handed to `tokio::spawn` (rustc cannot prove `Send` through the
/// higher-ranked future type of an async closure).
pub async fn with_retry<T, Fut>(
    policy: &RetryPolicy,
    control: &watch::Receiver<ControlSignal>,
    what: &str,
    mut op: impl FnMut() -> Fut,
) -> Result<T, StepFailure>
where
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} attempt {}/{} failed: {}; retrying in {:?}",
                    what, attempt, policy.max_attempts, e, delay
                );
                if !sleep_cancellable(delay, control).await {
                    return Err(StepFailure::Cancelled);
                }
            }
            Err(e) if e.is_transient() => {
                return Err(StepFailure::Transient(format!(
                    "{} failed after {} attempts: {}",
                    what, attempt, e
                )));
            }
            Err(e) => return Err(StepFailure::Fatal(format!("{} failed: {}", what, e))),
        }
    }
}
