//! Cancellable delay between iteration attempts.

use std::time::Duration;

use tokio::sync::watch;

use crate::application::controller::ControlSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    /// A pause or stop arrived; the caller's checkpoint decides what to do.
    Interrupted,
}

/// Waits out the configured cooldown between iterations without ever
/// blocking a pause or stop request for the full duration.
pub struct CooldownScheduler {
    duration: Duration,
}

impl CooldownScheduler {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub async fn wait(&self, control: &watch::Receiver<ControlSignal>) -> WaitOutcome {
        if self.duration.is_zero() {
            return WaitOutcome::Elapsed;
        }
        if *control.borrow() != ControlSignal::Run {
            return WaitOutcome::Interrupted;
        }
        let mut rx = control.clone();
        let sleep = tokio::time::sleep(self.duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return WaitOutcome::Elapsed,
                changed = rx.changed() => match changed {
                    Ok(()) => {
                        if *rx.borrow() != ControlSignal::Run {
                            return WaitOutcome::Interrupted;
                        }
                    }
                    Err(_) => return WaitOutcome::Interrupted,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn zero_cooldown_returns_immediately() {
        let (_tx, rx) = watch::channel(ControlSignal::Run);
        let scheduler = CooldownScheduler::new(Duration::ZERO);
        assert_eq!(scheduler.wait(&rx).await, WaitOutcome::Elapsed);
    }

    #[tokio::test]
    async fn short_cooldown_elapses() {
        let (_tx, rx) = watch::channel(ControlSignal::Run);
        let scheduler = CooldownScheduler::new(Duration::from_millis(10));
        assert_eq!(scheduler.wait(&rx).await, WaitOutcome::Elapsed);
    }

    #[tokio::test]
    async fn stop_interrupts_long_cooldown_promptly() {
        let (tx, rx) = watch::channel(ControlSignal::Run);
        let scheduler = CooldownScheduler::new(Duration::from_secs(60));
        let started = Instant::now();
        let waiter = tokio::spawn(async move { scheduler.wait(&rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(ControlSignal::Stop);
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome, WaitOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn pause_interrupts_cooldown() {
        let (tx, rx) = watch::channel(ControlSignal::Run);
        let scheduler = CooldownScheduler::new(Duration::from_secs(60));
        let waiter = tokio::spawn(async move { scheduler.wait(&rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(ControlSignal::Pause);
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Interrupted);
    }

    #[tokio::test]
    async fn entry_with_pending_pause_does_not_wait() {
        let (tx, rx) = watch::channel(ControlSignal::Run);
        tx.send_replace(ControlSignal::Pause);
        let scheduler = CooldownScheduler::new(Duration::from_secs(60));
        assert_eq!(scheduler.wait(&rx).await, WaitOutcome::Interrupted);
    }
}
