use thiserror::Error;

use crate::domain::types::LoopStatus;

/// Errors surfaced by the loop controller's operations.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("Refinement loop already active for strategy {strategy_id}")]
    AlreadyRunning { strategy_id: String },

    #[error("Invalid loop config: {reason}")]
    InvalidConfig { reason: String },

    #[error("Cannot {action} while loop is {from:?}")]
    InvalidTransition { from: LoopStatus, action: &'static str },

    #[error("Strategy not found: {id}")]
    StrategyNotFound { id: String },

    #[error("Storage error: {reason}")]
    Storage { reason: String },
}

/// Errors from the external backtest and analysis providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider timed out after {waited_secs}s")]
    Timeout { waited_secs: u64 },

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Rejected by provider: {reason}")]
    Rejected { reason: String },

    #[error("Invalid credentials: {reason}")]
    Credentials { reason: String },

    #[error("Malformed provider response: {reason}")]
    Malformed { reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProviderError {
    /// Transient failures are retried with backoff; everything else is
    /// terminal for the current operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::Malformed { .. }
                | ProviderError::Transport(_)
        )
    }

    /// Fatal failures put the whole loop into `Error` instead of failing a
    /// single iteration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProviderError::Rejected { .. } | ProviderError::Credentials { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout { waited_secs: 30 }.is_transient());
        assert!(
            ProviderError::RateLimited {
                retry_after_secs: 60
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Rejected {
                reason: "syntax error".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(
            ProviderError::Credentials {
                reason: "bad token".to_string()
            }
            .is_fatal()
        );
        assert!(!ProviderError::Timeout { waited_secs: 30 }.is_fatal());
    }

    #[test]
    fn loop_error_formatting() {
        let err = LoopError::AlreadyRunning {
            strategy_id: "abc".to_string(),
        };
        assert!(err.to_string().contains("abc"));

        let err = LoopError::InvalidTransition {
            from: LoopStatus::Stopped,
            action: "pause",
        };
        assert!(err.to_string().contains("pause"));
        assert!(err.to_string().contains("Stopped"));
    }
}
