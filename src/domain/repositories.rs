//! Repository abstractions for strategies and iteration history.
//!
//! The iteration repository is the loop's history store: an append-only,
//! per-strategy log. It is never updated or deleted from; `recent` feeds the
//! analysis context so the loop does not re-propose hypotheses that already
//! failed.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::types::{Iteration, Strategy};

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Strategy>>;

    async fn save(&self, strategy: &Strategy) -> Result<()>;

    async fn list(&self) -> Result<Vec<Strategy>>;
}

#[async_trait]
pub trait IterationRepository: Send + Sync {
    /// Append an iteration record. Records are immutable once written.
    async fn append(&self, iteration: &Iteration) -> Result<()>;

    /// Most recent iterations for a strategy, newest first.
    async fn recent(&self, strategy_id: &str, limit: usize) -> Result<Vec<Iteration>>;

    async fn count(&self, strategy_id: &str) -> Result<usize>;
}
