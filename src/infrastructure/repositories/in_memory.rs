//! In-memory repository implementations.
//!
//! Thread-safe via `Arc<RwLock>`; used by tests and by mock-mode runs where
//! nothing needs to survive a restart. The sqlite implementations in
//! `infrastructure::persistence` are the durable counterparts.

use crate::domain::repositories::{IterationRepository, StrategyRepository};
use crate::domain::types::{Iteration, Strategy};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct InMemoryStrategyRepository {
    strategies: Arc<RwLock<HashMap<String, Strategy>>>,
}

impl InMemoryStrategyRepository {
    pub fn new() -> Self {
        Self {
            strategies: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStrategyRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategyRepository for InMemoryStrategyRepository {
    async fn get(&self, id: &str) -> Result<Option<Strategy>> {
        Ok(self.strategies.read().await.get(id).cloned())
    }

    async fn save(&self, strategy: &Strategy) -> Result<()> {
        self.strategies
            .write()
            .await
            .insert(strategy.id.clone(), strategy.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Strategy>> {
        Ok(self.strategies.read().await.values().cloned().collect())
    }
}

pub struct InMemoryIterationRepository {
    iterations: Arc<RwLock<Vec<Iteration>>>,
}

impl InMemoryIterationRepository {
    pub fn new() -> Self {
        Self {
            iterations: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for InMemoryIterationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IterationRepository for InMemoryIterationRepository {
    async fn append(&self, iteration: &Iteration) -> Result<()> {
        self.iterations.write().await.push(iteration.clone());
        Ok(())
    }

    async fn recent(&self, strategy_id: &str, limit: usize) -> Result<Vec<Iteration>> {
        let iterations = self.iterations.read().await;
        Ok(iterations
            .iter()
            .rev()
            .filter(|i| i.strategy_id == strategy_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, strategy_id: &str) -> Result<usize> {
        let iterations = self.iterations.read().await;
        Ok(iterations
            .iter()
            .filter(|i| i.strategy_id == strategy_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Analysis, BacktestResult, Confidence};

    fn sample_result() -> BacktestResult {
        BacktestResult {
            sharpe_ratio: 1.1,
            max_drawdown: 0.12,
            total_return: 0.3,
            win_rate: 0.52,
            trade_count: 40,
        }
    }

    fn sample_analysis() -> Analysis {
        Analysis {
            diagnosis: "d".to_string(),
            hypothesis: "h".to_string(),
            confidence: Confidence::High,
            proposed_code: Some("code".to_string()),
        }
    }

    #[tokio::test]
    async fn strategy_roundtrip() {
        let repo = InMemoryStrategyRepository::new();
        let strategy = Strategy::new("mean-reversion", "code", "42");
        repo.save(&strategy).await.unwrap();

        let loaded = repo.get(&strategy.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "mean-reversion");
        assert!(repo.get("missing").await.unwrap().is_none());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_bounded() {
        let repo = InMemoryIterationRepository::new();
        for version in 2..=6 {
            let iteration = Iteration::completed(
                "s-1",
                version,
                sample_result(),
                sample_analysis(),
                Some(0.02),
            );
            repo.append(&iteration).await.unwrap();
        }
        // A different strategy must not leak in.
        repo.append(&Iteration::completed(
            "s-2",
            2,
            sample_result(),
            sample_analysis(),
            None,
        ))
        .await
        .unwrap();

        let recent = repo.recent("s-1", 3).await.unwrap();
        assert_eq!(
            recent.iter().map(|i| i.version).collect::<Vec<_>>(),
            vec![6, 5, 4]
        );
        assert_eq!(repo.count("s-1").await.unwrap(), 5);
        assert_eq!(repo.count("s-2").await.unwrap(), 1);
    }
}
