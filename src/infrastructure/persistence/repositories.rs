//! Sqlite-backed repository implementations.
//!
//! Backtest results and analyses are stored as JSON columns; the loop only
//! ever reads them back whole, so there is nothing to gain from flattening
//! them into relational columns.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::domain::repositories::{IterationRepository, StrategyRepository};
use crate::domain::types::{Iteration, IterationStatus, Strategy};

pub struct SqliteStrategyRepository {
    pool: SqlitePool,
}

impl SqliteStrategyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &SqliteRow) -> Result<Strategy> {
        let created_at: i64 = row.try_get("created_at")?;
        Ok(Strategy {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            code: row.try_get("code")?,
            qc_project_id: row.try_get("qc_project_id")?,
            created_at: Utc
                .timestamp_opt(created_at, 0)
                .single()
                .unwrap_or_default(),
            current_version: row.try_get::<i64, _>("current_version")? as u32,
            best_metric_value: row.try_get("best_metric_value")?,
            best_version: row.try_get::<i64, _>("best_version")? as u32,
        })
    }
}

#[async_trait]
impl StrategyRepository for SqliteStrategyRepository {
    async fn get(&self, id: &str) -> Result<Option<Strategy>> {
        let row = sqlx::query("SELECT * FROM strategies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn save(&self, strategy: &Strategy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategies
            (id, name, description, code, qc_project_id, created_at, current_version, best_metric_value, best_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                code = excluded.code,
                qc_project_id = excluded.qc_project_id,
                current_version = excluded.current_version,
                best_metric_value = excluded.best_metric_value,
                best_version = excluded.best_version
            "#,
        )
        .bind(&strategy.id)
        .bind(&strategy.name)
        .bind(&strategy.description)
        .bind(&strategy.code)
        .bind(&strategy.qc_project_id)
        .bind(strategy.created_at.timestamp())
        .bind(strategy.current_version as i64)
        .bind(strategy.best_metric_value)
        .bind(strategy.best_version as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save strategy")?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<Strategy>> {
        let rows = sqlx::query("SELECT * FROM strategies ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::from_row).collect()
    }
}

pub struct SqliteIterationRepository {
    pool: SqlitePool,
}

impl SqliteIterationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn from_row(row: &SqliteRow) -> Result<Iteration> {
        let backtest_result: Option<String> = row.try_get("backtest_result")?;
        let analysis: Option<String> = row.try_get("analysis")?;
        let status: String = row.try_get("status")?;
        let created_at: i64 = row.try_get("created_at")?;

        Ok(Iteration {
            id: row.try_get("id")?,
            strategy_id: row.try_get("strategy_id")?,
            version: row.try_get::<i64, _>("version")? as u32,
            backtest_result: backtest_result
                .map(|json| serde_json::from_str(&json))
                .transpose()
                .context("Failed to decode backtest_result")?,
            analysis: analysis
                .map(|json| serde_json::from_str(&json))
                .transpose()
                .context("Failed to decode analysis")?,
            improvement: row.try_get("improvement")?,
            status: match status.as_str() {
                "completed" => IterationStatus::Completed,
                _ => IterationStatus::Failed,
            },
            created_at: Utc
                .timestamp_opt(created_at, 0)
                .single()
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl IterationRepository for SqliteIterationRepository {
    async fn append(&self, iteration: &Iteration) -> Result<()> {
        let backtest_result = iteration
            .backtest_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let analysis = iteration
            .analysis
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let status = match iteration.status {
            IterationStatus::Completed => "completed",
            IterationStatus::Failed => "failed",
        };

        sqlx::query(
            r#"
            INSERT INTO iterations
            (id, strategy_id, version, backtest_result, analysis, improvement, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&iteration.id)
        .bind(&iteration.strategy_id)
        .bind(iteration.version as i64)
        .bind(backtest_result)
        .bind(analysis)
        .bind(iteration.improvement)
        .bind(status)
        .bind(iteration.created_at.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to append iteration")?;

        Ok(())
    }

    async fn recent(&self, strategy_id: &str, limit: usize) -> Result<Vec<Iteration>> {
        // Append-only table: rowid order is insertion order, which breaks
        // ties between records written within the same second.
        let rows = sqlx::query(
            "SELECT * FROM iterations WHERE strategy_id = ?
             ORDER BY rowid DESC LIMIT ?",
        )
        .bind(strategy_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn count(&self, strategy_id: &str) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM iterations WHERE strategy_id = ?")
            .bind(strategy_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as usize)
    }
}
