use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Singleton database wrapper
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                code TEXT NOT NULL,
                qc_project_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                current_version INTEGER NOT NULL DEFAULT 1,
                best_metric_value REAL,
                best_version INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategies table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS iterations (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                backtest_result TEXT,
                analysis TEXT,
                improvement REAL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (strategy_id) REFERENCES strategies(id)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create iterations table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_iterations_strategy
             ON iterations(strategy_id, created_at DESC)",
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create iterations index")?;

        Ok(())
    }
}
