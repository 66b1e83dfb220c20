use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

use crate::domain::types::{FocusMetric, LoopConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// In-memory repositories and mock providers; no credentials needed.
    Mock,
    /// QuantConnect + Anthropic against a sqlite database.
    Live,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            "live" => Ok(Mode::Live),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'mock' or 'live'", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub database_url: String,
    pub qc_user_id: String,
    pub qc_api_token: String,
    pub anthropic_api_key: String,
    pub anthropic_model: Option<String>,
    /// Strategy to refine at startup; when unset in mock mode a demo
    /// strategy is seeded.
    pub strategy_id: Option<String>,
    pub loop_config: LoopConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mode: Mode = env_or("MODE", "mock").parse()?;

        let qc_user_id = env::var("QC_USER_ID").unwrap_or_default();
        let qc_api_token = env::var("QC_API_TOKEN").unwrap_or_default();
        let anthropic_api_key = env::var("ANTHROPIC_API_KEY").unwrap_or_default();
        if mode == Mode::Live {
            anyhow::ensure!(
                !qc_user_id.is_empty() && !qc_api_token.is_empty(),
                "QC_USER_ID and QC_API_TOKEN are required in live mode"
            );
            anyhow::ensure!(
                !anthropic_api_key.is_empty(),
                "ANTHROPIC_API_KEY is required in live mode"
            );
        }

        let max_iterations = match env::var("MAX_ITERATIONS") {
            Ok(value) => Some(
                value
                    .parse::<u32>()
                    .context("Invalid MAX_ITERATIONS, must be a positive integer")?,
            ),
            Err(_) => None,
        };

        let loop_config = LoopConfig {
            max_iterations,
            cooldown_seconds: parse_env("COOLDOWN_SECONDS", 60)?,
            focus_metric: env_or("FOCUS_METRIC", "sharpe").parse::<FocusMetric>()?,
            improvement_threshold: parse_env("IMPROVEMENT_THRESHOLD", 0.01)?,
            auto_stop_on_plateau: parse_env("AUTO_STOP_ON_PLATEAU", true)?,
        };

        Ok(Self {
            mode,
            database_url: env_or("DATABASE_URL", "sqlite://data/refinery.db"),
            qc_user_id,
            qc_api_token,
            anthropic_api_key,
            anthropic_model: env::var("ANTHROPIC_MODEL").ok(),
            strategy_id: env::var("STRATEGY_ID").ok(),
            loop_config,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}
