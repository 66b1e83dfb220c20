//! QuantConnect API client implementing the backtest port.
//!
//! `submit` pushes the strategy code into the bound project, compiles it and
//! starts a backtest; `poll` reads the backtest until it reports completion.
//! Compile errors are terminal rejections, HTTP 429 maps to a rate-limit
//! signal and request timeouts surface as transient timeouts.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::errors::ProviderError;
use crate::domain::ports::{BacktestHandle, BacktestPoll, BacktestService};
use crate::domain::types::BacktestResult;

const DEFAULT_BASE_URL: &str = "https://www.quantconnect.com/api/v2";
const COMPILE_POLL_ATTEMPTS: u32 = 30;
const COMPILE_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct QuantConnectClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    api_token: String,
}

impl QuantConnectClient {
    pub fn new(user_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self::with_base_url(user_id, api_token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        user_id: impl Into<String>,
        api_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            user_id: user_id.into(),
            api_token: api_token.into(),
        }
    }

    /// QC authenticates with a sha256 hash of `token:timestamp`.
    fn auth(&self) -> (String, String) {
        let timestamp = Utc::now().timestamp().to_string();
        let digest = hex::encode(Sha256::digest(format!(
            "{}:{}",
            self.api_token, timestamp
        )));
        (
            timestamp,
            format!("Basic {}:{}", self.user_id, digest),
        )
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, ProviderError> {
        let (timestamp, authorization) = self.auth();
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, endpoint))
            .header("Timestamp", timestamp)
            .header("Authorization", authorization)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout { waited_secs: 60 }
                } else {
                    ProviderError::Transport(e)
                }
            })?;

        match response.status().as_u16() {
            401 | 403 => {
                return Err(ProviderError::Credentials {
                    reason: format!("QuantConnect returned {}", response.status()),
                });
            }
            429 => {
                let retry_after_secs = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                return Err(ProviderError::RateLimited { retry_after_secs });
            }
            _ => {}
        }
        let response = response.error_for_status()?;
        let value: Value = response.json().await?;
        if value["success"] == json!(false) {
            let errors = value["errors"]
                .as_array()
                .map(|errs| {
                    errs.iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .unwrap_or_default();
            return Err(ProviderError::Malformed {
                reason: format!("{endpoint} reported failure: {errors}"),
            });
        }
        Ok(value)
    }

    async fn update_file(&self, project_id: &str, code: &str) -> Result<(), ProviderError> {
        self.post(
            "files/update",
            json!({
                "projectId": project_id,
                "name": "main.py",
                "content": code,
            }),
        )
        .await?;
        Ok(())
    }

    async fn compile(&self, project_id: &str) -> Result<String, ProviderError> {
        let created = self
            .post("compile/create", json!({ "projectId": project_id }))
            .await?;
        let compile_id = created["compileId"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed {
                reason: "compile/create response missing compileId".to_string(),
            })?
            .to_string();

        for _ in 0..COMPILE_POLL_ATTEMPTS {
            let status = self
                .post(
                    "compile/read",
                    json!({ "projectId": project_id, "compileId": compile_id }),
                )
                .await?;
            match status["state"].as_str().unwrap_or_default() {
                "BuildSuccess" => return Ok(compile_id),
                "BuildError" => {
                    let errors = status["errors"]
                        .as_array()
                        .map(|errs| {
                            errs.iter()
                                .filter_map(Value::as_str)
                                .collect::<Vec<_>>()
                                .join("; ")
                        })
                        .unwrap_or_default();
                    return Err(ProviderError::Rejected {
                        reason: format!("compilation failed: {errors}"),
                    });
                }
                _ => tokio::time::sleep(COMPILE_POLL_INTERVAL).await,
            }
        }
        Err(ProviderError::Timeout {
            waited_secs: COMPILE_POLL_ATTEMPTS as u64,
        })
    }
}

#[async_trait]
impl BacktestService for QuantConnectClient {
    async fn submit(&self, code: &str, project_id: &str) -> Result<BacktestHandle, ProviderError> {
        self.update_file(project_id, code).await?;
        let compile_id = self.compile(project_id).await?;

        let created = self
            .post(
                "backtests/create",
                json!({
                    "projectId": project_id,
                    "compileId": compile_id,
                    "backtestName": format!("refinery {}", Utc::now().format("%Y%m%d_%H%M%S")),
                }),
            )
            .await?;
        let backtest_id = created["backtestId"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed {
                reason: "backtests/create response missing backtestId".to_string(),
            })?
            .to_string();

        info!("Backtest {} submitted for project {}", backtest_id, project_id);
        Ok(BacktestHandle {
            backtest_id,
            project_id: project_id.to_string(),
        })
    }

    async fn poll(&self, handle: &BacktestHandle) -> Result<BacktestPoll, ProviderError> {
        let value = self
            .post(
                "backtests/read",
                json!({
                    "projectId": handle.project_id,
                    "backtestId": handle.backtest_id,
                }),
            )
            .await?;
        let backtest = &value["backtest"];

        if let Some(error) = backtest["error"].as_str()
            && !error.is_empty()
        {
            return Ok(BacktestPoll::Failed(error.to_string()));
        }
        if backtest["completed"].as_bool() != Some(true) {
            debug!("Backtest {} still running", handle.backtest_id);
            return Ok(BacktestPoll::Pending);
        }

        Ok(BacktestPoll::Done(parse_backtest_result(backtest)))
    }
}

fn parse_backtest_result(backtest: &Value) -> BacktestResult {
    BacktestResult {
        sharpe_ratio: backtest["sharpeRatio"].as_f64().unwrap_or(0.0),
        max_drawdown: backtest["drawdown"].as_f64().unwrap_or(0.0),
        total_return: backtest["totalPerformance"].as_f64().unwrap_or(0.0),
        win_rate: backtest["winRate"].as_f64().unwrap_or(0.0),
        trade_count: backtest["totalOrders"].as_u64().unwrap_or(0),
    }
}
