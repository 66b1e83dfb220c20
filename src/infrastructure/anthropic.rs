//! Anthropic messages-API client implementing the analysis port.
//!
//! `analyze` asks for a JSON diagnosis/hypothesis; `generate` asks for the
//! full modified strategy code. When the model's analysis cannot be parsed
//! the client degrades to a low-confidence placeholder instead of failing
//! the iteration; generation output is validated downstream by the pipeline.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::warn;

use crate::domain::errors::ProviderError;
use crate::domain::ports::{AnalysisRequest, AnalysisService, HistoryEntry};
use crate::domain::types::{Analysis, Confidence};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const ANALYZE_MAX_TOKENS: u32 = 2000;
const GENERATE_MAX_TOKENS: u32 = 8000;

pub struct AnthropicAnalysisService {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicAnalysisService {
    pub fn new(api_key: impl Into<String>, model: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.model,
                "max_tokens": max_tokens,
                "messages": [{"role": "user", "content": prompt}],
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout { waited_secs: 120 }
                } else {
                    ProviderError::Transport(e)
                }
            })?;

        match response.status().as_u16() {
            401 | 403 => {
                return Err(ProviderError::Credentials {
                    reason: format!("Anthropic returned {}", response.status()),
                });
            }
            429 => {
                let retry_after_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30);
                return Err(ProviderError::RateLimited { retry_after_secs });
            }
            529 => {
                return Err(ProviderError::RateLimited {
                    retry_after_secs: 30,
                });
            }
            _ => {}
        }
        let response = response.error_for_status()?;
        let value: Value = response.json().await?;
        value["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Malformed {
                reason: "message response missing content text".to_string(),
            })
    }
}

#[async_trait]
impl AnalysisService for AnthropicAnalysisService {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, ProviderError> {
        let prompt = analyze_prompt(request);
        let text = self.complete(&prompt, ANALYZE_MAX_TOKENS).await?;
        Ok(parse_analysis(&text).unwrap_or_else(|| {
            warn!("Could not parse analysis response; using fallback");
            Analysis {
                diagnosis: "Unable to parse detailed analysis".to_string(),
                hypothesis: "Consider parameter optimization".to_string(),
                confidence: Confidence::Low,
                proposed_code: None,
            }
        }))
    }

    async fn generate(
        &self,
        hypothesis: &str,
        current_code: &str,
    ) -> Result<String, ProviderError> {
        let prompt = generate_prompt(hypothesis, current_code);
        self.complete(&prompt, GENERATE_MAX_TOKENS).await
    }
}

fn analyze_prompt(request: &AnalysisRequest) -> String {
    let metrics = &request.metrics;
    format!(
        "You are analyzing trading strategy backtest results for autonomous refinement.\n\n\
         ## Strategy\n{name}\n\n\
         ## Current Backtest Results\n\
         Sharpe Ratio: {sharpe:.3}\n\
         Max Drawdown: {drawdown:.2}%\n\
         Total Return: {ret:.2}%\n\
         Win Rate: {win:.2}%\n\
         Trade Count: {trades}\n\n\
         ## Previous Iterations\n{history}\n\n\
         ## Focus Metric\n\
         Primary optimization target: {focus}\n\
         Improvement threshold: {threshold:.1}%\n\n\
         ## Current Code\n```python\n{code}\n```\n\n\
         Analyze these results and identify the single biggest weakness and a \
         specific, testable change to address it. Respond in JSON format:\n\
         {{\"diagnosis\": \"...\", \"hypothesis\": \"...\", \"confidence\": \"low|medium|high\"}}",
        name = request.strategy_name,
        sharpe = metrics.sharpe_ratio,
        drawdown = metrics.max_drawdown * 100.0,
        ret = metrics.total_return * 100.0,
        win = metrics.win_rate * 100.0,
        trades = metrics.trade_count,
        history = history_context(&request.history),
        focus = request.focus_metric,
        threshold = request.improvement_threshold * 100.0,
        code = request.current_code,
    )
}

fn generate_prompt(hypothesis: &str, current_code: &str) -> String {
    format!(
        "You are modifying a trading algorithm based on analysis.\n\n\
         ## Current Code\n```python\n{current_code}\n```\n\n\
         ## Hypothesis\n{hypothesis}\n\n\
         ## Instructions\n\
         1. Implement the hypothesis with minimal, focused changes\n\
         2. Preserve all existing functionality unless explicitly changing it\n\
         3. The code must remain syntactically valid and ready to compile\n\n\
         Return ONLY the complete updated code, no explanations."
    )
}

/// Render the recent-iteration summary the model sees. One line per
/// iteration, newest first.
fn history_context(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return "No previous iterations".to_string();
    }
    history
        .iter()
        .map(|entry| {
            let metrics = match (entry.sharpe_ratio, entry.max_drawdown, entry.win_rate) {
                (Some(sharpe), Some(drawdown), Some(win)) => format!(
                    "Sharpe {sharpe:.3}, DD {:.2}%, WR {:.2}%",
                    drawdown * 100.0,
                    win * 100.0
                ),
                _ => "backtest failed".to_string(),
            };
            let tried = entry.hypothesis.as_deref().unwrap_or("n/a");
            let improvement = entry
                .improvement
                .map(|i| format!("{:+.2}%", i * 100.0))
                .unwrap_or_else(|| "n/a".to_string());
            format!(
                "v{}: {} | tried: {} | improvement: {}",
                entry.version, metrics, tried, improvement
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pull the analysis JSON out of the model text, tolerating fenced output
/// and surrounding prose.
fn parse_analysis(text: &str) -> Option<Analysis> {
    let candidate = if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        after.find("```").map(|end| &after[..end])?
    } else if let Some(start) = text.find('{') {
        let end = text.rfind('}')?;
        &text[start..=end]
    } else {
        return None;
    };

    let value: Value = serde_json::from_str(candidate.trim()).ok()?;
    let confidence = match value["confidence"].as_str()? {
        "high" => Confidence::High,
        "medium" => Confidence::Medium,
        _ => Confidence::Low,
    };
    Some(Analysis {
        diagnosis: value["diagnosis"].as_str()?.to_string(),
        hypothesis: value["hypothesis"].as_str()?.to_string(),
        confidence,
        proposed_code: None,
    })
}
