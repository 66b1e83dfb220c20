//! Refinery server - headless autonomous strategy refinement
//!
//! Runs the refinement loop without any UI. Events are traced to stdout;
//! the loop survives client disconnects because nothing here depends on a
//! connected observer.
//!
//! # Usage
//! ```sh
//! MODE=mock cargo run
//! MODE=live STRATEGY_ID=... QC_USER_ID=... QC_API_TOKEN=... ANTHROPIC_API_KEY=... cargo run
//! ```

use std::sync::Arc;

use anyhow::Result;
use refinery::application::controller::LoopController;
use refinery::application::pipeline::{IterationPipeline, PipelineSettings};
use refinery::application::retry::RetryPolicy;
use refinery::config::{Config, Mode};
use refinery::domain::events::LoggingListener;
use refinery::domain::ports::{AnalysisService, BacktestService};
use refinery::domain::repositories::{IterationRepository, StrategyRepository};
use refinery::domain::types::Strategy;
use refinery::infrastructure::anthropic::AnthropicAnalysisService;
use refinery::infrastructure::event_bus::EventBus;
use refinery::infrastructure::mock::{MockAnalysisService, MockBacktestService};
use refinery::infrastructure::persistence::database::Database;
use refinery::infrastructure::persistence::repositories::{
    SqliteIterationRepository, SqliteStrategyRepository,
};
use refinery::infrastructure::quantconnect::QuantConnectClient;
use refinery::infrastructure::{InMemoryIterationRepository, InMemoryStrategyRepository};
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

const DEMO_CODE: &str = "\
class DemoAlgorithm(QCAlgorithm):
    def initialize(self):
        self.set_start_date(2022, 1, 1)
        self.add_equity('SPY', Resolution.DAILY)
";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Refinery {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!("Mode: {:?}, loop config: {:?}", config.mode, config.loop_config);

    let (strategies, history): (Arc<dyn StrategyRepository>, Arc<dyn IterationRepository>) =
        match config.mode {
            Mode::Mock => (
                Arc::new(InMemoryStrategyRepository::new()),
                Arc::new(InMemoryIterationRepository::new()),
            ),
            Mode::Live => {
                let db = Database::new(&config.database_url).await?;
                (
                    Arc::new(SqliteStrategyRepository::new(db.pool.clone())),
                    Arc::new(SqliteIterationRepository::new(db.pool.clone())),
                )
            }
        };

    let (backtest, analysis): (Arc<dyn BacktestService>, Arc<dyn AnalysisService>) =
        match config.mode {
            Mode::Mock => {
                let mock_backtest = MockBacktestService::new();
                mock_backtest.set_default_result(refinery::domain::types::BacktestResult {
                    sharpe_ratio: 1.1,
                    max_drawdown: 0.14,
                    total_return: 0.21,
                    win_rate: 0.54,
                    trade_count: 120,
                });
                (
                    Arc::new(mock_backtest),
                    Arc::new(MockAnalysisService::new()),
                )
            }
            Mode::Live => (
                Arc::new(QuantConnectClient::new(
                    config.qc_user_id.clone(),
                    config.qc_api_token.clone(),
                )),
                Arc::new(AnthropicAnalysisService::new(
                    config.anthropic_api_key.clone(),
                    config.anthropic_model.clone(),
                )),
            ),
        };

    let strategy_id = match &config.strategy_id {
        Some(id) => id.clone(),
        None if config.mode == Mode::Mock => {
            let demo = Strategy::new("demo", DEMO_CODE, "0");
            strategies.save(&demo).await?;
            info!("Seeded demo strategy {}", demo.id);
            demo.id
        }
        None => anyhow::bail!("STRATEGY_ID is required in live mode"),
    };

    let events = EventBus::new();
    events.subscribe(Arc::new(LoggingListener)).await;

    let pipeline = Arc::new(IterationPipeline::new(
        backtest,
        analysis,
        Arc::clone(&strategies),
        history,
        events.clone(),
        RetryPolicy::default(),
        PipelineSettings::default(),
    ));
    let controller = LoopController::new(pipeline, strategies, events);

    controller
        .start(&strategy_id, config.loop_config.clone())
        .await?;
    info!("Refinement loop running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; stopping loop...");
    controller.stop().await?;
    controller.join().await;
    info!("Loop stopped. Goodbye!");

    Ok(())
}
