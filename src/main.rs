use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use estimatebot::config::Settings;
use estimatebot::execution::{
    reconcile, Engine, ExecutionGateway, FreqtradeGateway, MarkPriceFeed, TriggerDispatcher,
};
use estimatebot::grind::GrindClassifier;
use estimatebot::models::EstimateFilter;
use estimatebot::persistence::{EstimateStore, RedisStore};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "estimatebot")]
#[command(about = "Price estimate monitoring and trigger engine")]
struct Cli {
    /// Config file (defaults to estimatebot.toml when present)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch mark prices and trigger estimates until Ctrl+C
    Run,
    /// Print stored estimates
    List {
        #[arg(short, long)]
        symbol: Option<String>,
    },
    /// Reset a triggered or failed estimate to listening
    Reenable { id: Uuid },
    /// Print the grind summary of every open trade
    Grind,
    /// Report triggered estimates that never got an order
    Reconcile,
}

#[derive(Serialize)]
struct TradeReport {
    trade_id: u64,
    pair: String,
    side: estimatebot::models::Side,
    grind: estimatebot::grind::TradeGrindSummary,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    setup_logging(&settings.log_level);

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::List { symbol } => list(&settings, symbol).await,
        Commands::Reenable { id } => reenable(&settings, id).await,
        Commands::Grind => grind(&settings).await,
        Commands::Reconcile => reconcile_once(&settings).await,
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_store(settings: &Settings) -> Result<RedisStore> {
    RedisStore::new(&settings.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))
}

// ============================================================================
// Commands
// ============================================================================

async fn run(settings: Settings) -> Result<()> {
    tracing::info!("🚀 estimatebot starting");

    let store = Arc::new(connect_store(&settings).await?);
    let gateway = Arc::new(FreqtradeGateway::new(&settings.gateway)?);
    gateway
        .login()
        .await
        .context("Failed to log in to the execution service")?;

    let dispatcher = TriggerDispatcher::new(
        store.clone(),
        gateway,
        settings.engine.dispatch_timeout(),
        settings.engine.short_funding_rate_threshold,
    );
    let engine = Arc::new(Engine::new(
        dispatcher,
        settings.crossing,
        settings.engine.tick_buffer,
    ));

    tracing::info!("📊 Configuration:");
    tracing::info!("  Dispatch timeout: {:?}", settings.engine.dispatch_timeout());
    tracing::info!("  Poll interval: {:?}", settings.engine.poll_interval());
    tracing::info!("  Crossing: open={:?} addition={:?}", settings.crossing.open, settings.crossing.addition);

    let feed_task = {
        let engine = engine.clone();
        let feed = MarkPriceFeed::new(store.clone(), store.clone(), settings.engine.poll_interval());
        let shutdown = engine.shutdown_signal();
        tokio::spawn(async move {
            feed.run(&engine, shutdown).await;
        })
    };

    let reconcile_task = {
        let store = store.clone();
        let grace = settings.engine.reconcile_grace();
        let mut shutdown = engine.shutdown_signal();
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(60);
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reconcile(store.as_ref(), grace, chrono::Utc::now()).await {
                            tracing::error!(error = %e, "Reconciliation failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    tracing::info!("Press Ctrl+C to stop...");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("⚠️  Received Ctrl+C, shutting down...");

    // Stops the feed and reconciliation loops too
    engine.shutdown().await;
    let _ = feed_task.await;
    let _ = reconcile_task.await;

    tracing::info!("👋 estimatebot stopped");
    Ok(())
}

async fn list(settings: &Settings, symbol: Option<String>) -> Result<()> {
    let store = connect_store(settings).await?;
    let filter = EstimateFilter {
        symbol: symbol.map(|s| s.to_uppercase()),
        ..Default::default()
    };

    let mut estimates = store.list(&filter).await?;
    estimates.sort_by_key(|e| e.created_at);
    println!("{}", serde_json::to_string_pretty(&estimates)?);
    Ok(())
}

async fn reenable(settings: &Settings, id: Uuid) -> Result<()> {
    let store = connect_store(settings).await?;
    let estimate = store.reenable(id).await?;
    tracing::info!(estimate_id = %estimate.id, symbol = %estimate.symbol, "Estimate re-enabled");
    println!("{}", serde_json::to_string_pretty(&estimate)?);
    Ok(())
}

async fn grind(settings: &Settings) -> Result<()> {
    let gateway = FreqtradeGateway::new(&settings.gateway)?;
    let classifier = GrindClassifier::default();

    let reports: Vec<TradeReport> = gateway
        .open_trades()
        .await?
        .iter()
        .map(|trade| TradeReport {
            trade_id: trade.trade_id,
            pair: trade.pair.clone(),
            side: trade.side(),
            grind: classifier.summarize_trade(trade),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn reconcile_once(settings: &Settings) -> Result<()> {
    let store = connect_store(settings).await?;
    let alerts = reconcile(&store, settings.engine.reconcile_grace(), chrono::Utc::now()).await?;

    if alerts.is_empty() {
        tracing::info!("No inconsistencies found");
    }
    println!("{}", serde_json::to_string_pretty(&alerts)?);
    Ok(())
}
