//! PolyInsider engine
//!
//! Usage:
//!   polyinsider
//!   polyinsider --no-poller --workers 8 --log-level debug

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polyinsider::{
    config::Config,
    metrics::MetricsTracker,
    models::Suspect,
    pipeline::Pipeline,
    scrapers::polymarket_gamma,
};

#[derive(Parser, Debug)]
#[command(name = "polyinsider")]
#[command(about = "Real-time Polymarket insider trade detection")]
struct Args {
    /// Disable the REST trades poller (websocket only)
    #[arg(long, default_value = "false")]
    no_poller: bool,

    /// Override WORKER_COUNT
    #[arg(long)]
    workers: Option<usize>,

    /// Override LOG_LEVEL (debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if args.no_poller {
        config.polymarket_rest_url.clear();
    }
    config.validate().context("invalid configuration")?;

    init_tracing(&config.log_level);

    info!("🚀 PolyInsider engine starting");
    info!(
        ws_url = %config.polymarket_ws_url,
        poller = config.poller_enabled(),
        workers = config.worker_count,
        min_value_usd = config.min_value_usd,
        whale_value_usd = config.whale_value_usd,
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    let metrics = Arc::new(MetricsTracker::new());
    let asset_ids =
        match polymarket_gamma::discover_markets(&http, &config.gamma_api_url, config.market_limit)
            .await
        {
            Ok(discovery) => {
                for market in &discovery.markets {
                    metrics.seed_market(
                        market.market_key(),
                        market.question.as_deref().unwrap_or_default(),
                    );
                }
                discovery.asset_ids
            }
            Err(e) => {
                warn!(error = %e, "market discovery failed; subscribing to an empty set");
                Vec::new()
            }
        };

    let mut running = Pipeline::new(config)
        .with_asset_ids(asset_ids)
        .with_metrics(metrics)
        .start()?;

    let consumer = running
        .take_suspects()
        .map(|rx| tokio::spawn(log_suspects(rx)));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Received shutdown signal");

    let listener_stats = running.listener().stats();
    let snapshot = running.metrics().snapshot();
    running.shutdown().await;

    // Every suspect sender is gone now, so the consumer finishes its backlog.
    if let Some(consumer) = consumer {
        if let Err(e) = consumer.await {
            warn!(error = %e, "suspect consumer panicked");
        }
    }

    info!(
        trades = snapshot.trades_total,
        high_value = snapshot.high_value_trades,
        messages = listener_stats.messages_received,
        reconnects = listener_stats.reconnects,
        uptime_secs = snapshot.uptime.as_secs(),
        "👋 PolyInsider engine stopped"
    );
    Ok(())
}

/// Stand-in for alert/storage consumers: log each suspect.
async fn log_suspects(mut rx: mpsc::Receiver<Suspect>) {
    while let Some(suspect) = rx.recv().await {
        let trade = &suspect.trade;
        info!(
            signal = %suspect.signal_type,
            market = %trade.market_id,
            asset = %trade.asset_id,
            maker = %trade.maker_address,
            value_usd = trade.value_usd,
            price = trade.price,
            nonce = suspect.nonce,
            metadata = %serde_json::Value::Object(suspect.metadata.clone()),
            "🚨 Suspect trade"
        );
    }
}

fn init_tracing(log_level: &str) {
    let fallback = format!("polyinsider={}", log_level.to_lowercase());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
