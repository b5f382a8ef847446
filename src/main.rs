//! Perpbot - perpetual-futures strategy runtime.
//!
//! Wires the collaborators together: market-data feed, execution-engine link,
//! risk book, snapshot store, strategy registry, HTTP/WS API. On startup the
//! durable resume layer reconstructs strategies that survived a restart.

use anyhow::{Context, Result};
use clap::Parser;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perpbot_backend::{
    api,
    config::Config,
    engine::{EngineLink, ExecutionClient, PaperEngineConfig, PaperEngineLink, WsEngineLink},
    feeds::PriceFeed,
    risk_book::RiskBook,
    store::{resume_all, SnapshotStore},
    strategies::{StrategyCtx, StrategyRegistry},
};

#[derive(Debug, Parser)]
#[command(name = "perpbot", about = "Perpetual-futures strategy runtime")]
struct Args {
    /// HTTP listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Snapshot database path (overrides DATABASE_PATH).
    #[arg(long)]
    db: Option<String>,
    /// Run against the in-process paper engine.
    #[arg(long)]
    paper: bool,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,perpbot_backend=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if args.paper {
        config.paper_mode = true;
    }
    let config = Arc::new(config);

    info!(paper = config.paper_mode, port = config.port, "perpbot starting");

    // Market data.
    let feed = PriceFeed::new(config.rest_snapshot_url.clone());
    if let Err(e) = feed.spawn_live(&config.feed_symbols).await {
        // Paper sessions can run on pushed ticks alone.
        warn!(error = %e, "live market-data feed unavailable");
    }

    // Execution channel.
    let link: Arc<dyn EngineLink> = if config.paper_mode {
        info!("using in-process paper engine");
        PaperEngineLink::new(Arc::clone(&feed), PaperEngineConfig::from_env())
    } else {
        WsEngineLink::connect(
            &config.engine_url,
            config.engine_timeout_ms,
            config.engine_heartbeat_timeout_ms,
        )
        .await
        .context("connect execution engine")?
    };
    let engine = ExecutionClient::new(Arc::clone(&link));

    // Risk book fed by engine events.
    let risk = RiskBook::new();
    risk.spawn_consumer(link.subscribe());

    // Durable snapshots.
    let store = SnapshotStore::open(&config.database_path).context("open snapshot store")?;

    // Lifecycle broadcast bus.
    let (events, _) = broadcast::channel(4096);

    let ctx = StrategyCtx {
        engine,
        feed,
        store,
        risk,
        events,
        config: Arc::clone(&config),
    };
    let registry = StrategyRegistry::new(ctx);

    // Reconstruct strategies that survived a restart.
    match resume_all(&registry).await {
        Ok(stats) => info!(
            resumed = stats.resumed,
            discarded = stats.discarded,
            "resume pass done"
        ),
        Err(e) => warn!(error = %e, "resume pass failed"),
    }

    let app = api::router(Arc::clone(&registry));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr, "http api listening");

    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            result.context("http server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Graceful shutdown: stop everything, give actors a moment to cancel
    // working orders and flush terminal snapshots.
    registry.stop_all("shutdown");
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("perpbot stopped");
    Ok(())
}
