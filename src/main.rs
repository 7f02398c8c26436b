//! safezone-agent - background safe-zone tracking for a patient device
//!
//! Replays host location callbacks (JSON lines from a file or stdin) through
//! the safe-zone session, submitting positions to the backend.
//!
//! Module structure:
//! - `domain/` - Core types (SafeZone, PositionSample, states, submissions)
//! - `io/` - External interfaces (state store, remote API, location host)
//! - `services/` - Core logic (geofence, scheduler, retry queue, session)
//! - `infra/` - Infrastructure (Config, Metrics, Clock)

use anyhow::Context;
use clap::Parser;
use safezone_tracker::infra::{Clock, Config, Metrics, SystemClock};
use safezone_tracker::io::event_feed::run_feed;
use safezone_tracker::io::{
    FileStore, HttpLocationApi, RemoteLocationApi, SimulatedLocationProvider, StateStore,
};
use safezone_tracker::services::{
    create_submission_worker, QueueSettings, RetryQueue, SafeZoneSession, SessionContext,
    StartOutcome, Submitter,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Safe-zone agent - geofence tracking and breach reporting
#[derive(Parser, Debug)]
#[command(name = "safezone-agent", version, about)]
struct Args {
    /// Path to TOML configuration file (else CONFIG_FILE, else config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// JSONL file of host callbacks (default: stdin)
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Set the safe-exit override before processing callbacks
    #[arg(long)]
    safe_exit: Option<bool>,

    /// Print the position history and exit
    #[arg(long)]
    history: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for suppressed/duplicate events
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "safezone-agent starting");

    let args = Args::parse();
    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()));

    info!(
        config_file = %config.config_file(),
        api_base_url = %config.api_base_url(),
        store_path = %config.store_path(),
        debounce_ms = %config.debounce_ms(),
        dwell_ms = %config.dwell_ms(),
        queue_capacity = %config.queue_capacity(),
        drain_interval = ?config.drain_interval(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create shared components
    let metrics = Arc::new(Metrics::new());
    let store: Arc<dyn StateStore> = Arc::new(
        FileStore::open(config.store_path())
            .with_context(|| format!("Failed to open state store: {}", config.store_path()))?,
    );
    let api: Arc<dyn RemoteLocationApi> =
        Arc::new(HttpLocationApi::new(&config).context("Failed to build HTTP client")?);
    let host = Arc::new(SimulatedLocationProvider::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Start submission worker (network I/O off the callback path)
    let queue = Arc::new(RetryQueue::new(
        store.clone(),
        QueueSettings::from_config(&config),
        metrics.clone(),
    ));
    let submitter = Arc::new(Submitter::new(
        api.clone(),
        queue.clone(),
        store.clone(),
        clock.clone(),
        metrics.clone(),
    ));
    let (submit_tx, worker) = create_submission_worker(submitter.clone(), 256);
    tokio::spawn(worker.run());

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_queue = queue.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let depth = metrics_queue.len().await;
            metrics_clone.report(depth).log();
        }
    });

    let ctx = SessionContext { store, provider: host.clone(), api, clock, metrics };
    let mut session = SafeZoneSession::new(&config, ctx, submitter, submit_tx);

    if args.history {
        let history = session.fetch_history().await.context("Failed to fetch history")?;
        for entry in &history {
            info!(
                timestamp = %entry.timestamp.to_rfc3339(),
                latitude = %entry.latitude,
                longitude = %entry.longitude,
                out_of_zone = %entry.is_out_of_zone,
                "history_entry"
            );
        }
        info!(entries = %history.len(), "history_fetched");
        return Ok(());
    }

    let outcome = session.start().await;
    if outcome == StartOutcome::Halted {
        warn!("session_halted_at_start");
        return Ok(());
    }

    if let Some(active) = args.safe_exit {
        session.set_safe_exit(active).await.context("Failed to store safe-exit flag")?;
    }

    // Start host callback feed
    let (event_tx, event_rx) = mpsc::channel(1000);
    let feed_host = host.clone();
    let events_path = args.events.clone();
    tokio::spawn(async move {
        let result = match events_path {
            Some(path) => match tokio::fs::File::open(&path).await {
                Ok(file) => run_feed(BufReader::new(file), feed_host, event_tx).await,
                Err(e) => Err(e),
            },
            None => run_feed(BufReader::new(tokio::io::stdin()), feed_host, event_tx).await,
        };
        if let Err(e) = result {
            error!(error = %e, "event_feed_error");
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run session - consumes callbacks until shutdown
    session.run(event_rx, shutdown_rx).await;

    info!("safezone-agent shutdown complete");
    Ok(())
}
