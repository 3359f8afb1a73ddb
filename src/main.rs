mod error;
mod bootstrap;
mod chain;
mod config;
mod detector;
mod feed;
mod settlement;
mod store;
#[cfg(test)]
mod testing;

use anyhow::Context;
use std::path::Path;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bootstrap::Pipeline;
use crate::config::{Config, RunMode};
use crate::detector::DetectionMonitor;
use crate::settlement::scheduler::{run_expiry_sweep, run_reconciler};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,wickguard=debug,sqlx=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("🚀 Starting wick insurance pipeline");

    // Load configuration
    let config = Config::from_env()?;
    info!("Symbol {} in {:?} mode", config.symbol, config.run_mode);

    let pipeline = bootstrap::initialize_pipeline(&config).await?;
    bootstrap::report_state(pipeline.store.as_ref(), &config.symbol).await?;

    match config.run_mode {
        RunMode::Live => run_live(&config, pipeline).await?,
        RunMode::Replay => run_replay(&config, pipeline).await?,
    }

    info!("👋 Shutdown complete");
    Ok(())
}

async fn run_live(config: &Config, pipeline: Pipeline) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let monitor = DetectionMonitor::new(
        pipeline.detector.clone(),
        pipeline.store.clone(),
        pipeline.executor.clone(),
        pipeline.new_candles.clone(),
        config.detector_poll_interval(),
        config.detector_batch_limit,
    );
    let monitor_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = monitor.run(monitor_shutdown).await {
            error!("❌ Wick detector exited: {}", e);
        }
    }));

    if let Some(reconciler) = pipeline.reconciler.clone() {
        tasks.push(tokio::spawn(run_reconciler(
            reconciler,
            config.reconciler_poll_interval(),
            shutdown_rx.clone(),
        )));
    }

    if let Some(period) = config.expiry_sweep_interval() {
        tasks.push(tokio::spawn(run_expiry_sweep(
            pipeline.store.clone(),
            period,
            config.expiry_grace(),
            shutdown_rx.clone(),
        )));
    }

    // Optional backfill from a recorded file, fed through the live detector
    if let Some(path) = config.replay_file.as_deref() {
        let candles = feed::load_replay_file(Path::new(path), &config.symbol).await?;
        pipeline.feed.ingest_all(&candles).await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("🛑 Shutdown requested, waiting for in-flight work");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task panicked: {}", e);
        }
    }

    bootstrap::report_state(pipeline.store.as_ref(), &config.symbol).await?;
    Ok(())
}

async fn run_replay(config: &Config, pipeline: Pipeline) -> anyhow::Result<()> {
    let path = config
        .replay_file
        .as_deref()
        .context("REPLAY_FILE must be set in replay mode")?;

    let candles = feed::load_replay_file(Path::new(path), &config.symbol).await?;
    let (Some(first), Some(last)) = (candles.first(), candles.last()) else {
        warn!("Replay file {} has no {} candles", path, config.symbol);
        return Ok(());
    };
    let (start, end) = (first.timestamp, last.timestamp);

    pipeline.feed.ingest_all(&candles).await?;

    let detections = pipeline.detector.detect_range(start, end).await?;
    for detection in &detections {
        let event = &detection.event;
        info!(
            "{} {} at {}: body ratio {:.4}, range ratio {:.4}",
            if detection.newly_detected { "🆕" } else { "♻️" },
            event.detection_ref(),
            event.timestamp,
            event.body_ratio,
            event.range_ratio
        );

        if !detection.newly_detected {
            continue;
        }
        if let Some(executor) = &pipeline.executor {
            let outcomes = executor.execute(event).await?;
            info!(
                "{} settlements attempted for {}, {} confirmed",
                outcomes.len(),
                event.detection_ref(),
                outcomes.iter().filter(|o| o.is_settled()).count()
            );
        }
    }

    info!(
        "✓ Replay of {} candles ({} to {}) found {} wick events",
        candles.len(),
        start,
        end,
        detections.len()
    );
    bootstrap::report_state(pipeline.store.as_ref(), &config.symbol).await?;
    Ok(())
}
