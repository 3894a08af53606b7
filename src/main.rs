//! CLI entry point for arrakis-fetch.

use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrakis_core::{BroadcastSink, Credentials, DownloadManager, EngineConfig, load_manifest};
use clap::Parser;
use tracing::{debug, error, info, warn};

mod cli;
mod progress_ui;

use cli::Args;
use progress_ui::spawn_progress_ui;

/// Buffered events per subscriber before the progress bar starts lagging.
const EVENT_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = EngineConfig::from_env();
    if let Some(models_dir) = &args.models_dir {
        config = config.with_models_dir(models_dir);
    }
    if let Some(seconds) = args.stall_timeout {
        config = config.with_stall_timeout(Duration::from_secs(seconds));
    }
    let policy = args.failure_policy.unwrap_or(config.failure_policy);

    let items = load_manifest(&args.manifest)?;
    if items.is_empty() {
        info!(manifest = %args.manifest.display(), "Manifest lists no items");
        return Ok(ExitCode::SUCCESS);
    }
    info!(items = items.len(), models_dir = %config.models_dir.display(), "Arrakis fetch starting");

    let (sink, events) = BroadcastSink::new(EVENT_CAPACITY);
    let show_progress = !args.quiet && !args.no_progress && io::stderr().is_terminal();
    let ui = spawn_progress_ui(show_progress, events);

    let manager = Arc::new(
        DownloadManager::new(&config, Credentials::from_env(), Arc::new(sink))
            .context("failed to initialize download engine")?,
    );

    let interrupt = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling downloads");
                manager.cancel();
            }
        })
    };

    let report = manager.download_batch(&items).await;

    interrupt.abort();
    let _ = interrupt.await;
    drop(manager);
    if let Some(handle) = ui {
        let _ = handle.await;
    }

    info!(
        completed = report.stats.completed(),
        skipped = report.stats.skipped(),
        failed = report.stats.failed(),
        retried = report.stats.retried(),
        total = report.stats.total(),
        "Download complete"
    );

    if report.is_fatal(policy) {
        error!(?policy, failures = report.failures.len(), "Downloads failed");
        return Ok(ExitCode::FAILURE);
    }
    if !report.failures.is_empty() {
        warn!(failures = report.failures.len(), "Some downloads failed; continuing under lenient policy");
    }
    Ok(ExitCode::SUCCESS)
}
