//! tasklined — the task-log correlation daemon.
//!
//! Assembles the pipeline:
//! - sequential ingestion worker (log lines → events → task segmenter)
//! - per-task log files via the file sink
//! - snapshot manager (Before/After fetches, correlation, aggregates)
//!
//! # Usage
//!
//! ```text
//! tasklined run --log-file serving.log --task-log-dir task_logs \
//!     --metrics-address 127.0.0.1:11434
//! ```
//!
//! Without `--log-file` the daemon reads stdin, so it can sit behind
//! `tail -F` on a live serving log.

mod ingest;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::{info, warn};

use taskline_core::{epoch_millis_now, SegmentConfig, SnapshotConfig};
use taskline_metrics::SnapshotManager;
use taskline_segment::{FileTaskSink, TaskSegmenter};

#[derive(Parser)]
#[command(name = "tasklined", about = "Task-scoped log correlation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a serving log stream and correlate per-request timings.
    Run {
        /// Log file to ingest; reads stdin when omitted.
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Directory receiving one log file per task.
        #[arg(long, default_value = "task_logs")]
        task_log_dir: PathBuf,

        /// Metrics endpoint address (host:port).
        #[arg(long, default_value = "127.0.0.1:11434")]
        metrics_address: String,

        /// Exposition path on the metrics endpoint.
        #[arg(long, default_value = "/metrics")]
        metrics_path: String,

        /// Idle gap, in minutes, that starts a new task.
        #[arg(long, default_value = "5")]
        idle_timeout_mins: u64,

        /// Per-snapshot fetch timeout in seconds.
        #[arg(long, default_value = "3")]
        fetch_timeout_secs: u64,

        /// Minutes an unmatched snapshot is retained before eviction.
        #[arg(long, default_value = "30")]
        retention_ttl_mins: u64,

        /// How many recent timing records to retain for inspection.
        #[arg(long, default_value = "256")]
        max_retained_timings: usize,

        /// Eviction sweep interval in seconds.
        #[arg(long, default_value = "60")]
        sweep_interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tasklined=debug,taskline=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            log_file,
            task_log_dir,
            metrics_address,
            metrics_path,
            idle_timeout_mins,
            fetch_timeout_secs,
            retention_ttl_mins,
            max_retained_timings,
            sweep_interval_secs,
        } => {
            let segment_config = SegmentConfig { idle_timeout_mins };
            let snapshot_config = SnapshotConfig {
                metrics_address,
                metrics_path,
                fetch_timeout_secs,
                retention_ttl_mins,
                max_retained_timings,
            };
            run(
                log_file,
                task_log_dir,
                segment_config,
                snapshot_config,
                Duration::from_secs(sweep_interval_secs),
            )
            .await
        }
    }
}

async fn run(
    log_file: Option<PathBuf>,
    task_log_dir: PathBuf,
    segment_config: SegmentConfig,
    snapshot_config: SnapshotConfig,
    sweep_interval: Duration,
) -> anyhow::Result<()> {
    info!(
        task_log_dir = %task_log_dir.display(),
        metrics = %snapshot_config.metrics_address,
        "tasklined starting"
    );

    let sink = FileTaskSink::new(&task_log_dir)?;
    let mut segmenter = TaskSegmenter::new(&segment_config, sink);
    let manager = Arc::new(SnapshotManager::new(snapshot_config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let eviction = tokio::spawn(manager.clone().run(sweep_interval, shutdown_rx));

    // The ingestion worker is the only owner of segmenter state; dropping
    // its future on ctrl-c is safe because every observe() completes
    // before the next line is read.
    let ingest_result = match log_file {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await?;
            let reader = BufReader::new(file);
            tokio::select! {
                res = ingest::run_ingest(reader, &mut segmenter, &manager) => Some(res),
                _ = tokio::signal::ctrl_c() => None,
            }
        }
        None => {
            let reader = BufReader::new(tokio::io::stdin());
            tokio::select! {
                res = ingest::run_ingest(reader, &mut segmenter, &manager) => Some(res),
                _ = tokio::signal::ctrl_c() => None,
            }
        }
    };

    match &ingest_result {
        Some(Ok(stats)) => info!(lines = stats.lines, events = stats.events, "ingestion finished"),
        Some(Err(e)) => warn!(error = %e, "ingestion stopped on read error"),
        None => info!("shutdown signal received; pending fetches abandoned"),
    }

    // Shutdown flush: close the active task as truncated, stop the
    // eviction loop, and drain unmatched snapshots into the final report.
    let now = epoch_millis_now();
    let _ = shutdown_tx.send(true);
    if let Some(summary) = segmenter.flush(now)? {
        info!(
            task_id = %summary.task_id,
            requests = summary.request_count,
            truncated = summary.truncated,
            "final task closed"
        );
    }
    let _ = eviction.await;

    let seg_stats = segmenter.stats();
    info!(
        events = seg_stats.events,
        tasks = seg_stats.tasks_closed,
        step_resets = seg_stats.step_resets,
        idle_splits = seg_stats.idle_splits,
        ordering_anomalies = seg_stats.ordering_anomalies,
        fallback_timestamps = seg_stats.fallback_timestamps,
        "segmentation summary"
    );

    let report = manager.shutdown_report(now).await;
    info!(
        requests = report.aggregate.total_requests,
        estimated = report.aggregate.estimated_requests,
        mean_prefill = report.aggregate.mean_prefill,
        mean_decode = report.aggregate.mean_decode,
        mean_ttft = report.aggregate.mean_ttft,
        unmatched = report.unmatched_snapshots,
        fetch_failures = report.fetch_failures,
        stale_pending = report.stale_pending_requests,
        "correlation summary"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
