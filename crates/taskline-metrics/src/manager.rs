//! Snapshot manager — drives capture, correlation, and reporting.
//!
//! Fetches are fire-and-forget relative to ingestion: each runs on its own
//! tokio task, bounded by the fetch timeout, and a failure degrades that
//! one request to an estimated timing. Nothing here can stall the
//! sequential event loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use taskline_core::{
    epoch_millis_now, AggregateSummary, EpochMillis, EstimatedTiming, RequestId, SnapshotConfig,
    SnapshotStage, UnmatchedSnapshot,
};

use crate::aggregate::TimingAggregator;
use crate::fetcher::fetch_exposition;
use crate::parser::parse_exposition;
use crate::store::SnapshotStore;

/// Final correlation report emitted at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub aggregate: AggregateSummary,
    /// Snapshots evicted or drained without a counterpart.
    pub unmatched_snapshots: u64,
    /// Fetches that produced no snapshot (connect/timeout/status/body).
    pub fetch_failures: u64,
    /// Malformed exposition lines skipped across all fetches.
    pub exposition_parse_errors: u64,
    /// Requests whose completion never arrived within the retention
    /// window; their pending entries were pruned.
    pub stale_pending_requests: u64,
}

/// Coordinates Before/After snapshot capture around each request and feeds
/// the results into the aggregator.
pub struct SnapshotManager {
    config: SnapshotConfig,
    store: SnapshotStore,
    aggregator: TimingAggregator,
    /// Requests awaiting completion: request id → received-at timestamp.
    pending: Mutex<HashMap<RequestId, EpochMillis>>,
    fetch_failures: AtomicU64,
    exposition_parse_errors: AtomicU64,
    unmatched_reported: AtomicU64,
    stale_pending: AtomicU64,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig) -> Self {
        let store = SnapshotStore::new(config.retention_ttl());
        let aggregator = TimingAggregator::new(config.max_retained_timings);
        Self {
            config,
            store,
            aggregator,
            pending: Mutex::new(HashMap::new()),
            fetch_failures: AtomicU64::new(0),
            exposition_parse_errors: AtomicU64::new(0),
            unmatched_reported: AtomicU64::new(0),
            stale_pending: AtomicU64::new(0),
        }
    }

    /// A request arrived: register it and capture a Before snapshot.
    pub async fn on_received(self: &Arc<Self>, request_id: &str, at: EpochMillis) {
        self.pending
            .lock()
            .await
            .insert(request_id.to_string(), at);

        let manager = self.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            manager
                .capture_snapshot(&request_id, SnapshotStage::Before)
                .await;
        });
    }

    /// A request completed: capture an After snapshot and correlate.
    pub async fn on_completed(
        self: &Arc<Self>,
        request_id: &str,
        at: EpochMillis,
        output_tokens: Option<u64>,
    ) {
        let received_at = self.pending.lock().await.remove(request_id);

        let manager = self.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            manager
                .complete_request(&request_id, at, output_tokens, received_at)
                .await;
        });
    }

    /// A request was aborted: forget its pending entry. Any Before
    /// snapshot already captured ages out through eviction and is
    /// reported as unmatched.
    pub async fn on_aborted(&self, request_id: &str) {
        if self.pending.lock().await.remove(request_id).is_some() {
            debug!(%request_id, "aborted request dropped from pending");
        }
    }

    /// Evict stale snapshots and report each exactly once. Pending
    /// entries age out on the same clock: a request whose completion
    /// line never arrives (client disconnect without an abort line)
    /// must not leak its registration forever.
    pub async fn sweep(&self, now: EpochMillis) -> Vec<UnmatchedSnapshot> {
        let ttl_ms = self.config.retention_ttl().as_millis() as i64;
        {
            let mut pending = self.pending.lock().await;
            let before = pending.len();
            pending.retain(|_, received_at| now - *received_at <= ttl_ms);
            let pruned = (before - pending.len()) as u64;
            if pruned > 0 {
                self.stale_pending.fetch_add(pruned, Ordering::Relaxed);
                warn!(pruned, "pending requests aged out without a completion");
            }
        }

        let reports = self.store.evict_stale(now).await;
        for report in &reports {
            self.unmatched_reported.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %report.request_id,
                stage = ?report.stage,
                age_ms = report.age_ms,
                "unmatched snapshot evicted"
            );
        }
        reports
    }

    /// Periodic eviction loop; runs until the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        sweep_interval: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = sweep_interval.as_secs(),
            "snapshot eviction loop started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {
                    self.sweep(epoch_millis_now()).await;
                }
                _ = shutdown.changed() => {
                    debug!("snapshot eviction loop shutting down");
                    break;
                }
            }
        }
    }

    /// Flush remaining snapshots and produce the final report.
    ///
    /// In-flight fetches are abandoned, not retried; whatever they record
    /// after this point is never read.
    pub async fn shutdown_report(&self, now: EpochMillis) -> CorrelationReport {
        let drained = self.store.drain_unmatched(now).await;
        for report in &drained {
            self.unmatched_reported.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %report.request_id,
                stage = ?report.stage,
                "unmatched snapshot flushed at shutdown"
            );
        }

        CorrelationReport {
            aggregate: self.aggregator.summary(),
            unmatched_snapshots: self.unmatched_reported.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            exposition_parse_errors: self.exposition_parse_errors.load(Ordering::Relaxed),
            stale_pending_requests: self.stale_pending.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn aggregator(&self) -> &TimingAggregator {
        &self.aggregator
    }

    /// Fetch and record one snapshot. Returns false on a missing outcome.
    async fn capture_snapshot(&self, request_id: &str, stage: SnapshotStage) -> bool {
        match fetch_exposition(
            &self.config.metrics_address,
            &self.config.metrics_path,
            self.config.fetch_timeout(),
        )
        .await
        {
            Ok(text) => {
                let parsed = parse_exposition(&text);
                if parsed.parse_errors > 0 {
                    self.exposition_parse_errors
                        .fetch_add(parsed.parse_errors as u64, Ordering::Relaxed);
                }
                self.store
                    .record_snapshot(request_id, stage, parsed.counters, epoch_millis_now())
                    .await;
                true
            }
            Err(e) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%request_id, ?stage, error = %e, "snapshot fetch missing");
                false
            }
        }
    }

    async fn complete_request(
        &self,
        request_id: &str,
        completed_at: EpochMillis,
        output_tokens: Option<u64>,
        received_at: Option<EpochMillis>,
    ) {
        self.capture_snapshot(request_id, SnapshotStage::After)
            .await;

        // Correlate even when the After fetch just failed: a duplicate
        // delivery may already have stored one.
        if let Some(timing) = self.store.try_correlate(request_id, output_tokens).await {
            info!(
                %request_id,
                prefill = timing.prefill_time,
                decode = timing.decode_time,
                ttft = timing.ttft,
                reset = timing.counter_reset_detected,
                "exact timing correlated"
            );
            self.aggregator.record_exact(timing);
            return;
        }

        // No snapshot pair: degrade to the labeled estimate when the
        // wall-clock latency is known.
        match received_at {
            Some(received_at) => {
                let total_latency = (completed_at - received_at).max(0) as f64 / 1000.0;
                debug!(%request_id, total_latency, "falling back to estimated timing");
                self.aggregator.record_estimated(EstimatedTiming::from_latency(
                    request_id.to_string(),
                    total_latency,
                ));
            }
            None => {
                warn!(%request_id, "completion without pending entry; no timing recorded");
            }
        }
    }
}
