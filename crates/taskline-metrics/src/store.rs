//! Snapshot store and delta correlator.
//!
//! Holds in-flight Before/After snapshots keyed by request id and pairs
//! them into exact per-request timings. Concurrent `record_snapshot` calls
//! across request ids never lose updates: the map hands out one
//! mutex-guarded slot per request id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use taskline_core::{
    EpochMillis, MetricKey, MetricSnapshot, RequestId, RequestTiming, SnapshotStage,
    UnmatchedSnapshot,
};

/// In-flight snapshots for one request id.
#[derive(Debug, Default)]
struct Slot {
    before: Option<MetricSnapshot>,
    after: Option<MetricSnapshot>,
}

impl Slot {
    fn get_mut(&mut self, stage: SnapshotStage) -> &mut Option<MetricSnapshot> {
        match stage {
            SnapshotStage::Before => &mut self.before,
            SnapshotStage::After => &mut self.after,
        }
    }

    /// Capture time of the oldest stored snapshot, for eviction.
    fn oldest_captured_at(&self) -> Option<EpochMillis> {
        match (&self.before, &self.after) {
            (Some(b), Some(a)) => Some(b.captured_at.min(a.captured_at)),
            (Some(b), None) => Some(b.captured_at),
            (None, Some(a)) => Some(a.captured_at),
            (None, None) => None,
        }
    }

    fn unmatched_reports(&self, now: EpochMillis) -> Vec<UnmatchedSnapshot> {
        [self.before.as_ref(), self.after.as_ref()]
            .into_iter()
            .flatten()
            .map(|s| UnmatchedSnapshot {
                request_id: s.request_id.clone(),
                stage: s.stage,
                captured_at: s.captured_at,
                age_ms: now - s.captured_at,
            })
            .collect()
    }
}

/// Thread-safe store of in-flight Before/After snapshots.
pub struct SnapshotStore {
    slots: RwLock<HashMap<RequestId, Arc<Mutex<Slot>>>>,
    retention_ttl: Duration,
}

impl SnapshotStore {
    pub fn new(retention_ttl: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            retention_ttl,
        }
    }

    /// Record a snapshot for `(request_id, stage)`.
    ///
    /// Last write wins: duplicate delivery overwrites rather than
    /// duplicating state, so a retried fetch can never double a delta.
    pub async fn record_snapshot(
        &self,
        request_id: &str,
        stage: SnapshotStage,
        counters: HashMap<MetricKey, f64>,
        captured_at: EpochMillis,
    ) {
        let slot = self.slot_for(request_id).await;
        let mut slot = slot.lock().await;
        let replaced = slot
            .get_mut(stage)
            .replace(MetricSnapshot {
                request_id: request_id.to_string(),
                stage,
                captured_at,
                counters,
            })
            .is_some();
        if replaced {
            debug!(%request_id, ?stage, "duplicate snapshot overwritten");
        }
    }

    /// Pair the Before/After snapshots for a request, if both exist.
    ///
    /// On success both snapshots are removed, so a timing is computed at
    /// most once per request id. `output_tokens_hint` comes from the
    /// completion log line when available.
    pub async fn try_correlate(
        &self,
        request_id: &str,
        output_tokens_hint: Option<u64>,
    ) -> Option<RequestTiming> {
        let mut slots = self.slots.write().await;
        let slot_arc = slots.get(request_id)?.clone();
        let mut slot = slot_arc.lock().await;
        let (before, after) = match (slot.before.take(), slot.after.take()) {
            (Some(b), Some(a)) => (b, a),
            (b, a) => {
                slot.before = b;
                slot.after = a;
                return None;
            }
        };
        slots.remove(request_id);
        drop(slots);

        Some(compute_derived(&before, &after, output_tokens_hint))
    }

    /// Evict snapshots that outlived the retention TTL without a
    /// counterpart, returning each exactly once.
    pub async fn evict_stale(&self, now: EpochMillis) -> Vec<UnmatchedSnapshot> {
        let ttl_ms = self.retention_ttl.as_millis() as i64;
        let mut reports = Vec::new();

        let mut slots = self.slots.write().await;
        let mut stale_ids = Vec::new();
        for (id, slot_arc) in slots.iter() {
            let slot = slot_arc.lock().await;
            if let Some(oldest) = slot.oldest_captured_at() {
                if now - oldest > ttl_ms {
                    stale_ids.push(id.clone());
                    reports.extend(slot.unmatched_reports(now));
                }
            }
        }
        for id in stale_ids {
            slots.remove(&id);
        }
        reports
    }

    /// Remove and report every remaining snapshot, regardless of age.
    ///
    /// Called once at shutdown so nothing is dropped silently.
    pub async fn drain_unmatched(&self, now: EpochMillis) -> Vec<UnmatchedSnapshot> {
        let mut slots = self.slots.write().await;
        let mut reports = Vec::new();
        for (_, slot_arc) in slots.drain() {
            let slot = slot_arc.lock().await;
            reports.extend(slot.unmatched_reports(now));
        }
        reports
    }

    /// Number of request ids with at least one in-flight snapshot.
    pub async fn pending_count(&self) -> usize {
        self.slots.read().await.len()
    }

    async fn slot_for(&self, request_id: &str) -> Arc<Mutex<Slot>> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(request_id) {
                return slot.clone();
            }
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(request_id.to_string())
            .or_default()
            .clone()
    }
}

/// Difference one counter across the pair; a negative delta means the
/// server restarted between snapshots, so clamp to zero and flag it.
fn delta(
    before: &MetricSnapshot,
    after: &MetricSnapshot,
    key: MetricKey,
    reset: &mut bool,
) -> Option<f64> {
    let b = before.counters.get(&key)?;
    let a = after.counters.get(&key)?;
    let d = a - b;
    if d < 0.0 {
        *reset = true;
        Some(0.0)
    } else {
        Some(d)
    }
}

/// Derive a per-request timing from a Before/After snapshot pair.
fn compute_derived(
    before: &MetricSnapshot,
    after: &MetricSnapshot,
    output_tokens_hint: Option<u64>,
) -> RequestTiming {
    let mut reset = false;

    let prefill_time = delta(before, after, MetricKey::PrefillSum, &mut reset).unwrap_or(0.0);
    let decode_time = delta(before, after, MetricKey::DecodeSum, &mut reset).unwrap_or(0.0);
    let ttft_sum = delta(before, after, MetricKey::TtftSum, &mut reset).unwrap_or(0.0);
    let ttft_count = delta(before, after, MetricKey::TtftCount, &mut reset).unwrap_or(0.0);
    let decode_count = delta(before, after, MetricKey::DecodeCount, &mut reset).unwrap_or(0.0);

    // Per-request TTFT from the histogram pair; when no first token landed
    // in the window, prefill time is the closest observable value.
    let ttft = if ttft_count > 0.0 {
        ttft_sum / ttft_count
    } else {
        prefill_time
    };

    // Prefer the token count logged with the response; fall back to the
    // counter delta observed across the pair.
    let output_tokens = output_tokens_hint.or_else(|| {
        if decode_count > 0.0 {
            Some(decode_count as u64)
        } else {
            None
        }
    });

    let avg_time_per_token = match output_tokens {
        Some(n) if n > 0 => Some(decode_time / n as f64),
        _ => None,
    };

    RequestTiming {
        request_id: before.request_id.clone(),
        prefill_time,
        decode_time,
        ttft,
        output_tokens,
        avg_time_per_token,
        counter_reset_detected: reset,
    }
}
