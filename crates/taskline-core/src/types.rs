//! Domain types for task segmentation and snapshot correlation.
//!
//! These types flow between the segmenter, the snapshot store, and the
//! aggregator. Timestamps are UTC epoch milliseconds; the inference server's
//! log lines carry millisecond precision and second-level resolution is too
//! coarse to separate back-to-back requests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for a serving request (e.g. `chatcmpl-abc123`).
pub type RequestId = String;

/// Unique identifier for a task session, derived from its opening event.
pub type TaskId = String;

/// UTC timestamp in milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Current wall-clock time as epoch milliseconds.
pub fn epoch_millis_now() -> EpochMillis {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as EpochMillis
}

// ── Log events ─────────────────────────────────────────────────────

/// Lifecycle stage a log line reports for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The frontend received the request (prompt logged).
    Received,
    /// The engine admitted the request into its queue.
    Added,
    /// The response finished generating.
    Completed,
    /// The request was aborted before completion.
    Aborted,
}

/// One structured record parsed from a serving log line.
///
/// Transient: consumed exactly once by the segmenter, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Request id, when the line carries one.
    pub request_id: Option<RequestId>,
    pub event_type: EventType,
    pub timestamp: EpochMillis,
    /// Agent step number from the prompt's `<step_info>` marker.
    pub step: Option<u32>,
    /// Declared maximum step count, when present alongside `step`.
    pub max_steps: Option<u32>,
    /// Output token count, from the response's token-id list.
    pub output_tokens: Option<u64>,
    /// Finish reason reported on completion (`stop`, `length`, ...).
    pub finish_reason: Option<String>,
    /// True when the line's timestamp could not be parsed and ingestion
    /// time was substituted.
    pub fallback_timestamp: bool,
    /// The original line, preserved verbatim for the task log.
    pub raw: String,
}

// ── Tasks ──────────────────────────────────────────────────────────

/// One task session: a contiguous run of requests belonging to a single
/// external workflow.
///
/// Exactly one task is active at a time. Mutated only by the segmenter;
/// immutable once closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub started_at: EpochMillis,
    pub last_event_at: EpochMillis,
    pub ended_at: Option<EpochMillis>,
    /// Request ids in arrival order, one per `Received` event.
    pub request_ids: Vec<RequestId>,
    /// Highest step number observed so far, for reset detection.
    pub max_step_seen: Option<u32>,
}

impl Task {
    /// Open a new task at the given event timestamp.
    pub fn open(task_id: TaskId, at: EpochMillis) -> Self {
        Self {
            task_id,
            started_at: at,
            last_event_at: at,
            ended_at: None,
            request_ids: Vec::new(),
            max_step_seen: None,
        }
    }

    /// Mark the task closed at `at`.
    pub fn close(&mut self, at: EpochMillis) {
        self.ended_at = Some(at);
    }

    pub fn request_count(&self) -> usize {
        self.request_ids.len()
    }

    /// Build the close trailer for this task.
    pub fn summary(&self, truncated: bool) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at.unwrap_or(self.last_event_at),
            request_count: self.request_ids.len(),
            truncated,
        }
    }
}

/// Close trailer emitted exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub started_at: EpochMillis,
    pub ended_at: EpochMillis,
    pub request_count: usize,
    pub truncated: bool,
}

// ── Metric snapshots ───────────────────────────────────────────────

/// Whether a snapshot was captured before or after the request ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStage {
    Before,
    After,
}

/// Canonical key for a recognized cumulative counter.
///
/// The exposition text spells these several ways (legacy vs. namespaced
/// prefixes); the parser folds every alias onto one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    PrefillSum,
    PrefillCount,
    DecodeSum,
    DecodeCount,
    TtftSum,
    TtftCount,
}

/// A point-in-time capture of the server's cumulative counters for one
/// request's Before or After stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub request_id: RequestId,
    pub stage: SnapshotStage,
    pub captured_at: EpochMillis,
    pub counters: HashMap<MetricKey, f64>,
}

/// A snapshot that aged out of the store without its counterpart.
///
/// Reported exactly once when evicted or drained at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedSnapshot {
    pub request_id: RequestId,
    pub stage: SnapshotStage,
    pub captured_at: EpochMillis,
    /// How long the snapshot sat unmatched, in milliseconds.
    pub age_ms: i64,
}

// ── Derived timings ────────────────────────────────────────────────

/// Exact per-request timing computed from a Before/After counter delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTiming {
    pub request_id: RequestId,
    /// Seconds spent in prefill.
    pub prefill_time: f64,
    /// Seconds spent in decode.
    pub decode_time: f64,
    /// Time to first token, seconds.
    pub ttft: f64,
    pub output_tokens: Option<u64>,
    /// Decode seconds per output token; absent when the token count is
    /// unknown or zero.
    pub avg_time_per_token: Option<f64>,
    /// True when a counter moved backwards between snapshots (server
    /// restart); the affected deltas were clamped to zero.
    pub counter_reset_detected: bool,
}

/// Fallback timing assumed from wall-clock latency when no snapshot pair
/// is available.
///
/// The 10%/90% prefill/decode split is a historical assumption with no
/// empirical grounding; estimated results are kept type-distinct and are
/// never merged with exact correlator output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatedTiming {
    pub request_id: RequestId,
    /// End-to-end wall-clock latency, seconds.
    pub total_latency: f64,
    pub prefill_estimate: f64,
    pub decode_estimate: f64,
}

impl EstimatedTiming {
    /// Assumed share of latency spent in prefill.
    pub const PREFILL_FRACTION: f64 = 0.10;
    /// Assumed share of latency spent in decode.
    pub const DECODE_FRACTION: f64 = 0.90;

    pub fn from_latency(request_id: RequestId, total_latency: f64) -> Self {
        Self {
            request_id,
            total_latency,
            prefill_estimate: total_latency * Self::PREFILL_FRACTION,
            decode_estimate: total_latency * Self::DECODE_FRACTION,
        }
    }
}

/// A per-request timing result, exact or estimated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimingRecord {
    Exact(RequestTiming),
    Estimated(EstimatedTiming),
}

impl TimingRecord {
    pub fn request_id(&self) -> &str {
        match self {
            TimingRecord::Exact(t) => &t.request_id,
            TimingRecord::Estimated(t) => &t.request_id,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, TimingRecord::Exact(_))
    }
}

// ── Aggregates ─────────────────────────────────────────────────────

/// Point-in-time view of the running aggregate accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    /// Requests with exact (correlated) timings.
    pub total_requests: u64,
    /// Requests that fell back to estimated timings.
    pub estimated_requests: u64,
    pub mean_prefill: f64,
    pub mean_decode: f64,
    pub mean_ttft: f64,
    pub total_prefill: f64,
    pub total_decode: f64,
    /// Requests whose deltas were clamped due to a counter reset.
    pub counter_resets: u64,
}
