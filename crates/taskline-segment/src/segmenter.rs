//! The task segmenter — a sequential state machine over log events.
//!
//! Two states: no active task, or exactly one active task. Boundary rules,
//! evaluated in a fixed order so that simultaneous triggers open only one
//! boundary:
//!
//! 1. **Step reset**: the event's step number dropped below the highest
//!    step seen in the active task (a new agent run started).
//! 2. **Idle timeout**: the gap since the task's last event exceeds the
//!    configured idle timeout.
//!
//! Events must be observed strictly in arrival order; an event whose
//! timestamp is not after the task's last event is appended to the current
//! task flagged as an ordering anomaly and never reopens a closed task.

use chrono::DateTime;
use tracing::{debug, warn};

use taskline_core::{EpochMillis, EventType, LogEvent, SegmentConfig, Task, TaskId, TaskSummary};

use crate::sink::{SinkError, TaskSink};

/// Why a task boundary was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundaryReason {
    StepReset,
    IdleTimeout,
}

/// Counters describing what the segmenter has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmenterStats {
    pub events: u64,
    pub tasks_opened: u64,
    pub tasks_closed: u64,
    pub step_resets: u64,
    pub idle_splits: u64,
    pub ordering_anomalies: u64,
    pub fallback_timestamps: u64,
}

/// Segments an ordered log-event stream into task sessions.
///
/// Owns its sink and its clock inputs explicitly; there is no ambient
/// "current task" state outside this struct.
pub struct TaskSegmenter<S: TaskSink> {
    sink: S,
    idle_timeout_ms: i64,
    active: Option<Task>,
    stats: SegmenterStats,
}

impl<S: TaskSink> TaskSegmenter<S> {
    pub fn new(config: &SegmentConfig, sink: S) -> Self {
        Self {
            sink,
            idle_timeout_ms: config.idle_timeout().as_millis() as i64,
            active: None,
            stats: SegmenterStats::default(),
        }
    }

    /// Consume one event, in arrival order.
    ///
    /// The event is absorbed into segmenter state before the sink result
    /// is reported, so a sink failure loses at most that one write —
    /// never the task, its close, or any later event.
    pub fn observe(&mut self, event: &LogEvent) -> Result<(), SinkError> {
        self.stats.events += 1;
        if event.fallback_timestamp {
            self.stats.fallback_timestamps += 1;
        }

        let Some(mut task) = self.active.take() else {
            return self.open_task(event);
        };

        // Non-monotonic arrival: keep the event in the current task,
        // flagged. It must never open a boundary or reclassify anything.
        if event.timestamp <= task.last_event_at {
            self.stats.ordering_anomalies += 1;
            warn!(
                task_id = %task.task_id,
                event_ts = event.timestamp,
                last_event_ts = task.last_event_at,
                "out-of-order event appended to current task"
            );
            let entry = format!("[out-of-order] {}", event.raw);
            let result = self.sink.append(&task.task_id, &entry);
            apply_event(&mut task, event, true);
            self.active = Some(task);
            return result;
        }

        match self.boundary_reason(&task, event) {
            Some(reason) => {
                match reason {
                    BoundaryReason::StepReset => self.stats.step_resets += 1,
                    BoundaryReason::IdleTimeout => self.stats.idle_splits += 1,
                }
                debug!(
                    task_id = %task.task_id,
                    ?reason,
                    requests = task.request_count(),
                    "task boundary detected"
                );

                // The old task ended at its last activity, not at the
                // boundary event. A failed close trailer must not block
                // the new task.
                task.close(task.last_event_at);
                self.stats.tasks_closed += 1;
                let close_result = self.sink.close(&task.summary(false));
                let open_result = self.open_task(event);
                close_result.and(open_result)
            }
            None => {
                let result = self.sink.append(&task.task_id, &event.raw);
                apply_event(&mut task, event, false);
                self.active = Some(task);
                result
            }
        }
    }

    /// Close the active task, if any, as truncated at `now`.
    ///
    /// Called on shutdown; returns the final task's summary.
    pub fn flush(&mut self, now: EpochMillis) -> Result<Option<TaskSummary>, SinkError> {
        let Some(mut task) = self.active.take() else {
            return Ok(None);
        };
        task.close(now);
        let summary = task.summary(true);
        self.stats.tasks_closed += 1;
        self.sink.close(&summary)?;
        debug!(task_id = %summary.task_id, requests = summary.request_count, "active task flushed");
        Ok(Some(summary))
    }

    pub fn stats(&self) -> SegmenterStats {
        self.stats
    }

    /// The currently active task, if one is open.
    pub fn active_task(&self) -> Option<&Task> {
        self.active.as_ref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn open_task(&mut self, event: &LogEvent) -> Result<(), SinkError> {
        let mut task = Task::open(derive_task_id(event.timestamp), event.timestamp);
        self.stats.tasks_opened += 1;
        debug!(task_id = %task.task_id, "task opened");
        let open_result = self.sink.open(&task);
        let append_result = self.sink.append(&task.task_id, &event.raw);
        apply_event(&mut task, event, false);
        self.active = Some(task);
        open_result.and(append_result)
    }

    /// Rule order matters: step reset is checked before idle timeout so
    /// that only one boundary opens when both would trigger.
    fn boundary_reason(&self, task: &Task, event: &LogEvent) -> Option<BoundaryReason> {
        if let (Some(step), Some(max_seen)) = (event.step, task.max_step_seen) {
            if step < max_seen {
                return Some(BoundaryReason::StepReset);
            }
        }
        if event.timestamp - task.last_event_at > self.idle_timeout_ms {
            return Some(BoundaryReason::IdleTimeout);
        }
        None
    }
}

/// Fold one event into the task it belongs to. Anomaly-flagged events
/// stay in the task but never advance the boundary-deciding fields
/// (`last_event_at`, `max_step_seen`), so a straggler cannot fake a
/// step reset or shrink the idle gap.
fn apply_event(task: &mut Task, event: &LogEvent, anomaly: bool) {
    if event.event_type == EventType::Received {
        if let Some(id) = &event.request_id {
            task.request_ids.push(id.clone());
        }
    }
    if !anomaly {
        if let Some(step) = event.step {
            task.max_step_seen = Some(task.max_step_seen.map_or(step, |m| m.max(step)));
        }
        task.last_event_at = event.timestamp;
    }
}

/// Derive a task id from its opening event's timestamp.
fn derive_task_id(at: EpochMillis) -> TaskId {
    DateTime::from_timestamp_millis(at)
        .map(|dt| format!("task_{}", dt.format("%Y%m%d_%H%M%S_%3f")))
        .unwrap_or_else(|| format!("task_{at}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryTaskSink;

    const MINUTE_MS: i64 = 60_000;

    fn config() -> SegmentConfig {
        SegmentConfig {
            idle_timeout_mins: 5,
        }
    }

    fn event(
        request_id: Option<&str>,
        event_type: EventType,
        timestamp: EpochMillis,
        step: Option<u32>,
    ) -> LogEvent {
        LogEvent {
            request_id: request_id.map(str::to_string),
            event_type,
            timestamp,
            step,
            max_steps: step.map(|_| 25),
            output_tokens: None,
            finish_reason: None,
            fallback_timestamp: false,
            raw: format!("event at {timestamp}"),
        }
    }

    fn received(id: &str, ts: EpochMillis, step: Option<u32>) -> LogEvent {
        event(Some(id), EventType::Received, ts, step)
    }

    #[test]
    fn first_event_opens_a_task() {
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-1", 1_000, Some(1))).unwrap();

        assert_eq!(seg.stats().tasks_opened, 1);
        let task = seg.active_task().unwrap();
        assert_eq!(task.request_ids, vec!["chatcmpl-1"]);
        assert_eq!(task.max_step_seen, Some(1));
    }

    #[test]
    fn step_reset_splits_into_two_tasks() {
        // Steps [1, 2, 3, 1, 2]: split exactly where the counter drops.
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        for (i, step) in [1u32, 2, 3, 1, 2].iter().enumerate() {
            let ts = 1_000 + i as i64 * 1_000;
            seg.observe(&received(&format!("chatcmpl-{i}"), ts, Some(*step)))
                .unwrap();
        }
        seg.flush(10_000).unwrap();

        let sink = seg.into_sink();
        assert_eq!(sink.opened.len(), 2);
        assert_eq!(sink.closed.len(), 2);
        assert_eq!(sink.entries[&sink.opened[0]].len(), 3);
        assert_eq!(sink.entries[&sink.opened[1]].len(), 2);
    }

    #[test]
    fn idle_timeout_splits_tasks() {
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-1", 0, None)).unwrap();
        // Gap of 6 minutes, no step numbers: idle rule is the sole criterion.
        seg.observe(&received("chatcmpl-2", 6 * MINUTE_MS, None))
            .unwrap();
        seg.flush(7 * MINUTE_MS).unwrap();

        let stats = seg.stats();
        assert_eq!(stats.idle_splits, 1);
        assert_eq!(stats.step_resets, 0);

        let sink = seg.into_sink();
        assert_eq!(sink.opened.len(), 2);
        assert_eq!(sink.closed[0].request_count, 1);
        assert_eq!(sink.closed[1].request_count, 1);
    }

    #[test]
    fn gap_at_exactly_the_timeout_does_not_split() {
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-1", 0, None)).unwrap();
        seg.observe(&received("chatcmpl-2", 5 * MINUTE_MS, None))
            .unwrap();

        assert_eq!(seg.stats().tasks_opened, 1);
    }

    #[test]
    fn simultaneous_triggers_open_one_boundary() {
        // Step drops AND the idle window lapses: a single new task, and
        // the split is attributed to the step reset (checked first).
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-1", 0, Some(3))).unwrap();
        seg.observe(&received("chatcmpl-2", 10 * MINUTE_MS, Some(1)))
            .unwrap();

        let stats = seg.stats();
        assert_eq!(stats.tasks_opened, 2);
        assert_eq!(stats.step_resets, 1);
        assert_eq!(stats.idle_splits, 0);
    }

    #[test]
    fn repeating_the_same_step_does_not_split() {
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-1", 0, Some(1))).unwrap();
        // A retry of the same step is not a reset.
        seg.observe(&received("chatcmpl-2", 1_000, Some(1))).unwrap();

        assert_eq!(seg.stats().tasks_opened, 1);
    }

    #[test]
    fn out_of_order_event_stays_in_current_task() {
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-1", 10_000, Some(2))).unwrap();
        // Earlier timestamp, lower step: would look like a reset, but
        // non-monotonic arrivals never open a boundary.
        seg.observe(&received("chatcmpl-2", 9_000, Some(1))).unwrap();

        let stats = seg.stats();
        assert_eq!(stats.tasks_opened, 1);
        assert_eq!(stats.ordering_anomalies, 1);

        let task = seg.active_task().unwrap();
        assert_eq!(task.request_ids.len(), 2);
        assert_eq!(task.last_event_at, 10_000);

        let sink = seg.sink();
        let entries = &sink.entries[&sink.opened[0]];
        assert!(entries[1].starts_with("[out-of-order] "));
    }

    #[test]
    fn fallback_timestamp_is_processed_normally() {
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        let mut e = received("chatcmpl-1", 1_000, None);
        e.fallback_timestamp = true;
        seg.observe(&e).unwrap();

        assert_eq!(seg.stats().fallback_timestamps, 1);
        assert_eq!(seg.stats().tasks_opened, 1);
    }

    #[test]
    fn flush_closes_active_task_truncated() {
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-1", 1_000, None)).unwrap();

        let summary = seg.flush(99_000).unwrap().unwrap();
        assert!(summary.truncated);
        assert_eq!(summary.ended_at, 99_000);
        assert_eq!(summary.request_count, 1);
        assert!(seg.active_task().is_none());

        // Flushing again is a no-op; close is delivered exactly once.
        assert!(seg.flush(100_000).unwrap().is_none());
        assert_eq!(seg.into_sink().closed.len(), 1);
    }

    #[test]
    fn boundary_closes_previous_task_at_its_last_event() {
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-1", 0, None)).unwrap();
        seg.observe(&received("chatcmpl-2", 2_000, None)).unwrap();
        seg.observe(&received("chatcmpl-3", 20 * MINUTE_MS, None))
            .unwrap();

        let sink = seg.sink();
        assert_eq!(sink.closed[0].ended_at, 2_000);
        assert!(!sink.closed[0].truncated);
    }

    #[test]
    fn closed_tasks_partition_the_event_stream() {
        // Mixed boundaries; every event lands in exactly one task, none lost.
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        let steps = [
            (0i64, Some(1)),
            (1_000, Some(2)),
            (2_000, Some(1)),           // step reset
            (3_000, None),
            (30 * MINUTE_MS, None),     // idle split
            (30 * MINUTE_MS + 1, Some(5)),
        ];
        for (i, (ts, step)) in steps.iter().enumerate() {
            seg.observe(&received(&format!("chatcmpl-{i}"), *ts, *step))
                .unwrap();
        }
        seg.flush(31 * MINUTE_MS).unwrap();

        let sink = seg.into_sink();
        assert_eq!(sink.opened.len(), 3);
        let total_entries: usize = sink.entries.values().map(Vec::len).sum();
        assert_eq!(total_entries, steps.len());
        let total_requests: usize = sink.closed.iter().map(|s| s.request_count).sum();
        assert_eq!(total_requests, steps.len());
    }

    #[test]
    fn full_lifecycle_lands_requests_in_distinct_tasks() {
        // Received/Added/Completed for r1, then a fresh Received for r2
        // after a long gap: r1 and r2 belong to two distinct tasks.
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-r1", 0, Some(1))).unwrap();
        seg.observe(&event(Some("chatcmpl-r1"), EventType::Added, MINUTE_MS, None))
            .unwrap();
        seg.observe(&event(
            Some("chatcmpl-r1"),
            EventType::Completed,
            15 * MINUTE_MS,
            None,
        ))
        .unwrap();
        seg.observe(&received("chatcmpl-r2", 300 * MINUTE_MS, Some(1)))
            .unwrap();
        seg.flush(301 * MINUTE_MS).unwrap();

        let sink = seg.into_sink();
        assert_eq!(sink.closed.len(), 2);
        // Only Received events contribute request ids.
        assert_eq!(sink.closed[0].request_count, 1);
        assert_eq!(sink.closed[1].request_count, 1);
        assert_eq!(sink.entries[&sink.opened[0]].len(), 3);
        assert_eq!(sink.entries[&sink.opened[1]].len(), 1);
    }

    #[test]
    fn task_id_derives_from_timestamp() {
        // 2025-01-15 10:30:00.123 UTC
        let id = derive_task_id(1_736_937_000_123);
        assert_eq!(id, "task_20250115_103000_123");
    }

    /// Memory sink that fails the nth append or close, for exercising
    /// the degraded-sink path.
    struct FlakySink {
        inner: MemoryTaskSink,
        fail_on_append: Option<u64>,
        fail_on_close: Option<u64>,
        appends: u64,
        closes: u64,
    }

    impl FlakySink {
        fn failing_append(nth: u64) -> Self {
            Self {
                inner: MemoryTaskSink::new(),
                fail_on_append: Some(nth),
                fail_on_close: None,
                appends: 0,
                closes: 0,
            }
        }

        fn failing_close(nth: u64) -> Self {
            Self {
                inner: MemoryTaskSink::new(),
                fail_on_append: None,
                fail_on_close: Some(nth),
                appends: 0,
                closes: 0,
            }
        }
    }

    impl TaskSink for FlakySink {
        fn open(&mut self, task: &Task) -> Result<(), SinkError> {
            self.inner.open(task)
        }

        fn append(&mut self, task_id: &str, entry: &str) -> Result<(), SinkError> {
            self.appends += 1;
            if self.fail_on_append == Some(self.appends) {
                return Err(SinkError::Io(std::io::Error::other("disk full")));
            }
            self.inner.append(task_id, entry)
        }

        fn close(&mut self, summary: &TaskSummary) -> Result<(), SinkError> {
            self.closes += 1;
            if self.fail_on_close == Some(self.closes) {
                return Err(SinkError::Io(std::io::Error::other("disk full")));
            }
            self.inner.close(summary)
        }
    }

    #[test]
    fn sink_failure_loses_one_write_not_the_task() {
        // Three events inside the idle window; the middle append fails.
        let mut seg = TaskSegmenter::new(&config(), FlakySink::failing_append(2));
        seg.observe(&received("chatcmpl-1", 1_000, None)).unwrap();
        let err = seg.observe(&received("chatcmpl-2", 2_000, None)).unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));
        seg.observe(&received("chatcmpl-3", 3_000, None)).unwrap();

        // The failing event still landed in the active task.
        let task = seg.active_task().unwrap();
        assert_eq!(task.request_ids.len(), 3);
        assert_eq!(task.last_event_at, 3_000);

        seg.flush(10_000).unwrap();
        let sink = seg.into_sink().inner;
        assert_eq!(sink.opened.len(), 1);
        assert_eq!(sink.closed.len(), 1);
        assert_eq!(sink.closed[0].request_count, 3);
        // Only the failed write itself is missing.
        assert_eq!(sink.entries[&sink.opened[0]].len(), 2);
    }

    #[test]
    fn failed_close_trailer_still_opens_the_next_task() {
        let mut seg = TaskSegmenter::new(&config(), FlakySink::failing_close(1));
        seg.observe(&received("chatcmpl-1", 0, None)).unwrap();
        let err = seg
            .observe(&received("chatcmpl-2", 10 * MINUTE_MS, None))
            .unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));

        let stats = seg.stats();
        assert_eq!(stats.tasks_opened, 2);
        assert_eq!(stats.tasks_closed, 1);
        let task = seg.active_task().unwrap();
        assert_eq!(task.request_ids, vec!["chatcmpl-2"]);
    }

    #[test]
    fn out_of_order_step_does_not_poison_reset_detection() {
        let mut seg = TaskSegmenter::new(&config(), MemoryTaskSink::new());
        seg.observe(&received("chatcmpl-1", 10_000, Some(5))).unwrap();
        // High-step straggler: flagged, kept, never boundary-deciding.
        seg.observe(&received("chatcmpl-2", 9_000, Some(9))).unwrap();
        // Step 6 continues the run; it is only a reset against the
        // straggler's step 9, which must not count.
        seg.observe(&received("chatcmpl-3", 11_000, Some(6))).unwrap();

        let stats = seg.stats();
        assert_eq!(stats.tasks_opened, 1);
        assert_eq!(stats.step_resets, 0);
        assert_eq!(stats.ordering_anomalies, 1);
        assert_eq!(seg.active_task().unwrap().max_step_seen, Some(6));
    }
}
