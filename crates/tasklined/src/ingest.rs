//! Sequential ingestion worker.
//!
//! One worker owns the segmenter: event ordering is load-bearing for
//! boundary decisions, so lines are parsed and observed strictly in
//! arrival order. Snapshot capture is dispatched to the manager, which
//! runs its fetches concurrently and independently.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error};

use taskline_core::{epoch_millis_now, EventType, LogEvent};
use taskline_metrics::SnapshotManager;
use taskline_segment::{parse_log_line, TaskSegmenter, TaskSink};

/// What one ingestion run consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Raw lines read from the input.
    pub lines: u64,
    /// Lines that carried a recognized lifecycle marker.
    pub events: u64,
}

/// Consume the input to EOF, feeding the segmenter and the snapshot
/// manager. Sink failures are logged and skipped; they never stop
/// ingestion.
pub async fn run_ingest<R, S>(
    reader: R,
    segmenter: &mut TaskSegmenter<S>,
    manager: &Arc<SnapshotManager>,
) -> anyhow::Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
    S: TaskSink,
{
    let mut stats = IngestStats::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        stats.lines += 1;
        let Some(event) = parse_log_line(&line, epoch_millis_now()) else {
            continue;
        };
        stats.events += 1;

        if let Err(e) = segmenter.observe(&event) {
            error!(error = %e, "task sink write failed; event dropped from task log");
        }
        dispatch_snapshot_hooks(manager, &event).await;
    }

    debug!(lines = stats.lines, events = stats.events, "input exhausted");
    Ok(stats)
}

/// Trigger snapshot capture for the request lifecycle stages that need it.
async fn dispatch_snapshot_hooks(manager: &Arc<SnapshotManager>, event: &LogEvent) {
    let Some(request_id) = &event.request_id else {
        return;
    };
    match event.event_type {
        EventType::Received => manager.on_received(request_id, event.timestamp).await,
        EventType::Completed => {
            manager
                .on_completed(request_id, event.timestamp, event.output_tokens)
                .await
        }
        EventType::Aborted => manager.on_aborted(request_id).await,
        EventType::Added => {}
    }
}
