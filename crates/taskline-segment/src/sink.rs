//! Task sinks — where segmented task logs go.
//!
//! The segmenter owns boundary decisions; a [`TaskSink`] owns persistence.
//! Appends for a task arrive in emission order and `close` is delivered
//! exactly once per task, including on forced shutdown.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::DateTime;
use thiserror::Error;
use tracing::debug;

use taskline_core::{EpochMillis, Task, TaskSummary};

/// Errors surfaced by a task sink.
///
/// Sink failures are logged by the caller and never crash ingestion.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no open task named {0}")]
    UnknownTask(String),
}

/// Receives ordered task-log output from the segmenter.
pub trait TaskSink {
    /// A new task was opened. Called before any `append` for it.
    fn open(&mut self, task: &Task) -> Result<(), SinkError>;

    /// Append one formatted entry to an open task.
    fn append(&mut self, task_id: &str, entry: &str) -> Result<(), SinkError>;

    /// Finalize a task. Called exactly once, after its last `append`.
    fn close(&mut self, summary: &TaskSummary) -> Result<(), SinkError>;
}

// ── File sink ──────────────────────────────────────────────────────

/// Writes each task to its own `<task_id>.log` file with a banner header
/// and a close trailer, mirroring the layout human operators already grep.
pub struct FileTaskSink {
    directory: PathBuf,
    current: Option<(String, BufWriter<File>)>,
}

const BANNER: &str = "======================================================================";

impl FileTaskSink {
    /// Create a sink writing under `directory`, creating it if needed.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            current: None,
        })
    }

    fn writer_for(&mut self, task_id: &str) -> Result<&mut BufWriter<File>, SinkError> {
        match self.current {
            Some((ref id, ref mut w)) if id == task_id => Ok(w),
            _ => Err(SinkError::UnknownTask(task_id.to_string())),
        }
    }
}

impl TaskSink for FileTaskSink {
    fn open(&mut self, task: &Task) -> Result<(), SinkError> {
        let path = self.directory.join(format!("{}.log", task.task_id));
        let mut writer = BufWriter::new(File::create(&path)?);

        writeln!(writer, "{BANNER}")?;
        writeln!(writer, "Task Log")?;
        writeln!(writer, "Task ID: {}", task.task_id)?;
        writeln!(writer, "Started: {}", format_millis(task.started_at))?;
        writeln!(writer, "{BANNER}")?;
        writeln!(writer)?;
        writer.flush()?;

        debug!(task_id = %task.task_id, path = %path.display(), "task log opened");
        self.current = Some((task.task_id.clone(), writer));
        Ok(())
    }

    fn append(&mut self, task_id: &str, entry: &str) -> Result<(), SinkError> {
        let writer = self.writer_for(task_id)?;
        writeln!(writer, "{entry}")?;
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self, summary: &TaskSummary) -> Result<(), SinkError> {
        let writer = self.writer_for(&summary.task_id)?;
        writeln!(writer)?;
        writeln!(writer, "{BANNER}")?;
        writeln!(writer, "Task ended: {}", format_millis(summary.ended_at))?;
        writeln!(writer, "Total requests: {}", summary.request_count)?;
        if summary.truncated {
            writeln!(writer, "Truncated: task was still active at shutdown")?;
        }
        writeln!(writer, "{BANNER}")?;
        writer.flush()?;

        debug!(task_id = %summary.task_id, requests = summary.request_count, "task log closed");
        self.current = None;
        Ok(())
    }
}

fn format_millis(at: EpochMillis) -> String {
    DateTime::from_timestamp_millis(at)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| at.to_string())
}

// ── Memory sink ────────────────────────────────────────────────────

/// In-memory sink for tests: records every call in order.
#[derive(Debug, Default)]
pub struct MemoryTaskSink {
    /// Task ids in open order.
    pub opened: Vec<String>,
    /// Entries per task id, in append order.
    pub entries: HashMap<String, Vec<String>>,
    /// Close trailers in close order.
    pub closed: Vec<TaskSummary>,
}

impl MemoryTaskSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskSink for MemoryTaskSink {
    fn open(&mut self, task: &Task) -> Result<(), SinkError> {
        self.opened.push(task.task_id.clone());
        self.entries.insert(task.task_id.clone(), Vec::new());
        Ok(())
    }

    fn append(&mut self, task_id: &str, entry: &str) -> Result<(), SinkError> {
        self.entries
            .get_mut(task_id)
            .ok_or_else(|| SinkError::UnknownTask(task_id.to_string()))?
            .push(entry.to_string());
        Ok(())
    }

    fn close(&mut self, summary: &TaskSummary) -> Result<(), SinkError> {
        self.closed.push(summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str, at: EpochMillis) -> Task {
        Task::open(id.to_string(), at)
    }

    #[test]
    fn file_sink_writes_header_entries_and_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileTaskSink::new(dir.path()).unwrap();

        let mut task = sample_task("task_20250115_103000_123", 1_000);
        sink.open(&task).unwrap();
        sink.append(&task.task_id, "first entry").unwrap();
        sink.append(&task.task_id, "second entry").unwrap();

        task.request_ids.push("chatcmpl-1".to_string());
        task.close(2_000);
        sink.close(&task.summary(false)).unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("task_20250115_103000_123.log")).unwrap();
        assert!(content.contains("Task ID: task_20250115_103000_123"));
        assert!(content.contains("first entry\nsecond entry"));
        assert!(content.contains("Total requests: 1"));
        assert!(!content.contains("Truncated"));
    }

    #[test]
    fn file_sink_marks_truncated_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileTaskSink::new(dir.path()).unwrap();

        let mut task = sample_task("task_x", 1_000);
        sink.open(&task).unwrap();
        task.close(9_000);
        sink.close(&task.summary(true)).unwrap();

        let content = std::fs::read_to_string(dir.path().join("task_x.log")).unwrap();
        assert!(content.contains("Truncated"));
    }

    #[test]
    fn file_sink_rejects_append_to_unopened_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileTaskSink::new(dir.path()).unwrap();
        let err = sink.append("task_missing", "entry").unwrap_err();
        assert!(matches!(err, SinkError::UnknownTask(_)));
    }

    #[test]
    fn memory_sink_preserves_order() {
        let mut sink = MemoryTaskSink::new();
        let task = sample_task("task_a", 0);
        sink.open(&task).unwrap();
        sink.append("task_a", "one").unwrap();
        sink.append("task_a", "two").unwrap();

        assert_eq!(sink.entries["task_a"], vec!["one", "two"]);
    }
}
