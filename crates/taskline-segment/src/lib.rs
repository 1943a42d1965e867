//! taskline-segment — turns a serving log stream into task sessions.
//!
//! The segmenter consumes structured log events strictly in arrival order
//! and decides task boundaries with two heuristics, evaluated in a fixed
//! order: an agent step-number reset, then an idle timeout. Later events
//! never reclassify earlier ones.
//!
//! # Architecture
//!
//! ```text
//! log line ──parse_log_line()──▶ LogEvent
//!     LogEvent ──▶ TaskSegmenter::observe()
//!         ├── boundary? close + open via TaskSink
//!         └── append entry to the active task
//! ```

pub mod parse;
pub mod segmenter;
pub mod sink;

pub use parse::parse_log_line;
pub use segmenter::{SegmenterStats, TaskSegmenter};
pub use sink::{FileTaskSink, MemoryTaskSink, SinkError, TaskSink};
