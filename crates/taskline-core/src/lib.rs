//! taskline-core — domain types for the task-log correlation engine.
//!
//! Defines the log events consumed by the segmenter, the task sessions it
//! produces, the metric snapshots captured around each request, and the
//! timing records derived from them. All record types serialize to JSON so
//! downstream sinks can persist or ship them.

pub mod config;
pub mod types;

pub use config::{SegmentConfig, SnapshotConfig};
pub use types::*;
