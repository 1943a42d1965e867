//! Configuration for the segmenter and the snapshot pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Task segmentation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Gap between events, in minutes, beyond which a new task begins.
    pub idle_timeout_mins: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            idle_timeout_mins: 5,
        }
    }
}

impl SegmentConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_mins * 60)
    }
}

/// Snapshot capture and correlation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Metrics endpoint address (`host:port`).
    pub metrics_address: String,
    /// HTTP path of the exposition endpoint.
    pub metrics_path: String,
    /// Per-fetch timeout in seconds; a slow endpoint degrades to a
    /// "missing" snapshot rather than blocking.
    pub fetch_timeout_secs: u64,
    /// How long an unmatched snapshot is retained, in minutes.
    pub retention_ttl_mins: u64,
    /// Ring-buffer cap for recently computed timing records.
    pub max_retained_timings: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            metrics_address: "127.0.0.1:11434".to_string(),
            metrics_path: "/metrics".to_string(),
            fetch_timeout_secs: 3,
            retention_ttl_mins: 30,
            max_retained_timings: 256,
        }
    }
}

impl SnapshotConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn retention_ttl(&self) -> Duration {
        Duration::from_secs(self.retention_ttl_mins * 60)
    }
}
