//! taskline-metrics — per-request timing from cumulative server counters.
//!
//! The serving engine only exposes cumulative Prometheus counters, so exact
//! per-request timing requires differencing two snapshots captured around
//! the request. This crate owns that whole path:
//!
//! ```text
//! fetch_exposition() ──▶ parse_exposition() ──▶ SnapshotStore
//!     SnapshotStore::try_correlate() ──▶ RequestTiming
//!         RequestTiming ──▶ TimingAggregator (running sums + ring buffer)
//!
//! SnapshotManager
//!   ├── on_received()  → Before fetch (bounded, fire-and-forget)
//!   ├── on_completed() → After fetch + correlate, or estimated fallback
//!   └── sweep()/shutdown() → evict + report unmatched snapshots
//! ```
//!
//! Telemetry failures degrade the feature, never the serving path: every
//! fetch is bounded by a timeout and every anomaly becomes a counter, not
//! a crash.

pub mod aggregate;
pub mod fetcher;
pub mod manager;
pub mod parser;
pub mod store;

pub use aggregate::TimingAggregator;
pub use fetcher::{fetch_exposition, FetchError};
pub use manager::{CorrelationReport, SnapshotManager};
pub use parser::{parse_exposition, ParsedCounters};
pub use store::SnapshotStore;
