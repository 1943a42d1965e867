//! Free-text log line → structured [`LogEvent`].
//!
//! The serving frontend logs one line per request lifecycle stage. The
//! textual markers here match the vLLM v1 async engine's log format:
//!
//! ```text
//! 2025-01-15 10:30:00,123 INFO ... Received request chatcmpl-ab12: prompt: '...<step_info>Step3 maximum:25</step_info>...'
//! 2025-01-15 10:30:00,125 INFO ... Added request chatcmpl-ab12.
//! 2025-01-15 10:30:14,900 INFO ... Generated response chatcmpl-ab12: ... output_token_ids: [1, 2, 3], finish_reason: stop
//! 2025-01-15 10:30:14,901 INFO ... Aborted request(s) chatcmpl-cd34
//! ```
//!
//! Parsing never fails hard: a line without a recognized marker yields
//! `None`, and an unparseable timestamp falls back to ingestion time with
//! the event flagged.

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

use taskline_core::{EpochMillis, EventType, LogEvent};

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}),(\d{3})").unwrap()
});
static REQUEST_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(chatcmpl-[A-Za-z0-9]+)").unwrap());
static STEP_INFO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<step_info>Step(\d+)\s+maximum:(\d+)").unwrap());
static OUTPUT_TOKENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"output_token_ids: \[([^\]]*)\]").unwrap());
static FINISH_REASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"finish_reason: (\w+)").unwrap());

/// Parse one log line into a structured event.
///
/// Returns `None` for lines that carry no request lifecycle marker (engine
/// chatter, throughput summaries, etc.). `ingested_at` is substituted when
/// the line has no parseable timestamp.
pub fn parse_log_line(line: &str, ingested_at: EpochMillis) -> Option<LogEvent> {
    let event_type = if line.contains("Received request") {
        EventType::Received
    } else if line.contains("Added request") {
        EventType::Added
    } else if line.contains("Generated response") {
        EventType::Completed
    } else if line.contains("Aborted request") {
        EventType::Aborted
    } else {
        return None;
    };

    let (timestamp, fallback_timestamp) = match parse_timestamp(line) {
        Some(ts) => (ts, false),
        None => (ingested_at, true),
    };

    let request_id = REQUEST_ID_RE
        .captures(line)
        .map(|c| c[1].to_string());

    let (step, max_steps) = match STEP_INFO_RE.captures(line) {
        Some(c) => (c[1].parse().ok(), c[2].parse().ok()),
        None => (None, None),
    };

    let output_tokens = OUTPUT_TOKENS_RE.captures(line).map(|c| {
        c[1].split(',')
            .filter(|t| !t.trim().is_empty())
            .count() as u64
    });

    let finish_reason = FINISH_REASON_RE
        .captures(line)
        .map(|c| c[1].to_string());

    Some(LogEvent {
        request_id,
        event_type,
        timestamp,
        step,
        max_steps,
        output_tokens,
        finish_reason,
        fallback_timestamp,
        raw: line.to_string(),
    })
}

/// Extract the leading `%Y-%m-%d %H:%M:%S,%3f` timestamp as UTC millis.
fn parse_timestamp(line: &str) -> Option<EpochMillis> {
    let caps = TIMESTAMP_RE.captures(line)?;
    let dt = NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%d %H:%M:%S").ok()?;
    let millis: i64 = caps[2].parse().ok()?;
    Some(dt.and_utc().timestamp_millis() + millis)
}
