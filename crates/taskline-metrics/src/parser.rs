//! Prometheus exposition text → canonical counter mapping.
//!
//! Only the six timing counters matter here; everything else in the
//! exposition (histogram buckets, gauges, build info) is ignored without
//! error. The engine has spelled these metrics with both a namespaced
//! `vllm:` prefix and a legacy `vllm_` prefix across versions; both resolve
//! to the same canonical [`MetricKey`].

use std::collections::HashMap;

use taskline_core::MetricKey;

/// Result of parsing one exposition document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCounters {
    /// Canonical key → cumulative value.
    pub counters: HashMap<MetricKey, f64>,
    /// Recognized metrics whose value failed to parse. Never fatal.
    pub parse_errors: usize,
    /// Lines skipped as comments, blanks, or unrecognized metrics.
    pub ignored_lines: usize,
}

/// Parse exposition text of the form `metric_name{labels} value`.
pub fn parse_exposition(text: &str) -> ParsedCounters {
    let mut out = ParsedCounters::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            out.ignored_lines += 1;
            continue;
        }

        // Metric name runs up to the label block or the first space.
        let name_end = line
            .find('{')
            .or_else(|| line.find(' '))
            .unwrap_or(line.len());
        let name = &line[..name_end];

        let Some(key) = canonical_key(name) else {
            out.ignored_lines += 1;
            continue;
        };

        // The value is the first token after the name (and label block,
        // if any); an optional trailing scrape timestamp is ignored.
        let rest = if let Some(brace) = line.find('{') {
            match line[brace..].find('}') {
                Some(close) => &line[brace + close + 1..],
                None => {
                    out.parse_errors += 1;
                    continue;
                }
            }
        } else {
            &line[name_end..]
        };

        let Some(value_str) = rest.split_whitespace().next() else {
            out.parse_errors += 1;
            continue;
        };

        match value_str.parse::<f64>() {
            // First series wins when the same metric appears under
            // several label sets.
            Ok(value) => {
                out.counters.entry(key).or_insert(value);
            }
            Err(_) => out.parse_errors += 1,
        }
    }

    out
}

/// Resolve a textual metric name, in any known alias spelling, to its
/// canonical key.
fn canonical_key(name: &str) -> Option<MetricKey> {
    let base = name
        .strip_prefix("vllm:")
        .or_else(|| name.strip_prefix("vllm_"))?;

    match base {
        "request_prefill_time_seconds_sum" => Some(MetricKey::PrefillSum),
        "request_prefill_time_seconds_count" => Some(MetricKey::PrefillCount),
        "request_decode_time_seconds_sum" => Some(MetricKey::DecodeSum),
        "request_decode_time_seconds_count" => Some(MetricKey::DecodeCount),
        "time_to_first_token_seconds_sum" => Some(MetricKey::TtftSum),
        "time_to_first_token_seconds_count" => Some(MetricKey::TtftCount),
        _ => None,
    }
}
