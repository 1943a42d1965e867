//! Running timing aggregates.
//!
//! Accumulation is commutative, so cross-request ordering is immaterial to
//! the final totals and no global lock is needed: counts are plain atomics
//! and the float sums use CAS loops over their bit patterns. Only the
//! bounded ring buffer of recent records takes a (short) mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use taskline_core::{AggregateSummary, EstimatedTiming, RequestTiming, TimingRecord};

/// Accumulates per-request timings into running sums plus a bounded ring
/// buffer of the most recent records for inspection.
pub struct TimingAggregator {
    exact_count: AtomicU64,
    estimated_count: AtomicU64,
    counter_resets: AtomicU64,
    /// f64 sums stored as bit patterns.
    sum_prefill: AtomicU64,
    sum_decode: AtomicU64,
    sum_ttft: AtomicU64,
    recent: Mutex<VecDeque<TimingRecord>>,
    cap: usize,
}

impl TimingAggregator {
    /// Create an aggregator retaining at most `cap` recent records.
    pub fn new(cap: usize) -> Self {
        Self {
            exact_count: AtomicU64::new(0),
            estimated_count: AtomicU64::new(0),
            counter_resets: AtomicU64::new(0),
            sum_prefill: AtomicU64::new(0.0f64.to_bits()),
            sum_decode: AtomicU64::new(0.0f64.to_bits()),
            sum_ttft: AtomicU64::new(0.0f64.to_bits()),
            recent: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    /// Fold an exact (correlated) timing into the running sums.
    pub fn record_exact(&self, timing: RequestTiming) {
        self.exact_count.fetch_add(1, Ordering::Relaxed);
        if timing.counter_reset_detected {
            self.counter_resets.fetch_add(1, Ordering::Relaxed);
        }
        add_f64(&self.sum_prefill, timing.prefill_time);
        add_f64(&self.sum_decode, timing.decode_time);
        add_f64(&self.sum_ttft, timing.ttft);
        self.push_recent(TimingRecord::Exact(timing));
    }

    /// Record an estimated fallback timing.
    ///
    /// Estimated results never enter the exact sums; they are counted and
    /// retained separately so the two kinds stay distinguishable.
    pub fn record_estimated(&self, timing: EstimatedTiming) {
        self.estimated_count.fetch_add(1, Ordering::Relaxed);
        self.push_recent(TimingRecord::Estimated(timing));
    }

    /// Point-in-time aggregate view.
    pub fn summary(&self) -> AggregateSummary {
        let count = self.exact_count.load(Ordering::Relaxed);
        let total_prefill = load_f64(&self.sum_prefill);
        let total_decode = load_f64(&self.sum_decode);
        let total_ttft = load_f64(&self.sum_ttft);
        let mean = |sum: f64| if count > 0 { sum / count as f64 } else { 0.0 };

        AggregateSummary {
            total_requests: count,
            estimated_requests: self.estimated_count.load(Ordering::Relaxed),
            mean_prefill: mean(total_prefill),
            mean_decode: mean(total_decode),
            mean_ttft: mean(total_ttft),
            total_prefill,
            total_decode,
            counter_resets: self.counter_resets.load(Ordering::Relaxed),
        }
    }

    /// The most recent timing records, oldest first.
    pub fn recent(&self) -> Vec<TimingRecord> {
        self.recent
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn push_recent(&self, record: TimingRecord) {
        if self.cap == 0 {
            return;
        }
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == self.cap {
                recent.pop_front();
            }
            recent.push_back(record);
        }
    }
}

/// Commutative float add via CAS on the bit pattern.
fn add_f64(cell: &AtomicU64, value: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(current) + value).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}
