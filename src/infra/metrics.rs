//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics updated from the session and the submission
//! worker. Reporting swaps the per-interval counters to zero.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only; the retry queue's busy flag lives elsewhere.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Submission round-trip bucket boundaries (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, >6400 ms
const SEND_BUCKET_BOUNDS: [u64; 8] = [50, 100, 200, 400, 800, 1600, 3200, 6400];
pub const SEND_NUM_BUCKETS: usize = 9;

#[inline]
fn send_bucket_index(latency_ms: u64) -> usize {
    SEND_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Host callbacks received (monotonic)
    events_total: AtomicU64,
    /// Host callbacks since last report (reset on report)
    events_since_report: AtomicU64,
    /// Enter/exit dropped inside the debounce window
    debounced_total: AtomicU64,
    /// Enter after enter / exit after exit
    duplicates_total: AtomicU64,
    /// Host callback errors
    provider_errors_total: AtomicU64,
    /// Callbacks refused because the device is not a patient's
    role_halts_total: AtomicU64,
    /// Zone transitions that were applied
    transitions_total: AtomicU64,
    /// Continuous samples suppressed by the change-detection cache
    samples_suppressed_total: AtomicU64,
    /// Scheduler escalations to high accuracy
    escalations_total: AtomicU64,
    /// Scheduler de-escalations to balanced accuracy
    deescalations_total: AtomicU64,
    /// Direct submissions that reached the API
    submissions_sent_total: AtomicU64,
    /// Direct submissions that failed and were queued
    submissions_failed_total: AtomicU64,
    /// Entries evicted from a full queue
    queue_evicted_total: AtomicU64,
    /// Queued entries delivered on retry
    queue_delivered_total: AtomicU64,
    /// Queued entries dropped after exhausting retries
    queue_dropped_total: AtomicU64,
    /// Submission commands that could not be handed to the worker
    submit_channel_full_total: AtomicU64,
    /// Direct send latency histogram (reset on report)
    send_latency_buckets: [AtomicU64; SEND_NUM_BUCKETS],
    /// Max direct send latency in ms (reset on report)
    send_latency_max_ms: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            debounced_total: AtomicU64::new(0),
            duplicates_total: AtomicU64::new(0),
            provider_errors_total: AtomicU64::new(0),
            role_halts_total: AtomicU64::new(0),
            transitions_total: AtomicU64::new(0),
            samples_suppressed_total: AtomicU64::new(0),
            escalations_total: AtomicU64::new(0),
            deescalations_total: AtomicU64::new(0),
            submissions_sent_total: AtomicU64::new(0),
            submissions_failed_total: AtomicU64::new(0),
            queue_evicted_total: AtomicU64::new(0),
            queue_delivered_total: AtomicU64::new(0),
            queue_dropped_total: AtomicU64::new(0),
            submit_channel_full_total: AtomicU64::new(0),
            send_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            send_latency_max_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_event(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_debounced(&self) {
        self.debounced_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duplicate(&self) {
        self.duplicates_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_provider_error(&self) {
        self.provider_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_role_halt(&self) {
        self.role_halts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition(&self) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_suppressed(&self) {
        self.samples_suppressed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_escalation(&self) {
        self.escalations_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deescalation(&self) {
        self.deescalations_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a direct submission that reached the API
    #[inline]
    pub fn record_submission_sent(&self, latency_ms: u64) {
        self.submissions_sent_total.fetch_add(1, Ordering::Relaxed);
        let bucket = send_bucket_index(latency_ms);
        self.send_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.send_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_submission_failed(&self) {
        self.submissions_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_evicted(&self, count: u64) {
        self.queue_evicted_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_delivered(&self, count: u64) {
        self.queue_delivered_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_dropped(&self, count: u64) {
        self.queue_dropped_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_submit_channel_full(&self) {
        self.submit_channel_full_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn debounced_total(&self) -> u64 {
        self.debounced_total.load(Ordering::Relaxed)
    }

    pub fn duplicates_total(&self) -> u64 {
        self.duplicates_total.load(Ordering::Relaxed)
    }

    pub fn submissions_sent_total(&self) -> u64 {
        self.submissions_sent_total.load(Ordering::Relaxed)
    }

    pub fn queue_dropped_total(&self) -> u64 {
        self.queue_dropped_total.load(Ordering::Relaxed)
    }

    /// Snapshot monotonic counters and swap the per-interval ones to zero
    pub fn report(&self, queue_depth: usize) -> MetricsSummary {
        let events_count = self.events_since_report.swap(0, Ordering::Relaxed);
        let send_max_ms = self.send_latency_max_ms.swap(0, Ordering::Relaxed);

        let mut send_buckets = [0u64; SEND_NUM_BUCKETS];
        for (i, bucket) in self.send_latency_buckets.iter().enumerate() {
            send_buckets[i] = bucket.swap(0, Ordering::Relaxed);
        }

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_min = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            events_total: self.events_total.load(Ordering::Relaxed),
            events_per_min,
            debounced_total: self.debounced_total.load(Ordering::Relaxed),
            duplicates_total: self.duplicates_total.load(Ordering::Relaxed),
            provider_errors_total: self.provider_errors_total.load(Ordering::Relaxed),
            role_halts_total: self.role_halts_total.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            samples_suppressed_total: self.samples_suppressed_total.load(Ordering::Relaxed),
            escalations_total: self.escalations_total.load(Ordering::Relaxed),
            deescalations_total: self.deescalations_total.load(Ordering::Relaxed),
            submissions_sent_total: self.submissions_sent_total.load(Ordering::Relaxed),
            submissions_failed_total: self.submissions_failed_total.load(Ordering::Relaxed),
            queue_evicted_total: self.queue_evicted_total.load(Ordering::Relaxed),
            queue_delivered_total: self.queue_delivered_total.load(Ordering::Relaxed),
            queue_dropped_total: self.queue_dropped_total.load(Ordering::Relaxed),
            submit_channel_full_total: self.submit_channel_full_total.load(Ordering::Relaxed),
            send_buckets,
            send_max_ms,
            queue_depth,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_total: u64,
    pub events_per_min: f64,
    pub debounced_total: u64,
    pub duplicates_total: u64,
    pub provider_errors_total: u64,
    pub role_halts_total: u64,
    pub transitions_total: u64,
    pub samples_suppressed_total: u64,
    pub escalations_total: u64,
    pub deescalations_total: u64,
    pub submissions_sent_total: u64,
    pub submissions_failed_total: u64,
    pub queue_evicted_total: u64,
    pub queue_delivered_total: u64,
    pub queue_dropped_total: u64,
    pub submit_channel_full_total: u64,
    /// Bounds: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, >6400 ms
    pub send_buckets: [u64; SEND_NUM_BUCKETS],
    pub send_max_ms: u64,
    pub queue_depth: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events_total = %self.events_total,
            events_per_min = format!("{:.1}", self.events_per_min),
            transitions = %self.transitions_total,
            debounced = %self.debounced_total,
            duplicates = %self.duplicates_total,
            provider_errors = %self.provider_errors_total,
            samples_suppressed = %self.samples_suppressed_total,
            escalations = %self.escalations_total,
            deescalations = %self.deescalations_total,
            sent = %self.submissions_sent_total,
            failed = %self.submissions_failed_total,
            queue_depth = %self.queue_depth,
            queue_delivered = %self.queue_delivered_total,
            queue_dropped = %self.queue_dropped_total,
            queue_evicted = %self.queue_evicted_total,
            send_max_ms = %self.send_max_ms,
            "metrics"
        );
    }
}
