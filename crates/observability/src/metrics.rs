//! Metrics collector.
//!
//! Lock-free counters and gauges (atomics in sharded maps) that job workers,
//! the broadcaster and the session manager update on their hot paths. An
//! exporter turns a [`MetricsSnapshot`] into whatever the external collector
//! scrapes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Upper bounds (milliseconds) of the latency histogram buckets.
pub const LATENCY_BUCKETS_MS: [u64; 14] = [
    1, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000,
];

/// Fixed-bucket latency histogram.
///
/// Percentiles are estimated as the upper bound of the bucket containing the
/// requested rank; observations beyond the last bound report the largest
/// value seen.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    sum_ms: AtomicU64,
    count: AtomicU64,
    max_ms: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max_ms: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let ms = duration.as_millis().min(u64::MAX as u128) as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let count = self.count.load(Ordering::Relaxed);
        let max_ms = self.max_ms.load(Ordering::Relaxed);
        let estimate = |q: f64| percentile_from_buckets(&counts, count, max_ms, q);

        HistogramSnapshot {
            p50_ms: estimate(0.50),
            p90_ms: estimate(0.90),
            p99_ms: estimate(0.99),
            bucket_counts: counts.clone(),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            count,
            max_ms,
        }
    }
}

fn percentile_from_buckets(counts: &[u64], total: u64, max_ms: u64, q: f64) -> u64 {
    if total == 0 {
        return 0;
    }
    let rank = ((total as f64) * q).ceil().max(1.0) as u64;
    let mut cumulative = 0;
    for (idx, n) in counts.iter().enumerate() {
        cumulative += n;
        if cumulative >= rank {
            return LATENCY_BUCKETS_MS
                .get(idx)
                .map(|bound| (*bound).min(max_ms))
                .unwrap_or(max_ms);
        }
    }
    max_ms
}

/// Point-in-time view of one histogram.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramSnapshot {
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
    /// Per-bucket (non-cumulative) counts; the last entry is the +Inf bucket.
    pub bucket_counts: Vec<u64>,
    pub sum_ms: u64,
    pub count: u64,
    pub max_ms: u64,
}

/// Metrics collector for the job engine and the real-time layer.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    // Jobs
    jobs_enqueued: DashMap<String, AtomicU64>,
    job_executions: DashMap<(String, String), AtomicU64>,
    job_retries: DashMap<String, AtomicU64>,
    dead_letters: DashMap<String, AtomicU64>,
    queue_depth: DashMap<String, AtomicU64>,
    job_duration: DashMap<String, LatencyHistogram>,
    jobs_running: AtomicU64,
    broker_errors: AtomicU64,

    // Scheduler
    schedule_fired: DashMap<String, AtomicU64>,
    schedule_missed: DashMap<String, AtomicU64>,

    // Real-time
    active_connections: AtomicU64,
    subscriptions_rejected: AtomicU64,
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
}

fn bump(map: &DashMap<String, AtomicU64>, key: &str, by: u64) {
    if let Some(counter) = map.get(key) {
        counter.fetch_add(by, Ordering::Relaxed);
        return;
    }
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(by, Ordering::Relaxed);
}

fn collect(map: &DashMap<String, AtomicU64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Job Metrics ==========

    pub fn record_enqueued(&self, queue: &str) {
        bump(&self.jobs_enqueued, queue, 1);
    }

    /// Record one finished execution attempt.
    pub fn record_execution(&self, job: &str, outcome: &str, duration: Duration) {
        self.job_executions
            .entry((job.to_string(), outcome.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.job_duration
            .entry(job.to_string())
            .or_default()
            .observe(duration);
    }

    pub fn record_retry(&self, job: &str) {
        bump(&self.job_retries, job, 1);
    }

    pub fn record_dead_letter(&self, code: &str) {
        bump(&self.dead_letters, code, 1);
    }

    /// Envelopes the broker holds for `queue`: visible, delayed and leased.
    pub fn set_queue_depth(&self, queue: &str, depth: u64) {
        self.queue_depth
            .entry(queue.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(depth, Ordering::Relaxed);
    }

    pub fn job_started(&self) {
        self.jobs_running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self) {
        let _ = self
            .jobs_running
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn record_broker_error(&self) {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Latency histogram snapshot for one handler.
    pub fn job_latency(&self, job: &str) -> Option<HistogramSnapshot> {
        self.job_duration.get(job).map(|h| h.snapshot())
    }

    // ========== Scheduler Metrics ==========

    pub fn record_schedule_fired(&self, entry: &str) {
        bump(&self.schedule_fired, entry, 1);
    }

    pub fn record_schedule_missed(&self, entry: &str, missed: u64) {
        bump(&self.schedule_missed, entry, missed);
    }

    // ========== Real-time Metrics ==========

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn record_subscription_rejected(&self) {
        self.subscriptions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_delivered(&self, n: u64) {
        self.events_delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_events_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    // ========== Snapshot ==========

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut job_executions: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for entry in self.job_executions.iter() {
            let (job, outcome) = entry.key();
            job_executions
                .entry(job.clone())
                .or_default()
                .insert(outcome.clone(), entry.value().load(Ordering::Relaxed));
        }

        MetricsSnapshot {
            jobs_enqueued: collect(&self.jobs_enqueued),
            job_executions,
            job_retries: collect(&self.job_retries),
            dead_letters: collect(&self.dead_letters),
            queue_depth: collect(&self.queue_depth),
            job_latency: self
                .job_duration
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
            jobs_running: self.jobs_running.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
            schedule_fired: collect(&self.schedule_fired),
            schedule_missed: collect(&self.schedule_missed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            subscriptions_rejected: self.subscriptions_rejected.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of all metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: BTreeMap<String, u64>,
    /// job name → outcome → count
    pub job_executions: BTreeMap<String, BTreeMap<String, u64>>,
    pub job_retries: BTreeMap<String, u64>,
    pub dead_letters: BTreeMap<String, u64>,
    pub queue_depth: BTreeMap<String, u64>,
    pub job_latency: BTreeMap<String, HistogramSnapshot>,
    pub jobs_running: u64,
    pub broker_errors: u64,
    pub schedule_fired: BTreeMap<String, u64>,
    pub schedule_missed: BTreeMap<String, u64>,
    pub active_connections: u64,
    pub subscriptions_rejected: u64,
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_estimates_percentiles_from_buckets() {
        let h = LatencyHistogram::new();
        for _ in 0..90 {
            h.observe(Duration::from_millis(8));
        }
        for _ in 0..10 {
            h.observe(Duration::from_millis(400));
        }

        let snap = h.snapshot();
        assert_eq!(snap.count, 100);
        assert_eq!(snap.p50_ms, 10);
        assert_eq!(snap.p90_ms, 10);
        assert_eq!(snap.p99_ms, 400);
        assert_eq!(snap.max_ms, 400);
        assert_eq!(snap.sum_ms, 90 * 8 + 10 * 400);
    }

    #[test]
    fn overflow_bucket_reports_max_seen() {
        let h = LatencyHistogram::new();
        h.observe(Duration::from_secs(120));
        let snap = h.snapshot();
        assert_eq!(snap.p50_ms, 120_000);
        assert_eq!(*snap.bucket_counts.last().unwrap(), 1);
    }

    #[test]
    fn empty_histogram_is_zero() {
        let snap = LatencyHistogram::new().snapshot();
        assert_eq!((snap.p50_ms, snap.p99_ms, snap.count), (0, 0, 0));
    }

    #[test]
    fn collector_groups_executions_by_job_and_outcome() {
        let m = MetricsCollector::new();
        m.record_execution("send_notification", "success", Duration::from_millis(3));
        m.record_execution("send_notification", "retry", Duration::from_millis(5));
        m.record_execution("send_notification", "retry", Duration::from_millis(5));
        m.record_retry("send_notification");
        m.record_dead_letter("unknown_job");

        let snap = m.snapshot();
        assert_eq!(snap.job_executions["send_notification"]["retry"], 2);
        assert_eq!(snap.job_executions["send_notification"]["success"], 1);
        assert_eq!(snap.job_retries["send_notification"], 1);
        assert_eq!(snap.dead_letters["unknown_job"], 1);
        assert_eq!(snap.job_latency["send_notification"].count, 3);
    }

    #[test]
    fn gauges_never_underflow() {
        let m = MetricsCollector::new();
        m.connection_closed();
        m.job_finished();
        m.connection_opened();
        assert_eq!(m.active_connections(), 1);
        assert_eq!(m.snapshot().jobs_running, 0);
    }
}
