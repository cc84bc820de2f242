//! Prometheus metrics exporter.
//!
//! Exports metrics in Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use crate::metrics::{LATENCY_BUCKETS_MS, MetricsCollector};

/// Prometheus metrics exporter.
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self {
            collector,
            namespace: "labflow".to_string(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let s = self.collector.snapshot();
        let mut out = String::new();

        self.labeled(
            &mut out,
            "jobs_enqueued_total",
            "Jobs accepted by the broker",
            "counter",
            "queue",
            &s.jobs_enqueued,
        );
        self.header(&mut out, "job_executions_total", "Job execution attempts by outcome", "counter");
        for (job, outcomes) in &s.job_executions {
            for (outcome, n) in outcomes {
                self.sample(&mut out, "job_executions_total", &[("job", job), ("outcome", outcome)], *n);
            }
        }
        self.labeled(&mut out, "job_retries_total", "Retries scheduled per job", "counter", "job", &s.job_retries);
        self.labeled(
            &mut out,
            "dead_letters_total",
            "Jobs moved to the dead-letter store",
            "counter",
            "code",
            &s.dead_letters,
        );
        self.labeled(
            &mut out,
            "queue_depth",
            "Envelopes held per queue: visible, delayed and leased",
            "gauge",
            "queue",
            &s.queue_depth,
        );

        self.header(&mut out, "job_duration_ms", "Job execution latency", "histogram");
        for (job, h) in &s.job_latency {
            let mut cumulative = 0u64;
            for (idx, n) in h.bucket_counts.iter().enumerate() {
                cumulative += n;
                let le = LATENCY_BUCKETS_MS
                    .get(idx)
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "+Inf".to_string());
                self.sample(&mut out, "job_duration_ms_bucket", &[("job", job), ("le", &le)], cumulative);
            }
            self.sample(&mut out, "job_duration_ms_sum", &[("job", job)], h.sum_ms);
            self.sample(&mut out, "job_duration_ms_count", &[("job", job)], h.count);
        }

        self.labeled(
            &mut out,
            "schedule_fired_total",
            "Scheduler fires per entry",
            "counter",
            "entry",
            &s.schedule_fired,
        );
        self.labeled(
            &mut out,
            "schedule_missed_total",
            "Due ticks outside the recovery window",
            "counter",
            "entry",
            &s.schedule_missed,
        );

        for (name, help, kind, value) in [
            ("jobs_running", "Jobs currently executing", "gauge", s.jobs_running),
            ("broker_errors_total", "Broker call failures", "counter", s.broker_errors),
            ("active_connections", "Live real-time sessions", "gauge", s.active_connections),
            (
                "subscriptions_rejected_total",
                "Subscribe requests denied by authorization",
                "counter",
                s.subscriptions_rejected,
            ),
            ("events_published_total", "Events accepted by the bus", "counter", s.events_published),
            ("events_delivered_total", "Event frames queued to sessions", "counter", s.events_delivered),
            (
                "events_dropped_total",
                "Events dropped by full inbound channel or outbox overflow",
                "counter",
                s.events_dropped,
            ),
        ] {
            self.header(&mut out, name, help, kind);
            self.sample(&mut out, name, &[], value);
        }

        out
    }

    fn header(&self, out: &mut String, name: &str, help: &str, kind: &str) {
        let _ = writeln!(out, "# HELP {}_{} {}", self.namespace, name, help);
        let _ = writeln!(out, "# TYPE {}_{} {}", self.namespace, name, kind);
    }

    /// One family with a single label dimension.
    fn labeled(
        &self,
        out: &mut String,
        name: &str,
        help: &str,
        kind: &str,
        label: &str,
        values: &BTreeMap<String, u64>,
    ) {
        self.header(out, name, help, kind);
        for (key, n) in values {
            self.sample(out, name, &[(label, key)], *n);
        }
    }

    fn sample(&self, out: &mut String, name: &str, labels: &[(&str, &str)], value: u64) {
        let _ = write!(out, "{}_{}", self.namespace, name);
        if !labels.is_empty() {
            let rendered: Vec<String> = labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                .collect();
            let _ = write!(out, "{{{}}}", rendered.join(","));
        }
        let _ = writeln!(out, " {}", value);
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
