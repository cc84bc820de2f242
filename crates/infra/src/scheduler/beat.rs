//! Scheduler tick loop.
//!
//! Per entry and tick: take the lease, re-fire a pending intent left by a
//! crashed holder, skip due times older than the recovery window, then fire
//! every remaining due time in `(last_fired_at, now]` with the
//! intent/enqueue/commit protocol. Fire enqueues carry an idempotency key
//! derived from the due time, so re-firing after a crash is absorbed by
//! the broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use labflow_observability::MetricsCollector;

use super::store::ScheduleStore;
use super::{ScheduleEntry, ScheduleError};
use crate::jobs::{EnqueueOptions, JobClient, RegistryError};

#[derive(Debug, Clone)]
pub struct BeatConfig {
    pub tick_interval: Duration,
    /// Lease lifetime; a crashed holder blocks an entry at most this long.
    pub lease_ttl: Duration,
    /// Due times older than this are skipped instead of fired late.
    pub recovery_window: Duration,
    /// Lease holder identity. Unique per scheduler process.
    pub instance_id: String,
    /// Upper bound on fire times considered per entry per tick.
    pub max_fires_per_tick: usize,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(90),
            recovery_window: Duration::from_secs(3_600),
            instance_id: format!("beat-{}", uuid::Uuid::now_v7()),
            max_fires_per_tick: 1_000,
        }
    }
}

/// Summary of one tick across all entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Fire times enqueued as new jobs.
    pub fired: usize,
    /// Fire times whose enqueue matched an existing idempotency key.
    pub duplicates: usize,
    /// Due times skipped because they fell outside the recovery window.
    pub missed: usize,
    /// Entries whose lease is held by another instance.
    pub contended: usize,
    /// Entries that failed this tick and will be retried on the next one.
    pub failed: usize,
}

impl TickReport {
    fn merge(&mut self, other: TickReport) {
        self.fired += other.fired;
        self.duplicates += other.duplicates;
        self.missed += other.missed;
        self.contended += other.contended;
        self.failed += other.failed;
    }
}

pub struct Beat {
    store: Arc<dyn ScheduleStore>,
    client: JobClient,
    metrics: Arc<MetricsCollector>,
    config: BeatConfig,
}

impl core::fmt::Debug for Beat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Beat").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Beat {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        client: JobClient,
        metrics: Arc<MetricsCollector>,
        config: BeatConfig,
    ) -> Self {
        Self {
            store,
            client,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &BeatConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Register entries at startup. Fails fast when an entry targets a job
    /// the registry does not know or carries an invalid cron expression.
    pub async fn seed(&self, entries: impl IntoIterator<Item = ScheduleEntry>) -> Result<usize, SeedError> {
        let entries: Vec<ScheduleEntry> = entries.into_iter().collect();
        self.client
            .registry()
            .validate_targets(entries.iter().map(|e| e.target_job.as_str()))?;
        for entry in &entries {
            entry.cron()?;
        }
        let count = entries.len();
        for entry in entries {
            self.store.upsert_entry(entry).await?;
        }
        Ok(count)
    }

    /// Run one tick for every entry at `now`. Entry failures are logged and
    /// retried on the next tick; they never abort the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let entries = match self.store.load().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "failed to load schedule entries");
                report.failed += 1;
                return report;
            }
        };

        for entry in entries {
            match self.tick_entry(&entry.name, now).await {
                Ok(entry_report) => report.merge(entry_report),
                Err(e) => {
                    tracing::error!(entry = %entry.name, error = %e, "schedule entry tick failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Advance one entry under its lease.
    pub async fn tick_entry(&self, name: &str, now: DateTime<Utc>) -> Result<TickReport, ScheduleError> {
        let holder = self.config.instance_id.as_str();
        if !self
            .store
            .acquire_lease(name, holder, self.config.lease_ttl, now)
            .await?
        {
            tracing::debug!(entry = %name, "schedule entry leased by another instance");
            return Ok(TickReport {
                contended: 1,
                ..Default::default()
            });
        }

        let result = self.advance(name, now).await;
        if let Err(e) = self.store.release_lease(name, holder).await {
            tracing::warn!(entry = %name, error = %e, "failed to release schedule lease");
        }
        result
    }

    async fn advance(&self, name: &str, now: DateTime<Utc>) -> Result<TickReport, ScheduleError> {
        let holder = self.config.instance_id.as_str();
        let mut report = TickReport::default();

        let mut entry = self.load_entry(name).await?;
        let cron = entry.cron()?;

        if let Some(pending) = entry.pending_fire {
            tracing::info!(entry = %name, fire_at = %pending, "recovering interrupted fire");
            self.fire(&entry, pending, &mut report).await?;
            self.store.commit_fire(name, holder, pending).await?;
            entry = self.load_entry(name).await?;
        }

        let due = cron.fires_between(entry.watermark(), now, self.config.max_fires_per_tick);
        let cutoff = now - chrono::Duration::from_std(self.config.recovery_window).unwrap_or_default();
        let (missed, due): (Vec<_>, Vec<_>) = due.into_iter().partition(|t| *t < cutoff);

        if let Some(last_missed) = missed.last().copied() {
            tracing::warn!(
                entry = %name,
                missed = missed.len(),
                first = %missed[0],
                last = %last_missed,
                "skipping due times outside the recovery window"
            );
            self.metrics.record_schedule_missed(name, missed.len() as u64);
            self.store.commit_fire(name, holder, last_missed).await?;
            report.missed += missed.len();
        }

        for fire_at in due {
            self.store.begin_fire(name, holder, fire_at).await?;
            self.fire(&entry, fire_at, &mut report).await?;
            self.store.commit_fire(name, holder, fire_at).await?;
        }
        Ok(report)
    }

    async fn load_entry(&self, name: &str) -> Result<ScheduleEntry, ScheduleError> {
        self.store
            .get(name)
            .await?
            .ok_or_else(|| ScheduleError::UnknownEntry(name.to_string()))
    }

    async fn fire(
        &self,
        entry: &ScheduleEntry,
        fire_at: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), ScheduleError> {
        let mut options = EnqueueOptions::new().idempotency_key(entry.fire_key(fire_at));
        if let Some(queue) = entry.queue {
            options = options.queue(queue);
        }
        let ack = self
            .client
            .enqueue(&entry.target_job, entry.args_for(fire_at), options)
            .await?;

        if ack.duplicate {
            tracing::debug!(entry = %entry.name, fire_at = %fire_at, job_id = %ack.job_id, "fire already enqueued");
            report.duplicates += 1;
        } else {
            self.metrics.record_schedule_fired(&entry.name);
            tracing::info!(
                entry = %entry.name,
                job = %entry.target_job,
                fire_at = %fire_at,
                job_id = %ack.job_id,
                "schedule fired"
            );
            report.fired += 1;
        }
        Ok(())
    }

    /// Tick on `tick_interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> BeatHandle {
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        BeatHandle { cancel, join }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            instance = %self.config.instance_id,
            interval_ms = self.config.tick_interval.as_millis() as u64,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if report != TickReport::default() {
                        tracing::debug!(?report, "scheduler tick");
                    }
                }
            }
        }
        tracing::info!(instance = %self.config.instance_id, "scheduler stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Handle to a spawned [`Beat`].
#[derive(Debug)]
pub struct BeatHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl BeatHandle {
    /// Stop ticking and wait for the current tick to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}
