//! Worker pool: one dispatcher per queue class, each with its own slot
//! budget, so a backlog of heavy jobs cannot starve realtime delivery.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use labflow_core::JobId;
use labflow_observability::MetricsCollector;

use super::broker::{Broker, BrokerError, Lease, Leased};
use super::context::{JobContext, JobServices};
use super::error::JobError;
use super::execution_log::{ExecutionLog, ExecutionRecord};
use super::registry::TaskRegistry;
use super::supervisor::{Disposition, RetrySupervisor};
use super::types::{ExecutionOutcome, QueueClass, RetryPolicy};

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Concurrent execution slots per queue class. A class with 0 slots is
    /// not consumed by this process.
    pub concurrency: BTreeMap<QueueClass, usize>,
    /// Default per-attempt timeout; registrations may override it.
    pub job_timeout: Duration,
    /// Lease length. Running jobs renew their lease every third of it, so
    /// handler timeouts may exceed it.
    pub visibility_timeout: Duration,
    /// First idle poll delay after an empty dequeue.
    pub min_idle_poll: Duration,
    /// Idle poll delay ceiling.
    pub max_idle_poll: Duration,
    /// Backoff ceiling while the broker is unreachable.
    pub max_error_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: BTreeMap::from([
                (QueueClass::Default, 8),
                (QueueClass::Heavy, 2),
                (QueueClass::Realtime, 16),
                (QueueClass::Scheduled, 4),
            ]),
            job_timeout: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(120),
            min_idle_poll: Duration::from_millis(10),
            max_idle_poll: Duration::from_secs(1),
            max_error_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn slots(&self, queue: QueueClass) -> usize {
        self.concurrency.get(&queue).copied().unwrap_or(0)
    }

    pub fn with_slots(mut self, queue: QueueClass, slots: usize) -> Self {
        self.concurrency.insert(queue, slots);
        self
    }
}

/// A job currently executing in this process.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub job_id: JobId,
    pub name: String,
    pub queue: QueueClass,
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

/// Result of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub outcome: ExecutionOutcome,
    pub disposition: Option<Disposition>,
    pub duration: Duration,
}

pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    supervisor: Arc<RetrySupervisor>,
    services: JobServices,
    metrics: Arc<MetricsCollector>,
    log: Arc<ExecutionLog>,
    active: DashMap<JobId, ActiveJob>,
    config: WorkerPoolConfig,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    cancel: CancellationToken,
    dispatchers: JoinSet<()>,
}

impl WorkerPoolHandle {
    /// Stop dequeuing and wait for in-flight executions to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(res) = self.dispatchers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "dispatcher task failed");
            }
        }
    }
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<TaskRegistry>,
        supervisor: Arc<RetrySupervisor>,
        services: JobServices,
        metrics: Arc<MetricsCollector>,
        log: Arc<ExecutionLog>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            supervisor,
            services,
            metrics,
            log,
            active: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn execution_log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = self.active.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Spawn one dispatcher per queue class with a non-zero slot budget.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> WorkerPoolHandle {
        let mut dispatchers = JoinSet::new();
        for queue in QueueClass::ALL {
            let slots = self.config.slots(queue);
            if slots == 0 {
                continue;
            }
            let pool = Arc::clone(self);
            let token = cancel.clone();
            dispatchers.spawn(async move { pool.dispatch(queue, slots, token).await });
        }
        info!(concurrency = ?self.config.concurrency, "worker pool started");
        WorkerPoolHandle { cancel, dispatchers }
    }

    async fn dispatch(self: Arc<Self>, queue: QueueClass, slots: usize, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(slots));
        let mut executions = JoinSet::new();
        let mut idle = self.config.min_idle_poll;
        let mut error_backoff = self.config.min_idle_poll.max(Duration::from_millis(100));

        debug!(queue = %queue, slots, "dispatcher started");
        loop {
            while let Some(res) = executions.try_join_next() {
                if let Err(e) = res {
                    error!(queue = %queue, error = %e, "execution task failed");
                }
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dequeued = self.broker.dequeue(&[queue], self.config.visibility_timeout).await;
            self.refresh_depth(queue).await;
            match dequeued {
                Ok(Some(leased)) => {
                    idle = self.config.min_idle_poll;
                    error_backoff = self.config.min_idle_poll.max(Duration::from_millis(100));
                    let pool = Arc::clone(&self);
                    let token = cancel.child_token();
                    executions.spawn(async move {
                        let _permit = permit;
                        pool.execute(leased, &token).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                    idle = (idle * 2).min(self.config.max_idle_poll);
                }
                Err(e) => {
                    drop(permit);
                    self.metrics.record_broker_error();
                    warn!(
                        queue = %queue,
                        error = %e,
                        backoff_ms = error_backoff.as_millis() as u64,
                        "dequeue failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(error_backoff) => {}
                    }
                    error_backoff = (error_backoff * 2).min(self.config.max_error_backoff);
                }
            }
        }

        while let Some(res) = executions.join_next().await {
            if let Err(e) = res {
                error!(queue = %queue, error = %e, "execution task failed");
            }
        }
        debug!(queue = %queue, "dispatcher stopped");
    }

    async fn refresh_depth(&self, queue: QueueClass) {
        if let Ok(depth) = self.broker.depth(queue).await {
            self.metrics.set_queue_depth(queue.as_str(), depth.total() as u64);
        }
    }

    /// Dequeue and execute one envelope from `queue` inline.
    pub async fn run_next(&self, queue: QueueClass) -> Result<Option<ExecutionReport>, BrokerError> {
        let Some(leased) = self
            .broker
            .dequeue(&[queue], self.config.visibility_timeout)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(self.execute(leased, &CancellationToken::new()).await))
    }

    /// Execute one leased envelope and settle its lease.
    pub async fn execute(&self, leased: Leased, cancel: &CancellationToken) -> ExecutionReport {
        let Leased { envelope, lease } = leased;
        let started = Instant::now();
        let started_at = Utc::now();

        self.active.insert(
            envelope.id,
            ActiveJob {
                job_id: envelope.id,
                name: envelope.name.clone(),
                queue: envelope.queue,
                attempt: envelope.attempt,
                max_attempts: envelope.max_attempts,
                started_at,
                lease_expires_at: lease.expires_at,
            },
        );
        self.metrics.job_started();

        let (policy, result) = match self.registry.resolve(&envelope.name) {
            Err(_) => (
                RetryPolicy::no_retry(),
                Err(JobError::UnknownJob(envelope.name.clone())),
            ),
            Ok(entry) => {
                let timeout = entry.registration.timeout.unwrap_or(self.config.job_timeout);
                let ctx = JobContext::new(&envelope, self.services.clone(), cancel.clone());
                let run = AssertUnwindSafe(entry.handler.handle(ctx, envelope.args.clone())).catch_unwind();
                let result = match self.holding_lease(&lease, tokio::time::timeout(timeout, run)).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(JobError::Other(anyhow::anyhow!(
                        "handler panicked: {}",
                        panic_message(&panic)
                    ))),
                    Err(_) => Err(JobError::Timeout(timeout)),
                };
                (entry.registration.retry_policy.clone(), result)
            }
        };

        let duration = started.elapsed();
        let outcome = match &result {
            Ok(()) => ExecutionOutcome::Success,
            Err(JobError::UnknownJob(_)) => ExecutionOutcome::UnknownJob,
            Err(JobError::Timeout(_)) => ExecutionOutcome::Timeout,
            Err(e) if e.is_permanent() => ExecutionOutcome::PermanentFailure,
            Err(_) => ExecutionOutcome::TransientFailure,
        };

        self.metrics
            .record_execution(&envelope.name, outcome.as_str(), duration);
        self.log.record(ExecutionRecord {
            job_id: envelope.id,
            name: envelope.name.clone(),
            queue: envelope.queue,
            attempt: envelope.attempt,
            started_at,
            finished_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            outcome,
            error: result.as_ref().err().map(|e| e.to_string()),
        });

        let disposition = match &result {
            Ok(()) => {
                info!(
                    job_id = %envelope.id,
                    job = %envelope.name,
                    queue = %envelope.queue,
                    attempt = envelope.attempt,
                    duration_ms = duration.as_millis() as u64,
                    outcome = outcome.as_str(),
                    "job attempt finished"
                );
                self.ack(&lease).await;
                None
            }
            Err(e) => {
                warn!(
                    job_id = %envelope.id,
                    job = %envelope.name,
                    queue = %envelope.queue,
                    attempt = envelope.attempt,
                    duration_ms = duration.as_millis() as u64,
                    outcome = outcome.as_str(),
                    error = %e,
                    "job attempt failed"
                );
                match self.supervisor.on_failure(&envelope, &policy, e).await {
                    Ok(disposition) => {
                        self.ack(&lease).await;
                        Some(disposition)
                    }
                    Err(err) => {
                        // Leave the lease to expire so the broker redelivers
                        // this attempt instead of losing it.
                        error!(
                            job_id = %envelope.id,
                            job = %envelope.name,
                            error = %err,
                            "failure routing failed, awaiting redelivery"
                        );
                        None
                    }
                }
            }
        };

        self.active.remove(&envelope.id);
        self.metrics.job_finished();

        ExecutionReport {
            job_id: envelope.id,
            outcome,
            disposition,
            duration,
        }
    }

    /// Drive `work` while renewing `lease` so no other consumer is handed
    /// the same envelope mid-run.
    async fn holding_lease<F: std::future::Future>(&self, lease: &Lease, work: F) -> F::Output {
        let period = (self.config.visibility_timeout / 3).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut renewing = true;
        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = renew.tick(), if renewing => {
                    match self.broker.extend(lease, self.config.visibility_timeout).await {
                        Ok(expires_at) => {
                            if let Some(mut active) = self.active.get_mut(&lease.job_id) {
                                active.lease_expires_at = expires_at;
                            }
                            debug!(job_id = %lease.job_id, %expires_at, "lease renewed");
                        }
                        Err(BrokerError::LeaseNotFound(job_id)) => {
                            renewing = false;
                            warn!(job_id = %job_id, "lease lost while running; job may run again");
                        }
                        Err(e) => {
                            self.metrics.record_broker_error();
                            warn!(job_id = %lease.job_id, error = %e, "lease renewal failed");
                        }
                    }
                }
            }
        }
    }

    async fn ack(&self, lease: &Lease) {
        match self.broker.ack(lease).await {
            Ok(()) => {}
            Err(BrokerError::LeaseNotFound(job_id)) => {
                warn!(job_id = %job_id, "lease expired before settlement; job may run again");
            }
            Err(e) => {
                self.metrics.record_broker_error();
                error!(job_id = %lease.job_id, error = %e, "lease settlement failed");
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDataStore;
    use crate::jobs::broker::InMemoryBroker;
    use crate::jobs::client::JobClient;
    use crate::jobs::dead_letter::{DeadLetterCode, DeadLetterStore, InMemoryDeadLetterStore};
    use crate::jobs::registry::HandlerRegistration;
    use crate::jobs::types::{EnqueueOptions, JobEnvelope};
    use crate::notifier::InMemoryNotifier;
    use labflow_events::InMemoryEventSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        pool: Arc<WorkerPool>,
        client: JobClient,
        broker: Arc<InMemoryBroker>,
        dead: Arc<InMemoryDeadLetterStore>,
        metrics: Arc<MetricsCollector>,
    }

    fn harness(registry: TaskRegistry, config: WorkerPoolConfig) -> Harness {
        let broker = Arc::new(InMemoryBroker::default());
        let dead = Arc::new(InMemoryDeadLetterStore::new());
        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(registry);
        let supervisor = Arc::new(RetrySupervisor::new(
            broker.clone(),
            dead.clone(),
            metrics.clone(),
            Duration::from_secs(300),
        ));
        let services = JobServices {
            data: Arc::new(InMemoryDataStore::new()),
            notifier: Arc::new(InMemoryNotifier::new()),
            events: Arc::new(InMemoryEventSink::new()),
            dead_letters: dead.clone(),
        };
        let pool = Arc::new(WorkerPool::new(
            broker.clone(),
            registry.clone(),
            supervisor,
            services,
            metrics.clone(),
            Arc::new(ExecutionLog::default()),
            config,
        ));
        let client = JobClient::new(broker.clone(), registry, metrics.clone());
        Harness {
            pool,
            client,
            broker,
            dead,
            metrics,
        }
    }

    #[tokio::test]
    async fn unknown_jobs_are_dead_lettered() {
        let h = harness(TaskRegistry::default(), WorkerPoolConfig::default());
        let env = JobEnvelope::new("renamed_in_v2", serde_json::json!({}));
        h.client.enqueue_envelope(env.clone()).await.unwrap();

        let report = h.pool.run_next(QueueClass::Default).await.unwrap().unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::UnknownJob);

        let record = h.dead.get(env.id).await.unwrap().unwrap();
        assert_eq!(record.error.code, DeadLetterCode::UnknownJob);
        assert!(h.broker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_transient_then_dead_lettered() {
        let registry = TaskRegistry::builder()
            .register_fn(
                HandlerRegistration::new("stuck")
                    .timeout(Duration::from_millis(50))
                    .retry_policy(RetryPolicy::fixed(2, Duration::from_millis(10))),
                |_, _| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                },
            )
            .build()
            .unwrap();
        let h = harness(registry, WorkerPoolConfig::default());
        let ack = h
            .client
            .enqueue("stuck", serde_json::Value::Null, EnqueueOptions::new())
            .await
            .unwrap();

        let first = h.pool.run_next(QueueClass::Default).await.unwrap().unwrap();
        assert_eq!(first.outcome, ExecutionOutcome::Timeout);
        assert!(matches!(first.disposition, Some(Disposition::Retry { attempt: 1, .. })));

        tokio::time::advance(Duration::from_millis(20)).await;
        let second = h.pool.run_next(QueueClass::Default).await.unwrap().unwrap();
        assert_eq!(second.outcome, ExecutionOutcome::Timeout);

        let record = h.dead.get(ack.job_id).await.unwrap().unwrap();
        assert_eq!(record.error.code, DeadLetterCode::Timeout);
        assert_eq!(record.envelope.attempt, 1);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let registry = TaskRegistry::builder()
            .register_fn(
                HandlerRegistration::new("boom").retry_policy(RetryPolicy::no_retry()),
                |_, _| async {
                    if true {
                        panic!("bad invariant");
                    }
                    Ok(())
                },
            )
            .build()
            .unwrap();
        let h = harness(registry, WorkerPoolConfig::default());
        h.client
            .enqueue("boom", serde_json::Value::Null, EnqueueOptions::new())
            .await
            .unwrap();

        let report = h.pool.run_next(QueueClass::Default).await.unwrap().unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::TransientFailure);
        assert_eq!(h.dead.count().await.unwrap(), 1);
        assert!(h.pool.active_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heavy_backlog_does_not_block_realtime() {
        let heavy_runs = Arc::new(AtomicU32::new(0));
        let realtime_runs = Arc::new(AtomicU32::new(0));
        let heavy = heavy_runs.clone();
        let realtime = realtime_runs.clone();
        let registry = TaskRegistry::builder()
            .register_fn(
                HandlerRegistration::new("crunch")
                    .queue(QueueClass::Heavy)
                    .timeout(Duration::from_secs(600)),
                move |_, _| {
                    let heavy = heavy.clone();
                    async move {
                        heavy.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }
                },
            )
            .register_fn(
                HandlerRegistration::new("ping").queue(QueueClass::Realtime),
                move |_, _| {
                    let realtime = realtime.clone();
                    async move {
                        realtime.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .build()
            .unwrap();
        let config = WorkerPoolConfig::default().with_slots(QueueClass::Heavy, 1);
        let h = harness(registry, config);

        for _ in 0..5 {
            h.client
                .enqueue("crunch", serde_json::Value::Null, EnqueueOptions::new())
                .await
                .unwrap();
        }
        for _ in 0..20 {
            h.client
                .enqueue("ping", serde_json::Value::Null, EnqueueOptions::new())
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let handle = h.pool.start(cancel.clone());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(realtime_runs.load(Ordering::SeqCst), 20);
        assert_eq!(heavy_runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.pool.active_jobs().len(), 1);

        cancel.cancel();
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_outliving_the_visibility_timeout_run_once() {
        let runs = Arc::new(AtomicU32::new(0));
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (r, cur, pk) = (runs.clone(), running.clone(), peak.clone());
        let registry = TaskRegistry::builder()
            .register_fn(
                HandlerRegistration::new("render")
                    .queue(QueueClass::Heavy)
                    .timeout(Duration::from_secs(300)),
                move |_, _| {
                    let (r, cur, pk) = (r.clone(), cur.clone(), pk.clone());
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                        pk.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(200)).await;
                        cur.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .build()
            .unwrap();
        let h = harness(registry, WorkerPoolConfig::default());
        h.client
            .enqueue("render", serde_json::Value::Null, EnqueueOptions::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = h.pool.start(cancel.clone());
        tokio::time::sleep(Duration::from_secs(400)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(h.broker.is_empty());

        cancel.cancel();
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queue_depth_gauge_tracks_a_busy_queue() {
        let registry = TaskRegistry::builder()
            .register_fn(
                HandlerRegistration::new("crunch")
                    .queue(QueueClass::Heavy)
                    .timeout(Duration::from_secs(600)),
                |_, _| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
            )
            .build()
            .unwrap();
        let config = WorkerPoolConfig::default().with_slots(QueueClass::Heavy, 1);
        let h = harness(registry, config);
        for _ in 0..3 {
            h.client
                .enqueue("crunch", serde_json::Value::Null, EnqueueOptions::new())
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let handle = h.pool.start(cancel.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Never idle, yet the gauge reports two waiting plus one leased.
        let depth = h.broker.depth(QueueClass::Heavy).await.unwrap();
        assert_eq!(depth.total(), 3);
        assert_eq!(h.metrics.snapshot().queue_depth.get("heavy"), Some(&3));

        cancel.cancel();
        handle.shutdown().await;
    }
}
