//! Engine wiring: broker, registry, workers, scheduler and the real-time layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use labflow_auth::{Hs256IdentityVerifier, IdentityVerifier, InMemoryResourceDirectory, ScopeAuthorizer};
use labflow_events::{Broadcaster, BroadcasterHandle, EventBus, SessionManager};
use labflow_infra::config::{BrokerBackend, BrokerConfig, EngineConfig};
use labflow_infra::datastore::{DataStore, InMemoryDataStore};
use labflow_infra::handlers;
use labflow_infra::jobs::{
    Broker, BrokerError, DeadLetterStore, ExecutionLog, InMemoryBroker, InMemoryDeadLetterStore,
    JobClient, JobServices, QueueClass, QueueDepth, RetrySupervisor, TaskRegistry, WorkerPool,
    WorkerPoolHandle,
};
use labflow_infra::notifier::LogNotifier;
use labflow_infra::scheduler::{Beat, BeatHandle, FileScheduleStore, InMemoryScheduleStore, ScheduleStore};
use labflow_observability::MetricsCollector;

/// Everything the HTTP layer and the background tasks share.
pub struct AppServices {
    pub config: EngineConfig,
    pub metrics: Arc<MetricsCollector>,
    pub broker: Arc<dyn Broker>,
    pub registry: Arc<TaskRegistry>,
    pub client: JobClient,
    pub supervisor: Arc<RetrySupervisor>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub execution_log: Arc<ExecutionLog>,
    pub pool: Arc<WorkerPool>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub beat: Arc<Beat>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub directory: Arc<InMemoryResourceDirectory>,
    pub sessions: Arc<SessionManager>,
    pub events: EventBus,
    pub data: Arc<dyn DataStore>,
    cancel: CancellationToken,
    background: Mutex<Background>,
}

#[derive(Default)]
struct Background {
    broadcaster: Option<BroadcasterHandle>,
    pool: Option<WorkerPoolHandle>,
    beat: Option<BeatHandle>,
}

impl core::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppServices")
            .field("broker", &self.config.broker.backend)
            .field("handlers", &self.registry.len())
            .field("sessions", &self.sessions.connection_count())
            .finish_non_exhaustive()
    }
}

impl AppServices {
    /// Wire the engine with an HS256 verifier built from the configured secret.
    pub async fn build(config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        let secret = config.server.jwt_secret.clone().unwrap_or_else(|| {
            tracing::warn!("LABFLOW_JWT_SECRET not set; using insecure dev default");
            "dev-secret".to_string()
        });
        let verifier: Arc<dyn IdentityVerifier> = Arc::new(Hs256IdentityVerifier::new(secret));
        Self::build_with_verifier(config, verifier).await
    }

    /// Wire the engine and start the broadcaster. Workers and the scheduler
    /// start separately through [`AppServices::start`].
    pub async fn build_with_verifier(
        config: EngineConfig,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> anyhow::Result<Arc<Self>> {
        let metrics = Arc::new(MetricsCollector::new());
        let cancel = CancellationToken::new();

        let directory = Arc::new(InMemoryResourceDirectory::new());
        let sessions = Arc::new(SessionManager::new(
            verifier.clone(),
            ScopeAuthorizer::new(directory.clone()),
            metrics.clone(),
            config.bus.outbox_capacity,
        ));
        let (events, broadcaster) = Broadcaster::new(sessions.clone(), metrics.clone())
            .spawn(config.bus.channel_capacity, cancel.child_token());

        let broker = build_broker(&config.broker).await?;
        let registry = Arc::new(handlers::register_all(TaskRegistry::builder()).build()?);
        let client = JobClient::new(broker.clone(), registry.clone(), metrics.clone());

        let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(InMemoryDeadLetterStore::new());
        let supervisor = Arc::new(RetrySupervisor::new(
            broker.clone(),
            dead_letters.clone(),
            metrics.clone(),
            config.retry.delay_ceiling,
        ));

        let data: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let job_services = JobServices {
            data: data.clone(),
            notifier: Arc::new(LogNotifier),
            events: Arc::new(events.clone()),
            dead_letters: dead_letters.clone(),
        };
        let execution_log = Arc::new(ExecutionLog::default());
        let pool = Arc::new(WorkerPool::new(
            broker.clone(),
            registry.clone(),
            supervisor.clone(),
            job_services,
            metrics.clone(),
            execution_log.clone(),
            config.workers.pool_config(),
        ));

        let schedules: Arc<dyn ScheduleStore> = match &config.scheduler.state_file {
            Some(path) => Arc::new(FileScheduleStore::open(path).await?),
            None => Arc::new(InMemoryScheduleStore::new()),
        };
        let beat = Arc::new(Beat::new(
            schedules.clone(),
            client.clone(),
            metrics.clone(),
            config.scheduler.beat_config(),
        ));

        tracing::info!(
            broker = ?config.broker.backend,
            handlers = registry.len(),
            instance_id = %config.scheduler.instance_id,
            "engine wired"
        );

        Ok(Arc::new(Self {
            config,
            metrics,
            broker,
            registry,
            client,
            supervisor,
            dead_letters,
            execution_log,
            pool,
            schedules,
            beat,
            verifier,
            directory,
            sessions,
            events,
            data,
            cancel,
            background: Mutex::new(Background {
                broadcaster: Some(broadcaster),
                ..Background::default()
            }),
        }))
    }

    /// Seed the built-in schedules, then start workers and (if enabled) the
    /// scheduler. Calling it twice is a no-op.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.config.scheduler.enabled {
            let seeded = self.beat.seed(handlers::default_schedules()).await?;
            tracing::info!(entries = seeded, "schedules seeded");
        }

        let mut background = self.background.lock();
        if background.pool.is_none() {
            background.pool = Some(self.pool.start(self.cancel.child_token()));
        }
        if self.config.scheduler.enabled && background.beat.is_none() {
            background.beat = Some(self.beat.clone().spawn(self.cancel.child_token()));
        }
        Ok(())
    }

    /// Stop background tasks and close every real-time session.
    pub async fn shutdown(&self) {
        let background = std::mem::take(&mut *self.background.lock());
        self.cancel.cancel();
        if let Some(beat) = background.beat {
            beat.shutdown().await;
        }
        if let Some(pool) = background.pool {
            pool.shutdown().await;
        }
        let closed = self.sessions.close_all();
        if let Some(broadcaster) = background.broadcaster {
            broadcaster.shutdown().await;
        }
        tracing::info!(sessions_closed = closed, "engine stopped");
    }

    /// Current depth per queue; also refreshes the `queue_depth` gauge.
    pub async fn queue_depths(&self) -> Result<BTreeMap<QueueClass, QueueDepth>, BrokerError> {
        let mut depths = BTreeMap::new();
        for queue in QueueClass::ALL {
            let depth = self.broker.depth(queue).await?;
            self.metrics.set_queue_depth(queue.as_str(), depth.total() as u64);
            depths.insert(queue, depth);
        }
        Ok(depths)
    }
}

async fn build_broker(config: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.backend {
        BrokerBackend::Memory => Ok(Arc::new(InMemoryBroker::new(config.idempotency_retention))),
        #[cfg(feature = "redis")]
        BrokerBackend::Redis => {
            let broker =
                labflow_infra::jobs::RedisBroker::connect(&config.redis_url, config.idempotency_retention)
                    .await?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "redis"))]
        BrokerBackend::Redis => anyhow::bail!("LABFLOW_BROKER=redis requires the `redis` feature"),
    }
}
