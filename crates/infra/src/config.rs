//! Process configuration read from `LABFLOW_*` environment variables.
//!
//! Every value has a default; a variable that is set but malformed is an
//! error naming the variable rather than a silent fallback.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::jobs::{QueueClass, WorkerPoolConfig};
use crate::scheduler::BeatConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is malformed ({value:?}): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Per-queue slots and worker timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: BTreeMap<QueueClass, usize>,
    pub job_timeout: Duration,
    pub visibility_timeout: Duration,
    pub min_idle_poll: Duration,
    pub max_idle_poll: Duration,
    pub max_error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let pool = WorkerPoolConfig::default();
        Self {
            concurrency: pool.concurrency,
            job_timeout: pool.job_timeout,
            visibility_timeout: pool.visibility_timeout,
            min_idle_poll: pool.min_idle_poll,
            max_idle_poll: pool.max_idle_poll,
            max_error_backoff: pool.max_error_backoff,
        }
    }
}

impl WorkerConfig {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.concurrency.clone(),
            job_timeout: self.job_timeout,
            visibility_timeout: self.visibility_timeout,
            min_idle_poll: self.min_idle_poll,
            max_idle_poll: self.max_idle_poll,
            max_error_backoff: self.max_error_backoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Upper bound on any retry delay, whatever the handler's policy says.
    pub delay_ceiling: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_ceiling: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval: Duration,
    pub lease_ttl: Duration,
    pub recovery_window: Duration,
    /// Durable schedule state; `None` keeps it in memory.
    pub state_file: Option<PathBuf>,
    pub instance_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let beat = BeatConfig::default();
        Self {
            enabled: true,
            tick_interval: beat.tick_interval,
            lease_ttl: beat.lease_ttl,
            recovery_window: beat.recovery_window,
            state_file: None,
            instance_id: beat.instance_id,
        }
    }
}

impl SchedulerConfig {
    pub fn beat_config(&self) -> BeatConfig {
        BeatConfig {
            tick_interval: self.tick_interval,
            lease_ttl: self.lease_ttl,
            recovery_window: self.recovery_window,
            instance_id: self.instance_id.clone(),
            ..BeatConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Publisher to broadcaster channel.
    pub channel_capacity: usize,
    /// Frames buffered per session before the oldest are dropped.
    pub outbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4_096,
            outbox_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// HS256 secret for bearer tokens; `None` means a development secret.
    pub jwt_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            jwt_secret: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Memory,
    Redis,
}

impl FromStr for BrokerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown broker backend `{other}` (expected memory or redis)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub redis_url: String,
    /// How long a completed job's idempotency key keeps deduplicating.
    pub idempotency_retention: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            idempotency_retention: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub workers: WorkerConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub bus: BusConfig,
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    /// Human-readable logs instead of JSON.
    pub pretty_logs: bool,
}

impl EngineConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = EngineConfig::default();

        let w = &mut config.workers;
        for (queue, var) in [
            (QueueClass::Default, "LABFLOW_WORKERS_DEFAULT"),
            (QueueClass::Heavy, "LABFLOW_WORKERS_HEAVY"),
            (QueueClass::Realtime, "LABFLOW_WORKERS_REALTIME"),
            (QueueClass::Scheduled, "LABFLOW_WORKERS_SCHEDULED"),
        ] {
            if let Some(slots) = env.parse::<usize>(var)? {
                w.concurrency.insert(queue, slots);
            }
        }
        env.secs("LABFLOW_JOB_TIMEOUT_SECS", &mut w.job_timeout)?;
        env.secs("LABFLOW_VISIBILITY_TIMEOUT_SECS", &mut w.visibility_timeout)?;
        env.millis("LABFLOW_MIN_IDLE_POLL_MS", &mut w.min_idle_poll)?;
        env.millis("LABFLOW_MAX_IDLE_POLL_MS", &mut w.max_idle_poll)?;
        env.secs("LABFLOW_MAX_ERROR_BACKOFF_SECS", &mut w.max_error_backoff)?;
        if w.min_idle_poll > w.max_idle_poll {
            return Err(ConfigError::invalid(
                "LABFLOW_MIN_IDLE_POLL_MS",
                &w.min_idle_poll.as_millis().to_string(),
                "must not exceed LABFLOW_MAX_IDLE_POLL_MS",
            ));
        }

        env.secs("LABFLOW_RETRY_CEILING_SECS", &mut config.retry.delay_ceiling)?;

        let s = &mut config.scheduler;
        if let Some(enabled) = env.parse::<bool>("LABFLOW_SCHEDULER_ENABLED")? {
            s.enabled = enabled;
        }
        env.secs("LABFLOW_SCHEDULER_TICK_SECS", &mut s.tick_interval)?;
        env.secs("LABFLOW_SCHEDULER_LEASE_TTL_SECS", &mut s.lease_ttl)?;
        env.secs("LABFLOW_SCHEDULER_RECOVERY_WINDOW_SECS", &mut s.recovery_window)?;
        if let Some(path) = env.get("LABFLOW_SCHEDULER_STATE_FILE") {
            s.state_file = Some(PathBuf::from(path));
        }
        s.instance_id = env
            .get("LABFLOW_INSTANCE_ID")
            .unwrap_or_else(|| format!("beat-{}", Uuid::now_v7()));
        if s.tick_interval.is_zero() {
            return Err(ConfigError::invalid("LABFLOW_SCHEDULER_TICK_SECS", "0", "must be positive"));
        }
        if s.lease_ttl <= s.tick_interval {
            return Err(ConfigError::invalid(
                "LABFLOW_SCHEDULER_LEASE_TTL_SECS",
                &s.lease_ttl.as_secs().to_string(),
                "must exceed the tick interval",
            ));
        }

        if let Some(capacity) = env.positive("LABFLOW_BUS_CHANNEL_CAPACITY")? {
            config.bus.channel_capacity = capacity;
        }
        if let Some(capacity) = env.positive("LABFLOW_OUTBOX_CAPACITY")? {
            config.bus.outbox_capacity = capacity;
        }

        if let Some(addr) = env.parse::<SocketAddr>("LABFLOW_BIND_ADDR")? {
            config.server.bind_addr = addr;
        }
        config.server.jwt_secret = env.get("LABFLOW_JWT_SECRET");

        if let Some(backend) = env.parse::<BrokerBackend>("LABFLOW_BROKER")? {
            config.broker.backend = backend;
        }
        if let Some(url) = env.get("LABFLOW_REDIS_URL") {
            config.broker.redis_url = url;
        }
        env.secs(
            "LABFLOW_IDEMPOTENCY_RETENTION_SECS",
            &mut config.broker.idempotency_retention,
        )?;

        if let Some(format) = env.get("LABFLOW_LOG_FORMAT") {
            config.pretty_logs = match format.as_str() {
                "json" => false,
                "pretty" | "text" => true,
                other => {
                    return Err(ConfigError::invalid(
                        "LABFLOW_LOG_FORMAT",
                        other,
                        "expected json or pretty",
                    ));
                }
            };
        }

        Ok(config)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank variables both mean "use the default".
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(var, &raw, e.to_string())),
        }
    }

    fn positive(&self, var: &'static str) -> Result<Option<usize>, ConfigError> {
        match self.parse::<usize>(var)? {
            Some(0) => Err(ConfigError::invalid(var, "0", "must be positive")),
            other => Ok(other),
        }
    }

    fn secs(&self, var: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(secs) = self.parse::<u64>(var)? {
            *slot = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn millis(&self, var: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(ms) = self.parse::<u64>(var)? {
            *slot = Duration::from_millis(ms);
        }
        Ok(())
    }
}
