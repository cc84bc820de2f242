//! Core job types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use labflow_core::{DomainError, JobId};

/// Queue class. Each class gets its own concurrency budget so a slow heavy
/// job cannot starve realtime delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    Default,
    Heavy,
    Realtime,
    Scheduled,
}

impl QueueClass {
    pub const ALL: [QueueClass; 4] = [
        QueueClass::Default,
        QueueClass::Heavy,
        QueueClass::Realtime,
        QueueClass::Scheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Default => "default",
            QueueClass::Heavy => "heavy",
            QueueClass::Realtime => "realtime",
            QueueClass::Scheduled => "scheduled",
        }
    }
}

impl Default for QueueClass {
    fn default() -> Self {
        Self::Default
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueClass {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueClass::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown queue '{s}'")))
    }
}

/// Retry policy configuration.
///
/// `attempt` is the number of executions that already failed (0 for the
/// first run). The delay before the retry that follows failed attempt `n`
/// is `base_delay * backoff_multiplier^n + U[0, jitter]`, capped at
/// `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the uniformly random extra delay.
    pub jitter: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(250),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// A single execution, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            backoff_multiplier: 1.0,
            jitter: Duration::ZERO,
            max_delay: delay,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Deterministic part of the delay after failed attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let exp = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Full delay including jitter, capped at `max_delay` and `ceiling`.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, ceiling: Duration, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (self.backoff(attempt) + jitter).min(self.max_delay).min(ceiling)
    }

    /// Check if another execution is allowed after failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}

/// Immutable description of one unit of work.
///
/// Only `attempt` changes across retries, and only by producing a new
/// envelope through [`JobEnvelope::next_attempt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub name: String,
    pub args: JsonValue,
    pub queue: QueueClass,
    pub priority: i32,
    pub max_attempts: u32,
    pub attempt: u32,
    pub idempotency_key: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    pub fn new(name: impl Into<String>, args: JsonValue) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            args,
            queue: QueueClass::Default,
            priority: 0,
            max_attempts: RetryPolicy::default().max_attempts,
            attempt: 0,
            idempotency_key: None,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    pub fn with_queue(mut self, queue: QueueClass) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Delay visibility relative to now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.not_before = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Remaining delay before the envelope becomes visible.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Duration {
        self.not_before
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    pub fn can_retry(&self) -> bool {
        self.attempt.saturating_add(1) < self.max_attempts
    }

    /// Retry instance: same id and idempotency key, `attempt + 1`, visible
    /// after `delay`. `None` once retries are exhausted.
    pub fn next_attempt(&self, delay: Duration) -> Option<JobEnvelope> {
        if !self.can_retry() {
            return None;
        }
        let now = Utc::now();
        Some(JobEnvelope {
            attempt: self.attempt + 1,
            enqueued_at: now,
            not_before: Some(now + chrono::Duration::from_std(delay).unwrap_or_default()),
            ..self.clone()
        })
    }

    /// Fresh instance for operator replay: attempts reset, immediately visible.
    pub fn replayed(&self) -> JobEnvelope {
        JobEnvelope {
            attempt: 0,
            enqueued_at: Utc::now(),
            not_before: None,
            ..self.clone()
        }
    }
}

/// Per-call overrides for the Enqueue API. Unset values come from the
/// handler registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub queue: Option<QueueClass>,
    pub priority: Option<i32>,
    pub delay: Option<Duration>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: QueueClass) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Receipt for an accepted enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckHandle {
    pub job_id: JobId,
    /// True when an idempotency key matched an existing job and nothing new
    /// was enqueued.
    pub duplicate: bool,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
    Timeout,
    UnknownJob,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::TransientFailure => "transient_failure",
            ExecutionOutcome::PermanentFailure => "permanent_failure",
            ExecutionOutcome::Timeout => "timeout",
            ExecutionOutcome::UnknownJob => "unknown_job",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(Duration::ZERO);

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(30), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn retry_envelope_keeps_identity() {
        let env = JobEnvelope::new("send_notification", serde_json::json!({}))
            .with_max_attempts(2)
            .with_idempotency_key("n-1");

        let retry = env.next_attempt(Duration::from_secs(1)).unwrap();
        assert_eq!(retry.id, env.id);
        assert_eq!(retry.idempotency_key, env.idempotency_key);
        assert_eq!(retry.attempt, 1);
        assert!(retry.not_before.is_some());
        assert!(retry.next_attempt(Duration::from_secs(1)).is_none());

        let replay = retry.replayed();
        assert_eq!(replay.attempt, 0);
        assert_eq!(replay.id, env.id);
        assert!(replay.not_before.is_none());
    }

    #[test]
    fn queue_names_round_trip() {
        for queue in QueueClass::ALL {
            assert_eq!(queue.as_str().parse::<QueueClass>().unwrap(), queue);
        }
        assert!("bulk".parse::<QueueClass>().is_err());
    }

    proptest::proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..5_000,
            multiplier in 1.0f64..4.0,
            cap_ms in 1u64..600_000,
            jitter_ms in 0u64..2_000,
            attempt in 0u32..40,
            seed in proptest::prelude::any::<u64>(),
        ) {
            let policy = RetryPolicy {
                max_attempts: 50,
                base_delay: Duration::from_millis(base_ms),
                backoff_multiplier: multiplier,
                jitter: Duration::from_millis(jitter_ms),
                max_delay: Duration::from_millis(cap_ms),
            };
            proptest::prop_assert!(policy.backoff(attempt) <= policy.backoff(attempt + 1));

            let mut rng = StdRng::seed_from_u64(seed);
            let delay = policy.delay_for_attempt(attempt, Duration::from_secs(3600), &mut rng);
            proptest::prop_assert!(delay <= Duration::from_millis(cap_ms));
            proptest::prop_assert!(delay >= policy.backoff(attempt).min(Duration::from_millis(cap_ms)));
        }

        #[test]
        fn attempt_never_reaches_max_attempts(max_attempts in 1u32..20) {
            let mut env = JobEnvelope::new("job", serde_json::Value::Null).with_max_attempts(max_attempts);
            let mut executions = 1;
            while let Some(next) = env.next_attempt(Duration::ZERO) {
                proptest::prop_assert!(next.attempt > env.attempt);
                env = next;
                executions += 1;
            }
            proptest::prop_assert!(env.attempt < max_attempts);
            proptest::prop_assert_eq!(executions, max_attempts);
        }
    }
}
