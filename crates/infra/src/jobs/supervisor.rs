//! Retry/backoff supervisor.
//!
//! Decides what happens to a failed attempt: re-enqueue a retry instance
//! with exponential backoff, or write a dead-letter record. Also owns the
//! operator replay path.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use labflow_core::JobId;
use labflow_observability::MetricsCollector;

use super::broker::{Broker, BrokerError};
use super::dead_letter::{DeadLetterCode, DeadLetterError, DeadLetterRecord, DeadLetterStore};
use super::error::{FailureClass, JobError};
use super::types::{AckHandle, JobEnvelope, RetryPolicy};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}

/// What happened to a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Disposition {
    Retry {
        attempt: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    DeadLettered {
        code: DeadLetterCode,
        /// False when an earlier delivery already dead-lettered this job.
        inserted: bool,
    },
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

pub struct RetrySupervisor {
    broker: Arc<dyn Broker>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<MetricsCollector>,
    /// Global delay ceiling on top of each policy's own `max_delay`.
    ceiling: Duration,
}

impl core::fmt::Debug for RetrySupervisor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetrySupervisor")
            .field("ceiling", &self.ceiling)
            .finish_non_exhaustive()
    }
}

impl RetrySupervisor {
    pub fn new(
        broker: Arc<dyn Broker>,
        dead_letters: Arc<dyn DeadLetterStore>,
        metrics: Arc<MetricsCollector>,
        ceiling: Duration,
    ) -> Self {
        Self {
            broker,
            dead_letters,
            metrics,
            ceiling,
        }
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letters
    }

    /// Delay before the retry that follows `envelope`'s failed attempt.
    pub fn retry_delay(&self, envelope: &JobEnvelope, policy: &RetryPolicy, error: &JobError) -> Duration {
        match error.retry_after() {
            Some(requested) => requested.min(self.ceiling),
            None => policy.delay_for_attempt(envelope.attempt, self.ceiling, &mut rand::thread_rng()),
        }
    }

    /// Route a failed attempt. The caller acks the original lease only after
    /// this returns `Ok`, so a crash in between redelivers instead of losing
    /// the job.
    pub async fn on_failure(
        &self,
        envelope: &JobEnvelope,
        policy: &RetryPolicy,
        error: &JobError,
    ) -> Result<Disposition, SupervisorError> {
        if error.classify() == FailureClass::Permanent {
            let code = match error {
                JobError::UnknownJob(_) => DeadLetterCode::UnknownJob,
                _ => DeadLetterCode::Permanent,
            };
            return self.dead_letter(envelope, code, error.to_string()).await;
        }

        let delay = self.retry_delay(envelope, policy, error);
        match envelope.next_attempt(delay) {
            Some(retry) => {
                let attempt = retry.attempt;
                self.broker.enqueue(retry).await.map_err(|e| {
                    self.metrics.record_broker_error();
                    e
                })?;
                self.metrics.record_retry(&envelope.name);
                tracing::warn!(
                    job_id = %envelope.id,
                    job = %envelope.name,
                    attempt,
                    max_attempts = envelope.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "job retry scheduled"
                );
                Ok(Disposition::Retry { attempt, delay })
            }
            None => {
                let code = match error {
                    JobError::Timeout(_) => DeadLetterCode::Timeout,
                    _ => DeadLetterCode::RetriesExhausted,
                };
                self.dead_letter(envelope, code, error.to_string()).await
            }
        }
    }

    /// Write the terminal record. Exactly once per job id.
    pub async fn dead_letter(
        &self,
        envelope: &JobEnvelope,
        code: DeadLetterCode,
        message: String,
    ) -> Result<Disposition, SupervisorError> {
        let inserted = self
            .dead_letters
            .insert(DeadLetterRecord::new(envelope.clone(), code, message.clone()))
            .await?;
        if inserted {
            self.metrics.record_dead_letter(code.as_str());
            tracing::warn!(
                job_id = %envelope.id,
                job = %envelope.name,
                attempt = envelope.attempt,
                code = code.as_str(),
                error = %message,
                "job dead-lettered"
            );
        }
        Ok(Disposition::DeadLettered { code, inserted })
    }

    /// Operator replay: remove the record and re-enqueue with `attempt = 0`.
    pub async fn replay(&self, job_id: JobId) -> Result<AckHandle, SupervisorError> {
        let record = self.dead_letters.remove(job_id).await?;
        let envelope = record.envelope.replayed();
        let queue = envelope.queue;
        match self.broker.enqueue(envelope).await {
            Ok(ack) => {
                self.metrics.record_enqueued(queue.as_str());
                tracing::info!(job_id = %job_id, job = %record.envelope.name, "dead letter replayed");
                Ok(ack)
            }
            Err(e) => {
                // Keep the record inspectable when the broker refuses it.
                self.metrics.record_broker_error();
                self.dead_letters.insert(record).await?;
                Err(e.into())
            }
        }
    }
}
