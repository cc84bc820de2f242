//! Enqueue API used by the HTTP layer, the scheduler and handlers.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use labflow_observability::MetricsCollector;

use super::broker::{Broker, BrokerError};
use super::registry::{TaskRegistry, TypedJob};
use super::types::{AckHandle, EnqueueOptions, JobEnvelope};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Clone)]
pub struct JobClient {
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    metrics: Arc<MetricsCollector>,
}

impl core::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobClient")
            .field("jobs", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl JobClient {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<TaskRegistry>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            broker,
            registry,
            metrics,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Build an envelope from the registration defaults and `options`.
    pub fn envelope_for(
        &self,
        job_name: &str,
        args: JsonValue,
        options: EnqueueOptions,
    ) -> Result<JobEnvelope, EnqueueError> {
        let registration = &self
            .registry
            .resolve(job_name)
            .map_err(|_| EnqueueError::UnknownJob(job_name.to_string()))?
            .registration;

        let mut envelope = JobEnvelope::new(job_name, args)
            .with_queue(options.queue.unwrap_or(registration.queue))
            .with_priority(options.priority.unwrap_or(registration.default_priority))
            .with_max_attempts(
                options
                    .max_attempts
                    .unwrap_or(registration.retry_policy.max_attempts),
            );
        if let Some(key) = options.idempotency_key {
            envelope = envelope.with_idempotency_key(key);
        }
        if let Some(delay) = options.delay.filter(|d| !d.is_zero()) {
            envelope = envelope.delayed(delay);
        }
        Ok(envelope)
    }

    pub async fn enqueue(
        &self,
        job_name: &str,
        args: JsonValue,
        options: EnqueueOptions,
    ) -> Result<AckHandle, EnqueueError> {
        let envelope = self.envelope_for(job_name, args, options)?;
        self.enqueue_envelope(envelope).await
    }

    pub async fn enqueue_typed<J: TypedJob>(
        &self,
        args: &J::Args,
        options: EnqueueOptions,
    ) -> Result<AckHandle, EnqueueError> {
        let args = to_args(args)?;
        self.enqueue(J::NAME, args, options).await
    }

    /// Enqueue a prebuilt envelope without consulting the registry.
    pub async fn enqueue_envelope(&self, envelope: JobEnvelope) -> Result<AckHandle, EnqueueError> {
        let job_id = envelope.id;
        let name = envelope.name.clone();
        let queue = envelope.queue;

        let ack = self.broker.enqueue(envelope).await.map_err(|e| {
            self.metrics.record_broker_error();
            tracing::error!(job_id = %job_id, job = %name, error = %e, "enqueue failed");
            e
        })?;

        if ack.duplicate {
            tracing::debug!(job_id = %ack.job_id, job = %name, "duplicate enqueue suppressed");
        } else {
            self.metrics.record_enqueued(queue.as_str());
            tracing::debug!(job_id = %job_id, job = %name, queue = %queue, "job enqueued");
        }
        Ok(ack)
    }
}

fn to_args<T: Serialize>(args: &T) -> Result<JsonValue, EnqueueError> {
    serde_json::to_value(args).map_err(|e| EnqueueError::InvalidArgs(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::broker::InMemoryBroker;
    use crate::jobs::registry::HandlerRegistration;
    use crate::jobs::types::{QueueClass, RetryPolicy};
    use std::time::Duration;

    fn client() -> (JobClient, Arc<InMemoryBroker>, Arc<MetricsCollector>) {
        let registry = TaskRegistry::builder()
            .register_fn(
                HandlerRegistration::new("rebuild")
                    .queue(QueueClass::Heavy)
                    .priority(3)
                    .retry_policy(RetryPolicy::fixed(4, Duration::from_secs(1))),
                |_, _| async { Ok(()) },
            )
            .build()
            .unwrap();
        let broker = Arc::new(InMemoryBroker::default());
        let metrics = Arc::new(MetricsCollector::new());
        (
            JobClient::new(broker.clone(), Arc::new(registry), metrics.clone()),
            broker,
            metrics,
        )
    }

    #[tokio::test]
    async fn applies_registration_defaults() {
        let (client, broker, metrics) = client();
        client
            .enqueue("rebuild", serde_json::json!({"id": 1}), EnqueueOptions::new())
            .await
            .unwrap();

        let pending = broker.pending(QueueClass::Heavy, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, 3);
        assert_eq!(pending[0].max_attempts, 4);
        assert_eq!(pending[0].attempt, 0);
        assert_eq!(metrics.snapshot().jobs_enqueued.get("heavy"), Some(&1));
    }

    #[tokio::test]
    async fn options_override_defaults() {
        let (client, broker, _) = client();
        client
            .enqueue(
                "rebuild",
                serde_json::Value::Null,
                EnqueueOptions::new().queue(QueueClass::Realtime).priority(9).max_attempts(1),
            )
            .await
            .unwrap();

        let pending = broker.pending(QueueClass::Realtime, 10).await.unwrap();
        assert_eq!(pending[0].priority, 9);
        assert_eq!(pending[0].max_attempts, 1);
    }

    #[tokio::test]
    async fn rejects_unknown_jobs() {
        let (client, _, _) = client();
        let err = client
            .enqueue("nope", serde_json::Value::Null, EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::UnknownJob(name) if name == "nope"));
    }

    #[tokio::test]
    async fn duplicate_keys_return_original_id() {
        let (client, broker, metrics) = client();
        let first = client
            .enqueue("rebuild", serde_json::Value::Null, EnqueueOptions::new().idempotency_key("r-1"))
            .await
            .unwrap();
        let second = client
            .enqueue("rebuild", serde_json::Value::Null, EnqueueOptions::new().idempotency_key("r-1"))
            .await
            .unwrap();

        assert_eq!(second.job_id, first.job_id);
        assert!(second.duplicate);
        assert_eq!(broker.len(), 1);
        assert_eq!(metrics.snapshot().jobs_enqueued.get("heavy"), Some(&1));
    }

    #[tokio::test]
    async fn typed_enqueue_serializes_args() {
        use crate::handlers::{SendNotification, SendNotificationArgs};
        use crate::notifier::Channel;
        use labflow_core::UserId;

        let registry = TaskRegistry::builder().register_typed(SendNotification).build().unwrap();
        let broker = Arc::new(InMemoryBroker::default());
        let client = JobClient::new(broker.clone(), Arc::new(registry), Arc::new(MetricsCollector::new()));

        let args = SendNotificationArgs {
            notification_id: "n-1".into(),
            user_id: UserId::new(),
            channel: Channel::Email,
            recipient: "ops@example.org".into(),
            subject: "run finished".into(),
            body: String::new(),
        };
        client
            .enqueue_typed::<SendNotification>(&args, EnqueueOptions::new())
            .await
            .unwrap();

        let pending = broker.pending(QueueClass::Default, 10).await.unwrap();
        assert_eq!(pending[0].name, "send_notification");
        assert_eq!(pending[0].args["channel"], "email");
        assert_eq!(pending[0].args["notification_id"], "n-1");
    }
}
