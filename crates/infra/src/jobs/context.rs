//! Execution context handed to handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use labflow_core::JobId;
use labflow_events::EventSink;

use super::dead_letter::DeadLetterStore;
use super::types::{JobEnvelope, QueueClass};
use crate::datastore::DataStore;
use crate::notifier::Notifier;

/// Collaborators shared by every handler.
#[derive(Clone)]
pub struct JobServices {
    pub data: Arc<dyn DataStore>,
    pub notifier: Arc<dyn Notifier>,
    pub events: Arc<dyn EventSink>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl core::fmt::Debug for JobServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobServices").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub name: String,
    pub queue: QueueClass,
    pub attempt: u32,
    pub max_attempts: u32,
    pub idempotency_key: Option<String>,
    services: JobServices,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(envelope: &JobEnvelope, services: JobServices, cancel: CancellationToken) -> Self {
        Self {
            job_id: envelope.id,
            name: envelope.name.clone(),
            queue: envelope.queue,
            attempt: envelope.attempt,
            max_attempts: envelope.max_attempts,
            idempotency_key: envelope.idempotency_key.clone(),
            services,
            cancel,
        }
    }

    pub fn data(&self) -> &dyn DataStore {
        self.services.data.as_ref()
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.services.notifier.as_ref()
    }

    pub fn events(&self) -> &dyn EventSink {
        self.services.events.as_ref()
    }

    pub fn dead_letters(&self) -> &dyn DeadLetterStore {
        self.services.dead_letters.as_ref()
    }

    /// Cancelled when the worker pool shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt.saturating_add(1) >= self.max_attempts
    }
}
