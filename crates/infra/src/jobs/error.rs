//! Job failure taxonomy.
//!
//! Classification uses an explicit allow-list of permanent conditions;
//! everything else is transient and retried per the handler's policy.

use std::time::Duration;

use thiserror::Error;

use super::dead_letter::DeadLetterError;
use crate::datastore::StoreError;
use crate::notifier::NotifierError;

#[derive(Debug, Error)]
pub enum JobError {
    /// Explicit no-retry signal from a handler.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Arguments did not decode into the handler's argument type.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("unknown job '{0}'")]
    UnknownJob(String),

    /// Explicit retry signal from a handler.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retry signal with a handler-chosen delay.
    #[error("retry requested in {delay:?}: {reason}")]
    RetryAfter { delay: Duration, reason: String },

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl JobError {
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn classify(&self) -> FailureClass {
        match self {
            JobError::Permanent(_)
            | JobError::Validation(_)
            | JobError::InvalidArgs(_)
            | JobError::UnknownJob(_) => FailureClass::Permanent,
            JobError::Transient(_)
            | JobError::RetryAfter { .. }
            | JobError::Timeout(_)
            | JobError::Other(_) => FailureClass::Transient,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.classify() == FailureClass::Permanent
    }

    /// Handler-requested delay overriding the policy backoff.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            JobError::RetryAfter { delay, .. } => Some(*delay),
            _ => None,
        }
    }

    /// Stable code for dead-letter records and logs.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Permanent(_) => "permanent",
            JobError::Validation(_) => "validation",
            JobError::InvalidArgs(_) => "invalid_args",
            JobError::UnknownJob(_) => "unknown_job",
            JobError::Transient(_) | JobError::RetryAfter { .. } | JobError::Other(_) => "transient",
            JobError::Timeout(_) => "timeout",
        }
    }
}

impl From<StoreError> for JobError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(what) => JobError::Permanent(format!("not found: {what}")),
            StoreError::Conflict(msg) => JobError::Transient(format!("conflict: {msg}")),
            StoreError::Unavailable(msg) => JobError::Transient(format!("data store unavailable: {msg}")),
        }
    }
}

impl From<NotifierError> for JobError {
    fn from(value: NotifierError) -> Self {
        match value {
            NotifierError::InvalidRecipient(msg) => JobError::Permanent(format!("invalid recipient: {msg}")),
            NotifierError::Unavailable(msg) => JobError::Transient(format!("notifier unavailable: {msg}")),
            NotifierError::RateLimited { retry_after } => JobError::RetryAfter {
                delay: retry_after,
                reason: "notifier rate limited".to_string(),
            },
        }
    }
}

impl From<DeadLetterError> for JobError {
    fn from(value: DeadLetterError) -> Self {
        match value {
            DeadLetterError::NotFound(id) => JobError::Permanent(format!("dead letter {id} not found")),
            DeadLetterError::Storage(msg) => JobError::Transient(format!("dead-letter store: {msg}")),
        }
    }
}
