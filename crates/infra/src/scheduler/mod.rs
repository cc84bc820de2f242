//! Periodic job scheduler ("beat").
//!
//! Schedule bookkeeping lives in a [`ScheduleStore`], never in process
//! memory, and every entry is advanced under an exclusive lease so several
//! scheduler instances can run side by side.

pub mod beat;
pub mod cron;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::jobs::{EnqueueError, QueueClass};

pub use beat::{Beat, BeatConfig, BeatHandle, SeedError, TickReport};
pub use self::cron::CronSchedule;
pub use store::{FileScheduleStore, InMemoryScheduleStore, ScheduleLease, ScheduleStore};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("unknown schedule entry '{0}'")]
    UnknownEntry(String),

    #[error("lease on '{entry}' is not held by '{holder}'")]
    LeaseLost { entry: String, holder: String },

    #[error("schedule storage error: {0}")]
    Storage(String),

    #[error("scheduled enqueue failed: {0}")]
    Enqueue(#[from] EnqueueError),
}

impl From<std::io::Error> for ScheduleError {
    fn from(value: std::io::Error) -> Self {
        ScheduleError::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for ScheduleError {
    fn from(value: serde_json::Error) -> Self {
        ScheduleError::Storage(value.to_string())
    }
}

/// One periodic job definition plus its firing bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub cron_expression: String,
    pub target_job: String,
    #[serde(default)]
    pub args_template: JsonValue,
    #[serde(default)]
    pub queue: Option<QueueClass>,
    /// Latest fire time that was enqueued and committed.
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Due time recorded before enqueue and cleared on commit. A value left
    /// behind by a crashed instance is re-fired on recovery.
    #[serde(default)]
    pub pending_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>, target_job: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            target_job: target_job.into(),
            args_template: JsonValue::Object(Default::default()),
            queue: None,
            last_fired_at: None,
            pending_fire: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_args(mut self, args: JsonValue) -> Self {
        self.args_template = args;
        self
    }

    pub fn with_queue(mut self, queue: QueueClass) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Pretend the entry was created at `at`; nothing before it is due.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn cron(&self) -> Result<CronSchedule, ScheduleError> {
        CronSchedule::parse(&self.cron_expression)
    }

    /// Fire times are due strictly after this instant.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.last_fired_at.unwrap_or(self.created_at)
    }

    /// Idempotency key of the enqueue for `fire_at`.
    pub fn fire_key(&self, fire_at: DateTime<Utc>) -> String {
        format!("schedule:{}:{}", self.name, fire_at.to_rfc3339())
    }

    /// Job arguments for `fire_at`. Object templates get `scheduled_for`.
    pub fn args_for(&self, fire_at: DateTime<Utc>) -> JsonValue {
        let mut args = self.args_template.clone();
        if let JsonValue::Object(map) = &mut args {
            map.entry("scheduled_for")
                .or_insert_with(|| JsonValue::String(fire_at.to_rfc3339()));
        }
        args
    }

    /// Copy the definition fields of `other`, keeping this entry's progress.
    pub(crate) fn redefine(&mut self, other: ScheduleEntry) {
        self.cron_expression = other.cron_expression;
        self.target_job = other.target_job;
        self.args_template = other.args_template;
        self.queue = other.queue;
    }
}
