//! Request/response DTOs for the operator surface.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use labflow_infra::jobs::{AckHandle, EnqueueOptions, QueueClass};
use labflow_infra::scheduler::ScheduleEntry;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

/// `POST /ops/jobs` body. Unset options fall back to the handler's
/// registration defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub job: String,
    #[serde(default)]
    pub args: JsonValue,
    pub queue: Option<QueueClass>,
    pub priority: Option<i32>,
    pub delay_ms: Option<u64>,
    pub idempotency_key: Option<String>,
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn options(&self) -> EnqueueOptions {
        EnqueueOptions {
            queue: self.queue,
            priority: self.priority,
            delay: self.delay_ms.map(Duration::from_millis),
            idempotency_key: self.idempotency_key.clone(),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub duplicate: bool,
}

impl From<AckHandle> for EnqueueResponse {
    fn from(ack: AckHandle) -> Self {
        Self {
            job_id: ack.job_id.to_string(),
            duplicate: ack.duplicate,
        }
    }
}

/// Schedule entry plus its next due time.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleView {
    pub name: String,
    pub cron_expression: String,
    pub target_job: String,
    pub queue: Option<QueueClass>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub pending_fire: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl ScheduleView {
    pub fn new(entry: ScheduleEntry, now: DateTime<Utc>) -> Self {
        let next_fire_at = entry
            .cron()
            .ok()
            .and_then(|cron| cron.next_after(entry.watermark().max(now)));
        Self {
            name: entry.name,
            cron_expression: entry.cron_expression,
            target_job: entry.target_job,
            queue: entry.queue,
            last_fired_at: entry.last_fired_at,
            pending_fire: entry.pending_fire,
            next_fire_at,
        }
    }
}
