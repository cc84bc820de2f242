//! Periodic housekeeping jobs, fired by the scheduler.
//!
//! Each job measures age against `scheduled_for` when the scheduler supplied
//! one, so a late or repeated run of the same fire makes the same decisions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use labflow_core::ScopeRef;

use crate::datastore::DeviceStatus;
use crate::jobs::{HandlerRegistration, JobContext, JobError, QueueClass, RetryPolicy, TypedJob};

fn maintenance(name: &str) -> HandlerRegistration {
    HandlerRegistration::new(name)
        .queue(QueueClass::Scheduled)
        .retry_policy(RetryPolicy::exponential(
            3,
            Duration::from_secs(10),
            Duration::from_secs(120),
        ))
        .timeout(Duration::from_secs(120))
}

fn reference_time(scheduled_for: Option<DateTime<Utc>>) -> DateTime<Utc> {
    scheduled_for.unwrap_or_else(Utc::now)
}

fn age(secs: u64) -> Result<chrono::Duration, JobError> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| JobError::validation(format!("age of {secs}s is out of range")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleDevicesArgs {
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

fn default_stale_after() -> u64 {
    300
}

/// Marks online devices without a recent heartbeat offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkStaleDevicesOffline;

#[async_trait]
impl TypedJob for MarkStaleDevicesOffline {
    const NAME: &'static str = "mark_stale_devices_offline";
    type Args = StaleDevicesArgs;

    fn registration(&self) -> HandlerRegistration {
        maintenance(Self::NAME)
    }

    async fn run(&self, args: StaleDevicesArgs, ctx: &JobContext) -> Result<(), JobError> {
        let cutoff = reference_time(args.scheduled_for) - age(args.stale_after_secs)?;
        let mut marked = 0usize;
        for mut device in ctx.data().list_devices().await? {
            let stale = device.last_heartbeat_at.is_none_or(|at| at < cutoff);
            if device.status != DeviceStatus::Online || !stale {
                continue;
            }
            device.status = DeviceStatus::Offline;
            ctx.data().upsert_device(device.clone()).await?;
            marked += 1;
            ctx.events().emit(
                ScopeRef::organization(device.organization_id),
                "device.status_changed",
                json!({
                    "device_id": device.id,
                    "status": DeviceStatus::Offline,
                    "previous": DeviceStatus::Online,
                    "last_heartbeat_at": device.last_heartbeat_at,
                }),
            );
        }
        if marked > 0 {
            tracing::info!(marked, cutoff = %cutoff, "stale devices marked offline");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeMeasurementsArgs {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

fn default_retention_days() -> u32 {
    90
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeExpiredMeasurements;

#[async_trait]
impl TypedJob for PurgeExpiredMeasurements {
    const NAME: &'static str = "purge_expired_measurements";
    type Args = PurgeMeasurementsArgs;

    fn registration(&self) -> HandlerRegistration {
        maintenance(Self::NAME)
    }

    async fn run(&self, args: PurgeMeasurementsArgs, ctx: &JobContext) -> Result<(), JobError> {
        if args.retention_days == 0 {
            return Err(JobError::validation("retention_days must be positive"));
        }
        let cutoff = reference_time(args.scheduled_for) - chrono::Duration::days(i64::from(args.retention_days));
        let purged = ctx.data().purge_measurements_before(cutoff).await?;
        tracing::info!(purged, cutoff = %cutoff, "expired measurements purged");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeDeadLettersArgs {
    #[serde(default = "default_dead_letter_days")]
    pub older_than_days: u32,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

fn default_dead_letter_days() -> u32 {
    30
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeDeadLetters;

#[async_trait]
impl TypedJob for PurgeDeadLetters {
    const NAME: &'static str = "purge_dead_letters";
    type Args = PurgeDeadLettersArgs;

    fn registration(&self) -> HandlerRegistration {
        maintenance(Self::NAME)
    }

    async fn run(&self, args: PurgeDeadLettersArgs, ctx: &JobContext) -> Result<(), JobError> {
        let cutoff =
            reference_time(args.scheduled_for) - chrono::Duration::days(i64::from(args.older_than_days));
        let purged = ctx.dead_letters().purge_older_than(cutoff).await?;
        tracing::info!(purged, cutoff = %cutoff, "old dead letters purged");
        Ok(())
    }
}
