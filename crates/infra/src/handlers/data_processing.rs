//! Device signal and measurement processing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use labflow_core::ScopeRef;

use crate::datastore::{DeviceStatus, ExperimentSummary, Heartbeat, Measurement};
use crate::jobs::{HandlerRegistration, JobContext, JobError, QueueClass, RetryPolicy, TypedJob};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatArgs {
    pub heartbeat_id: String,
    pub device_id: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Stores a device heartbeat and marks the device online.
///
/// Emits `device.heartbeat` on the device scope for new heartbeats and
/// `device.status_changed` on the organization scope when the device comes
/// back online.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessDeviceHeartbeat;

#[async_trait]
impl TypedJob for ProcessDeviceHeartbeat {
    const NAME: &'static str = "process_device_heartbeat";
    type Args = HeartbeatArgs;

    fn registration(&self) -> HandlerRegistration {
        HandlerRegistration::new(Self::NAME)
            .queue(QueueClass::Realtime)
            .priority(10)
            .retry_policy(RetryPolicy::exponential(
                3,
                Duration::from_millis(200),
                Duration::from_secs(5),
            ))
            .timeout(Duration::from_secs(10))
    }

    async fn run(&self, args: HeartbeatArgs, ctx: &JobContext) -> Result<(), JobError> {
        if let Some(battery) = args.battery {
            if !(0.0..=100.0).contains(&battery) {
                return Err(JobError::validation(format!("battery {battery} out of range")));
            }
        }

        let mut device = ctx
            .data()
            .get_device(&args.device_id)
            .await?
            .ok_or_else(|| JobError::permanent(format!("unknown device '{}'", args.device_id)))?;

        let inserted = ctx
            .data()
            .insert_heartbeat(Heartbeat {
                id: args.heartbeat_id.clone(),
                device_id: args.device_id.clone(),
                received_at: args.received_at,
                battery: args.battery,
                temperature: args.temperature,
            })
            .await?;

        let previous = device.status;
        let newer = device.last_heartbeat_at.is_none_or(|at| at < args.received_at);
        if newer || previous != DeviceStatus::Online {
            device.status = DeviceStatus::Online;
            if newer {
                device.last_heartbeat_at = Some(args.received_at);
            }
            ctx.data().upsert_device(device.clone()).await?;
        }

        if inserted {
            ctx.events().emit(
                ScopeRef::device(&device.id),
                "device.heartbeat",
                json!({
                    "device_id": device.id,
                    "heartbeat_id": args.heartbeat_id,
                    "received_at": args.received_at,
                    "battery": args.battery,
                    "temperature": args.temperature,
                }),
            );
        }
        if previous != DeviceStatus::Online {
            tracing::info!(device_id = %device.id, "device back online");
            ctx.events().emit(
                ScopeRef::organization(device.organization_id),
                "device.status_changed",
                json!({
                    "device_id": device.id,
                    "status": DeviceStatus::Online,
                    "previous": previous,
                }),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeSummaryArgs {
    pub experiment_id: String,
    /// Restrict the summary to one metric.
    #[serde(default)]
    pub metric: Option<String>,
}

/// Recomputes descriptive statistics for an experiment's measurements.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeExperimentSummary;

#[async_trait]
impl TypedJob for ComputeExperimentSummary {
    const NAME: &'static str = "compute_experiment_summary";
    type Args = ComputeSummaryArgs;

    fn registration(&self) -> HandlerRegistration {
        HandlerRegistration::new(Self::NAME)
            .queue(QueueClass::Heavy)
            .retry_policy(RetryPolicy::exponential(
                4,
                Duration::from_secs(2),
                Duration::from_secs(120),
            ))
            .timeout(Duration::from_secs(120))
    }

    async fn run(&self, args: ComputeSummaryArgs, ctx: &JobContext) -> Result<(), JobError> {
        let rows = ctx.data().measurements_for(&args.experiment_id).await?;
        let values: Vec<f64> = rows
            .iter()
            .filter(|m| args.metric.as_ref().is_none_or(|metric| &m.metric == metric))
            .map(|m| m.value)
            .collect();

        let summary = summarize(&args.experiment_id, &values, latest(&rows));
        if let Some(existing) = ctx.data().get_summary(&args.experiment_id).await? {
            if same_stats(&existing, &summary) {
                tracing::debug!(experiment_id = %args.experiment_id, "summary unchanged");
                return Ok(());
            }
        }

        ctx.data().upsert_summary(summary.clone()).await?;
        ctx.events().emit(
            ScopeRef::experiment(&args.experiment_id),
            "experiment.summary_ready",
            serde_json::to_value(&summary).map_err(anyhow::Error::from)?,
        );
        Ok(())
    }
}

fn latest(rows: &[Measurement]) -> DateTime<Utc> {
    rows.iter()
        .map(|m| m.recorded_at)
        .max()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Population statistics. An empty set yields zeros.
pub(crate) fn summarize(experiment_id: &str, values: &[f64], computed_at: DateTime<Utc>) -> ExperimentSummary {
    let count = values.len();
    if count == 0 {
        return ExperimentSummary {
            experiment_id: experiment_id.to_string(),
            count: 0,
            mean: 0.0,
            min: 0.0,
            max: 0.0,
            stddev: 0.0,
            computed_at,
        };
    }
    let n = count as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    ExperimentSummary {
        experiment_id: experiment_id.to_string(),
        count,
        mean,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        stddev: variance.sqrt(),
        computed_at,
    }
}

fn same_stats(a: &ExperimentSummary, b: &ExperimentSummary) -> bool {
    a.count == b.count && a.mean == b.mean && a.min == b.min && a.max == b.max && a.stddev == b.stddev
}
