//! Experiment report generation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use labflow_core::ScopeRef;

use crate::datastore::{Measurement, Report, ReportFormat};
use crate::jobs::{HandlerRegistration, JobContext, JobError, QueueClass, RetryPolicy, TypedJob};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportArgs {
    /// Report identity; a report is generated once per id.
    pub report_id: String,
    pub experiment_id: String,
    /// Task the report belongs to; receives `task.completed`.
    pub task_id: String,
    #[serde(default = "default_format")]
    pub format: ReportFormat,
}

fn default_format() -> ReportFormat {
    ReportFormat::Csv
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateExperimentReport;

#[async_trait]
impl TypedJob for GenerateExperimentReport {
    const NAME: &'static str = "generate_experiment_report";
    type Args = ReportArgs;

    fn registration(&self) -> HandlerRegistration {
        HandlerRegistration::new(Self::NAME)
            .queue(QueueClass::Heavy)
            .retry_policy(RetryPolicy::exponential(
                3,
                Duration::from_secs(5),
                Duration::from_secs(300),
            ))
            .timeout(Duration::from_secs(300))
    }

    async fn run(&self, args: ReportArgs, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.data().get_report(&args.report_id).await?.is_some() {
            tracing::debug!(report_id = %args.report_id, "report already generated");
            return Ok(());
        }

        let rows = ctx.data().measurements_for(&args.experiment_id).await?;
        if ctx.cancellation().is_cancelled() {
            return Err(JobError::transient("worker shutting down"));
        }
        let content = match args.format {
            ReportFormat::Csv => render_csv(&rows),
            ReportFormat::Json => serde_json::to_string(&rows).map_err(anyhow::Error::from)?,
        };

        let report = Report {
            id: args.report_id.clone(),
            experiment_id: args.experiment_id.clone(),
            task_id: args.task_id.clone(),
            format: args.format,
            content,
            rows: rows.len(),
            created_at: Utc::now(),
        };
        ctx.data().upsert_report(report).await?;
        tracing::info!(
            report_id = %args.report_id,
            experiment_id = %args.experiment_id,
            rows = rows.len(),
            "experiment report generated"
        );

        ctx.events().emit(
            ScopeRef::task(&args.task_id),
            "task.completed",
            json!({
                "task_id": args.task_id,
                "report_id": args.report_id,
                "experiment_id": args.experiment_id,
                "format": args.format,
                "rows": rows.len(),
            }),
        );
        Ok(())
    }
}

fn render_csv(rows: &[Measurement]) -> String {
    let mut out = String::from("id,metric,value,recorded_at\n");
    for m in rows {
        out.push_str(&csv_field(&m.id));
        out.push(',');
        out.push_str(&csv_field(&m.metric));
        out.push(',');
        out.push_str(&m.value.to_string());
        out.push(',');
        out.push_str(&m.recorded_at.to_rfc3339());
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
