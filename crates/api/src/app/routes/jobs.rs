//! Operator routes for jobs: active, scheduled, recent, enqueue.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use labflow_core::JobId;

use crate::app::dto::{EnqueueRequest, EnqueueResponse, LimitQuery, ScheduleView};
use crate::app::errors::{self, json_error};
use crate::app::services::AppServices;
use crate::authz;
use crate::context::OperatorContext;

pub fn router() -> Router {
    Router::new()
        .route("/", axum::routing::post(enqueue))
        .route("/active", get(active))
        .route("/scheduled", get(scheduled))
        .route("/recent", get(recent))
        .route("/:id", get(history))
}

/// GET /ops/jobs/active
pub async fn active(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_read(&operator) {
        return resp;
    }
    let jobs = services.pool.active_jobs();
    Json(json!({ "count": jobs.len(), "jobs": jobs })).into_response()
}

/// GET /ops/jobs/scheduled
///
/// Delayed envelopes (retries and deferred enqueues) plus the periodic
/// schedule entries with their next due time.
pub async fn scheduled(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Query(query): Query<LimitQuery>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_read(&operator) {
        return resp;
    }
    let delayed = match services.broker.scheduled(query.limit()).await {
        Ok(delayed) => delayed,
        Err(e) => return errors::broker_error_to_response(e),
    };
    let entries = match services.schedules.load().await {
        Ok(entries) => entries,
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, "schedule_store_error", e.to_string()),
    };
    let now = Utc::now();
    let schedules: Vec<ScheduleView> = entries.into_iter().map(|e| ScheduleView::new(e, now)).collect();
    Json(json!({ "delayed": delayed, "schedules": schedules })).into_response()
}

/// GET /ops/jobs/recent
pub async fn recent(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Query(query): Query<LimitQuery>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_read(&operator) {
        return resp;
    }
    Json(services.execution_log.recent(query.limit())).into_response()
}

/// GET /ops/jobs/:id - execution attempts recorded for one job
pub async fn history(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_read(&operator) {
        return resp;
    }
    let Ok(job_id) = id.parse::<JobId>() else {
        return json_error(StatusCode::BAD_REQUEST, "invalid_id", "job id must be a UUID");
    };
    let attempts = services.execution_log.for_job(job_id);
    if attempts.is_empty() {
        return json_error(StatusCode::NOT_FOUND, "not_found", format!("no executions recorded for {job_id}"));
    }
    Json(json!({ "job_id": job_id, "attempts": attempts })).into_response()
}

/// POST /ops/jobs - Enqueue API
pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Json(body): Json<EnqueueRequest>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_write(&operator) {
        return resp;
    }
    match services.client.enqueue(&body.job, body.args.clone(), body.options()).await {
        Ok(ack) => {
            tracing::info!(
                job_id = %ack.job_id,
                job = %body.job,
                duplicate = ack.duplicate,
                user_id = %operator.user_id(),
                "job enqueued by operator"
            );
            (StatusCode::ACCEPTED, Json(EnqueueResponse::from(ack))).into_response()
        }
        Err(e) => errors::enqueue_error_to_response(e),
    }
}
