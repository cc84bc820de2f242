//! Operator routes for dead-lettered jobs.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use labflow_core::JobId;

use crate::app::dto::{EnqueueResponse, LimitQuery};
use crate::app::errors::{self, json_error};
use crate::app::services::AppServices;
use crate::authz;
use crate::context::OperatorContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list))
        .route("/:id", get(get_one))
        .route("/:id/retry", post(retry))
}

fn parse_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse::<JobId>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "job id must be a UUID"))
}

/// GET /ops/dead-letters - newest first
pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Query(query): Query<LimitQuery>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_read(&operator) {
        return resp;
    }
    let records = match services.dead_letters.list(query.limit()).await {
        Ok(records) => records,
        Err(e) => return errors::dead_letter_error_to_response(e),
    };
    let total = match services.dead_letters.count().await {
        Ok(total) => total,
        Err(e) => return errors::dead_letter_error_to_response(e),
    };
    Json(json!({ "total": total, "records": records })).into_response()
}

/// GET /ops/dead-letters/:id
pub async fn get_one(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_read(&operator) {
        return resp;
    }
    let job_id = match parse_id(&id) {
        Ok(job_id) => job_id,
        Err(resp) => return resp,
    };
    match services.dead_letters.get(job_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", format!("dead letter {job_id} not found")),
        Err(e) => errors::dead_letter_error_to_response(e),
    }
}

/// POST /ops/dead-letters/:id/retry - re-enqueue with attempt reset to 0
pub async fn retry(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_write(&operator) {
        return resp;
    }
    let job_id = match parse_id(&id) {
        Ok(job_id) => job_id,
        Err(resp) => return resp,
    };
    match services.supervisor.replay(job_id).await {
        Ok(ack) => {
            tracing::info!(job_id = %job_id, user_id = %operator.user_id(), "dead letter retried by operator");
            (StatusCode::ACCEPTED, Json(EnqueueResponse::from(ack))).into_response()
        }
        Err(e) => errors::supervisor_error_to_response(e),
    }
}
