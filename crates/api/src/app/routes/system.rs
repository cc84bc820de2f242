use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{StatusCode, header},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use labflow_core::UserId;
use labflow_observability::PrometheusExporter;

use crate::app::errors::{self, json_error};
use crate::app::services::AppServices;
use crate::authz;
use crate::context::OperatorContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    if let Err(e) = services.queue_depths().await {
        // Export the rest; depth gauges keep their last value.
        tracing::warn!(error = %e, "queue depth refresh failed");
    }
    let body = PrometheusExporter::new(services.metrics.clone()).export();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// GET /ops/queues
pub async fn queues(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_read(&operator) {
        return resp;
    }
    match services.queue_depths().await {
        Ok(depths) => {
            let queues: serde_json::Map<String, serde_json::Value> = depths
                .into_iter()
                .map(|(queue, depth)| {
                    let slots = services.pool.config().slots(queue);
                    (
                        queue.to_string(),
                        json!({
                            "ready": depth.ready,
                            "delayed": depth.delayed,
                            "in_flight": depth.in_flight,
                            "total": depth.total(),
                            "slots": slots,
                        }),
                    )
                })
                .collect();
            Json(queues).into_response()
        }
        Err(e) => errors::broker_error_to_response(e),
    }
}

/// GET /ops/handlers/latency - per-handler p50/p90/p99
pub async fn handler_latency(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_read(&operator) {
        return resp;
    }
    let handlers: serde_json::Map<String, serde_json::Value> = services
        .registry
        .names()
        .map(|name| {
            let stats = services.metrics.job_latency(name).unwrap_or_default();
            (
                name.to_string(),
                json!({
                    "count": stats.count,
                    "p50_ms": stats.p50_ms,
                    "p90_ms": stats.p90_ms,
                    "p99_ms": stats.p99_ms,
                    "max_ms": stats.max_ms,
                }),
            )
        })
        .collect();
    Json(handlers).into_response()
}

/// GET /ops/connections
pub async fn connections(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_read(&operator) {
        return resp;
    }
    Json(json!({
        "active": services.sessions.connection_count(),
        "scopes": services.sessions.connections_by_scope(),
        "sessions": services.sessions.sessions(),
    }))
    .into_response()
}

/// POST /ops/connections/users/:user_id/evict - close every session of a user
pub async fn evict_user(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(operator): Extension<OperatorContext>,
    Path(user_id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require_write(&operator) {
        return resp;
    }
    let Ok(user_id) = user_id.parse::<UserId>() else {
        return json_error(StatusCode::BAD_REQUEST, "invalid_id", "user id must be a UUID");
    };
    let evicted = services.sessions.evict_user(user_id, "access_revoked");
    tracing::info!(user_id = %user_id, evicted, operator = %operator.user_id(), "user sessions evicted");
    Json(json!({ "evicted": evicted })).into_response()
}
