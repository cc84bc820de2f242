use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use labflow_infra::jobs::{BrokerError, DeadLetterError, EnqueueError, SupervisorError};

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn broker_error_to_response(err: BrokerError) -> axum::response::Response {
    match err {
        BrokerError::Unavailable(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", msg),
        BrokerError::LeaseNotFound(id) => {
            json_error(StatusCode::CONFLICT, "lease_not_found", format!("no lease for job {id}"))
        }
        BrokerError::Encoding(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "encoding_error", msg),
    }
}

pub fn enqueue_error_to_response(err: EnqueueError) -> axum::response::Response {
    match err {
        EnqueueError::UnknownJob(name) => {
            json_error(StatusCode::NOT_FOUND, "unknown_job", format!("unknown job '{name}'"))
        }
        EnqueueError::InvalidArgs(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_args", msg),
        EnqueueError::Broker(e) => broker_error_to_response(e),
    }
}

pub fn dead_letter_error_to_response(err: DeadLetterError) -> axum::response::Response {
    match err {
        DeadLetterError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("dead letter {id} not found"))
        }
        DeadLetterError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn supervisor_error_to_response(err: SupervisorError) -> axum::response::Response {
    match err {
        SupervisorError::Broker(e) => broker_error_to_response(e),
        SupervisorError::DeadLetter(e) => dead_letter_error_to_response(e),
    }
}
