//! Permission guard for operator routes.
//!
//! Checked inside each handler (before any side effect), mirroring how the
//! real-time layer checks scope access per subscription.

use axum::http::StatusCode;
use axum::response::Response;

use labflow_auth::Permission;

use crate::app::errors::json_error;
use crate::context::OperatorContext;

pub fn require(operator: &OperatorContext, permission: &Permission) -> Result<(), Response> {
    if operator.has(permission) {
        return Ok(());
    }
    tracing::info!(
        user_id = %operator.user_id(),
        permission = %permission,
        "operator request forbidden"
    );
    Err(json_error(
        StatusCode::FORBIDDEN,
        "forbidden",
        format!("missing permission {permission}"),
    ))
}

pub fn require_read(operator: &OperatorContext) -> Result<(), Response> {
    require(operator, &Permission::OPS_READ)
}

pub fn require_write(operator: &OperatorContext) -> Result<(), Response> {
    require(operator, &Permission::OPS_WRITE)
}
