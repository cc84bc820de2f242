use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use labflow_auth::{IdentityVerifier, VerifyError};

use crate::app::errors::json_error;
use crate::context::OperatorContext;

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn IdentityVerifier>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer(req.headers()) else {
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token");
    };

    let identity = match state.verifier.verify(token).await {
        Ok(identity) => identity,
        Err(VerifyError::Unavailable(msg)) => {
            return json_error(StatusCode::SERVICE_UNAVAILABLE, "auth_unavailable", msg);
        }
        Err(e) => return json_error(StatusCode::UNAUTHORIZED, "unauthorized", e.to_string()),
    };

    req.extensions_mut().insert(OperatorContext::new(identity));
    next.run(req).await.into_response()
}

/// `Authorization: Bearer <token>`, if present and non-empty.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}
