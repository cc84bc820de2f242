//! HTTP application wiring (Axum router + engine wiring).
//!
//! - `services.rs`: broker, workers, scheduler and real-time layer
//! - `routes/`: HTTP and WebSocket handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent `{error, message}` responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router over already-wired services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let auth_state = middleware::AuthState {
        verifier: services.verifier.clone(),
    };

    // Operator routes: require a verified bearer token.
    let ops = routes::ops_router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/metrics", get(routes::system::metrics))
        .route("/ws", get(routes::realtime::connect))
        .nest("/ops", ops)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
