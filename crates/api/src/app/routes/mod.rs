use axum::{routing::{get, post}, Router};

pub mod dead_letters;
pub mod jobs;
pub mod realtime;
pub mod system;

/// Router for all operator (bearer-authenticated) endpoints, nested at `/ops`.
pub fn ops_router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/dead-letters", dead_letters::router())
        .route("/queues", get(system::queues))
        .route("/handlers/latency", get(system::handler_latency))
        .route("/connections", get(system::connections))
        .route("/connections/users/:user_id/evict", post(system::evict_user))
}
