//! HTTP/WebSocket surface: real-time endpoint, operator routes, metrics.

pub mod app;
pub mod authz;
pub mod context;
pub mod middleware;
