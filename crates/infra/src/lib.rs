//! `labflow-infra` - background job engine, scheduler and handler wiring.
//!
//! - [`jobs`]: envelopes, brokers, registry, retries, worker pool
//! - [`scheduler`]: cron entries fired exactly once per due time
//! - [`handlers`]: the concrete jobs this deployment runs
//! - [`datastore`] / [`notifier`]: external collaborators handlers write through
//! - [`config`]: `LABFLOW_*` environment configuration

pub mod config;
pub mod datastore;
pub mod handlers;
pub mod jobs;
pub mod notifier;
pub mod scheduler;
