//! Background job engine: envelopes, broker, registry, retries, workers.
//!
//! ## Flow
//!
//! - `JobClient` validates a job name against the `TaskRegistry` and hands an
//!   envelope to the `Broker`
//! - `WorkerPool` dequeues per queue class under a lease, runs the handler
//!   with a timeout, and acks
//! - failures go through `RetrySupervisor`, which re-enqueues with backoff
//!   or writes a `DeadLetterRecord`
//!
//! Delivery is at-least-once; handlers are expected to be idempotent.

pub mod broker;
pub mod client;
pub mod context;
pub mod dead_letter;
pub mod error;
pub mod execution_log;
#[cfg(feature = "redis")]
pub mod redis_broker;
pub mod registry;
pub mod supervisor;
pub mod types;
pub mod worker_pool;

pub use broker::{Broker, BrokerError, InMemoryBroker, Lease, Leased, QueueDepth};
pub use client::{EnqueueError, JobClient};
pub use context::{JobContext, JobServices};
pub use dead_letter::{
    DeadLetterCode, DeadLetterError, DeadLetterRecord, DeadLetterStore, FinalError,
    InMemoryDeadLetterStore,
};
pub use error::{FailureClass, JobError};
pub use execution_log::{ExecutionLog, ExecutionRecord};
#[cfg(feature = "redis")]
pub use redis_broker::RedisBroker;
pub use registry::{
    FnHandler, HandlerRegistration, JobHandler, RegisteredHandler, RegistryError, TaskRegistry,
    TaskRegistryBuilder, TypedJob,
};
pub use supervisor::{Disposition, RetrySupervisor, SupervisorError};
pub use types::{
    AckHandle, EnqueueOptions, ExecutionOutcome, JobEnvelope, QueueClass, RetryPolicy,
};
pub use worker_pool::{ActiveJob, ExecutionReport, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
