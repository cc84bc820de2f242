//! Task registry: job name → handler and routing metadata.
//!
//! Built once at startup and read-only afterwards. Duplicate names and
//! schedule targets without a handler are rejected when the registry is
//! built, not when a job is dequeued.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use super::context::JobContext;
use super::error::JobError;
use super::types::{QueueClass, RetryPolicy};

/// Routing metadata for one job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerRegistration {
    pub name: String,
    pub queue: QueueClass,
    pub default_priority: i32,
    pub retry_policy: RetryPolicy,
    /// Safe to execute more than once for the same envelope.
    pub idempotent: bool,
    /// Overrides the pool's default execution timeout.
    pub timeout: Option<Duration>,
}

impl HandlerRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: QueueClass::Default,
            default_priority: 0,
            retry_policy: RetryPolicy::default(),
            idempotent: true,
            timeout: None,
        }
    }

    pub fn queue(mut self, queue: QueueClass) -> Self {
        self.queue = queue;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Type-erased handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, args: JsonValue) -> Result<(), JobError>;
}

/// A job with a statically typed argument payload.
#[async_trait]
pub trait TypedJob: Send + Sync + 'static {
    const NAME: &'static str;

    type Args: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn registration(&self) -> HandlerRegistration {
        HandlerRegistration::new(Self::NAME)
    }

    async fn run(&self, args: Self::Args, ctx: &JobContext) -> Result<(), JobError>;
}

struct TypedHandler<J: TypedJob> {
    job: J,
    _args: PhantomData<fn() -> J::Args>,
}

#[async_trait]
impl<J: TypedJob> JobHandler for TypedHandler<J> {
    async fn handle(&self, ctx: JobContext, args: JsonValue) -> Result<(), JobError> {
        let args: J::Args =
            serde_json::from_value(args).map_err(|e| JobError::InvalidArgs(e.to_string()))?;
        self.job.run(args, &ctx).await
    }
}

/// Closure-backed handler, mostly for tests and small maintenance hooks.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, JsonValue) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), JobError>> + Send,
{
    async fn handle(&self, ctx: JobContext, args: JsonValue) -> Result<(), JobError> {
        (self.0)(ctx, args).await
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job '{0}' is registered more than once")]
    Duplicate(String),

    #[error("job name must not be empty")]
    EmptyName,

    #[error("job '{0}' has max_attempts = 0")]
    NoAttempts(String),

    #[error("no handler registered for '{0}'")]
    NotFound(String),

    #[error("schedule targets unregistered jobs: {0:?}")]
    MissingTargets(Vec<String>),
}

#[derive(Clone)]
pub struct RegisteredHandler {
    pub registration: HandlerRegistration,
    pub handler: Arc<dyn JobHandler>,
}

impl core::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
    entries: Vec<RegisteredHandler>,
}

impl TaskRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, registration: HandlerRegistration, handler: Arc<dyn JobHandler>) -> Self {
        self.entries.push(RegisteredHandler { registration, handler });
        self
    }

    pub fn register_typed<J: TypedJob>(self, job: J) -> Self {
        let registration = job.registration();
        self.register(
            registration,
            Arc::new(TypedHandler {
                job,
                _args: PhantomData,
            }),
        )
    }

    pub fn register_fn<F, Fut>(self, registration: HandlerRegistration, f: F) -> Self
    where
        F: Fn(JobContext, JsonValue) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(registration, Arc::new(FnHandler(f)))
    }

    pub fn build(self) -> Result<TaskRegistry, RegistryError> {
        let mut handlers = BTreeMap::new();
        for entry in self.entries {
            let name = entry.registration.name.clone();
            if name.trim().is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if entry.registration.retry_policy.max_attempts == 0 {
                return Err(RegistryError::NoAttempts(name));
            }
            if handlers.insert(name.clone(), entry).is_some() {
                return Err(RegistryError::Duplicate(name));
            }
        }
        Ok(TaskRegistry { handlers })
    }
}

/// Immutable name → handler table.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    handlers: BTreeMap<String, RegisteredHandler>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::new()
    }

    pub fn resolve(&self, name: &str) -> Result<&RegisteredHandler, RegistryError> {
        self.handlers
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn registrations(&self) -> impl Iterator<Item = &HandlerRegistration> {
        self.handlers.values().map(|h| &h.registration)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Fail fast when any of `targets` has no handler.
    pub fn validate_targets<'a>(&self, targets: impl IntoIterator<Item = &'a str>) -> Result<(), RegistryError> {
        let missing: BTreeSet<String> = targets
            .into_iter()
            .filter(|t| !self.contains(t))
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::MissingTargets(missing.into_iter().collect()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[derive(Serialize, Deserialize)]
    struct EchoArgs {
        text: String,
    }

    #[async_trait]
    impl TypedJob for Echo {
        const NAME: &'static str = "echo";
        type Args = EchoArgs;

        fn registration(&self) -> HandlerRegistration {
            HandlerRegistration::new(Self::NAME).queue(QueueClass::Realtime).priority(5)
        }

        async fn run(&self, args: EchoArgs, _ctx: &JobContext) -> Result<(), JobError> {
            if args.text.is_empty() {
                return Err(JobError::validation("empty text"));
            }
            Ok(())
        }
    }

    #[test]
    fn resolves_registered_jobs() {
        let registry = TaskRegistry::builder().register_typed(Echo).build().unwrap();

        let entry = registry.resolve("echo").unwrap();
        assert_eq!(entry.registration.queue, QueueClass::Realtime);
        assert_eq!(entry.registration.default_priority, 5);
        assert_eq!(
            registry.resolve("missing").unwrap_err(),
            RegistryError::NotFound("missing".into())
        );
    }

    #[test]
    fn duplicate_names_fail_fast() {
        let err = TaskRegistry::builder()
            .register_typed(Echo)
            .register_fn(HandlerRegistration::new("echo"), |_, _| async { Ok(()) })
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("echo".into()));
    }

    #[test]
    fn zero_attempt_policies_are_rejected() {
        let registration = HandlerRegistration::new("never").retry_policy(RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        });
        let err = TaskRegistry::builder()
            .register_fn(registration, |_, _| async { Ok(()) })
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::NoAttempts("never".into()));
    }

    #[test]
    fn validates_schedule_targets() {
        let registry = TaskRegistry::builder().register_typed(Echo).build().unwrap();
        assert!(registry.validate_targets(["echo"]).is_ok());
        assert_eq!(
            registry.validate_targets(["echo", "ghost"]),
            Err(RegistryError::MissingTargets(vec!["ghost".into()]))
        );
    }
}
