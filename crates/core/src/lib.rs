//! `labflow-core` - shared identifiers and addressing primitives.
//!
//! Everything here is plain data: no IO, no async, no infrastructure.

pub mod error;
pub mod id;
pub mod scope;

pub use error::{DomainError, DomainResult};
pub use id::{ConnectionId, JobId, OrganizationId, UserId};
pub use scope::{ScopeKind, ScopeRef};
