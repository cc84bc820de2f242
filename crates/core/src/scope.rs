//! Broadcast/subscription addressing.
//!
//! A [`ScopeRef`] names something a live client can follow: a device, an
//! experiment, a task, a whole organization or a single user. The same value
//! is used as the broadcast target and as the subscription key, so equality
//! is purely structural.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Kind of resource a scope points at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Device,
    Experiment,
    Task,
    Organization,
    User,
}

impl ScopeKind {
    pub const ALL: [ScopeKind; 5] = [
        ScopeKind::Device,
        ScopeKind::Experiment,
        ScopeKind::Task,
        ScopeKind::Organization,
        ScopeKind::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Device => "device",
            ScopeKind::Experiment => "experiment",
            ScopeKind::Task => "task",
            ScopeKind::Organization => "organization",
            ScopeKind::User => "user",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScopeKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown scope kind '{s}'")))
    }
}

/// A named broadcast target / subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeRef {
    pub kind: ScopeKind,
    pub id: String,
}

impl ScopeRef {
    pub fn new(kind: ScopeKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn device(id: impl Into<String>) -> Self {
        Self::new(ScopeKind::Device, id)
    }

    pub fn experiment(id: impl Into<String>) -> Self {
        Self::new(ScopeKind::Experiment, id)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(ScopeKind::Task, id)
    }

    pub fn organization(id: impl ToString) -> Self {
        Self::new(ScopeKind::Organization, id.to_string())
    }

    pub fn user(id: impl ToString) -> Self {
        Self::new(ScopeKind::User, id.to_string())
    }

    /// Reject empty or whitespace-bearing ids before they reach any index.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.id.is_empty() {
            return Err(DomainError::validation("scope id must not be empty"));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(DomainError::validation("scope id must not contain whitespace"));
        }
        Ok(())
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for ScopeRef {
    type Err = DomainError;

    /// Parses the `kind:id` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| DomainError::validation(format!("expected 'kind:id', got '{s}'")))?;
        let scope = ScopeRef::new(kind.parse()?, id);
        scope.validate()?;
        Ok(scope)
    }
}
