use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use labflow_core::ScopeKind;

/// Permission identifier.
///
/// Permissions are modeled as opaque strings (e.g. "device.read").
/// A special wildcard permission `"*"` grants everything within the
/// holder's own organization; it never crosses a tenant boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));
    pub const DEVICE_READ: Permission = Permission(Cow::Borrowed("device.read"));
    pub const EXPERIMENT_READ: Permission = Permission(Cow::Borrowed("experiment.read"));
    pub const TASK_READ: Permission = Permission(Cow::Borrowed("task.read"));
    pub const ORGANIZATION_READ: Permission = Permission(Cow::Borrowed("organization.read"));
    pub const OPS_READ: Permission = Permission(Cow::Borrowed("ops.read"));
    pub const OPS_WRITE: Permission = Permission(Cow::Borrowed("ops.write"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }

    /// Read permission required to follow a scope of the given kind.
    ///
    /// `None` for user scopes: a user may always follow their own feed and
    /// nobody else's.
    pub fn read_for(kind: ScopeKind) -> Option<Permission> {
        match kind {
            ScopeKind::Device => Some(Self::DEVICE_READ),
            ScopeKind::Experiment => Some(Self::EXPERIMENT_READ),
            ScopeKind::Task => Some(Self::TASK_READ),
            ScopeKind::Organization => Some(Self::ORGANIZATION_READ),
            ScopeKind::User => None,
        }
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
