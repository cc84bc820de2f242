use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use labflow_core::{OrganizationId, UserId};

use crate::Permission;

/// A verified identity: who is connected, on behalf of which organization,
/// and with which permissions inside that organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub permissions: BTreeSet<Permission>,
}

impl Identity {
    pub fn new(
        user_id: UserId,
        organization_id: OrganizationId,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        Self {
            user_id,
            organization_id,
            permissions: permissions.into_iter().collect(),
        }
    }

    /// True when the identity holds `permission` directly or via `"*"`.
    pub fn has(&self, permission: &Permission) -> bool {
        self.permissions.contains(&Permission::WILDCARD) || self.permissions.contains(permission)
    }

    pub fn has_wildcard(&self) -> bool {
        self.permissions.contains(&Permission::WILDCARD)
    }
}
