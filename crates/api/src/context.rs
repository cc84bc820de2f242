use labflow_auth::{Identity, Permission};
use labflow_core::{OrganizationId, UserId};

/// Operator context for a request (authenticated identity + permissions).
///
/// Inserted by the auth middleware; present for every `/ops` route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorContext {
    identity: Identity,
}

impl OperatorContext {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.identity.organization_id
    }

    pub fn has(&self, permission: &Permission) -> bool {
        self.identity.has(permission)
    }
}
