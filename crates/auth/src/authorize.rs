use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use labflow_core::{OrganizationId, ScopeKind, ScopeRef, UserId};

use crate::{Identity, Permission};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),

    #[error("forbidden: not on the access list for {0}")]
    NotListed(ScopeRef),

    #[error("forbidden: {0} belongs to another user")]
    NotOwner(ScopeRef),

    #[error("unknown resource {0}")]
    UnknownResource(ScopeRef),

    #[error("invalid scope: {0}")]
    InvalidScope(String),
}

impl AuthzError {
    /// Stable machine-readable code for wire error frames.
    pub fn code(&self) -> &'static str {
        match self {
            AuthzError::TenantMismatch => "tenant_mismatch",
            AuthzError::Forbidden(_) => "forbidden",
            AuthzError::NotListed(_) => "not_listed",
            AuthzError::NotOwner(_) => "not_owner",
            AuthzError::UnknownResource(_) => "unknown_resource",
            AuthzError::InvalidScope(_) => "invalid_scope",
        }
    }
}

/// Ownership and explicit access list of a device/experiment/task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAcl {
    pub organization_id: OrganizationId,
    /// `None` means "anyone in the organization with the read permission".
    pub readers: Option<BTreeSet<UserId>>,
}

impl ResourceAcl {
    pub fn organization_wide(organization_id: OrganizationId) -> Self {
        Self {
            organization_id,
            readers: None,
        }
    }

    pub fn restricted(
        organization_id: OrganizationId,
        readers: impl IntoIterator<Item = UserId>,
    ) -> Self {
        Self {
            organization_id,
            readers: Some(readers.into_iter().collect()),
        }
    }
}

/// Source of resource ownership for device/experiment/task scopes.
///
/// Backed by the platform's data store in production; kept synchronous so it
/// can be consulted on every delivered event without suspending.
pub trait ResourceDirectory: Send + Sync {
    fn lookup(&self, scope: &ScopeRef) -> Option<ResourceAcl>;
}

impl<D> ResourceDirectory for Arc<D>
where
    D: ResourceDirectory + ?Sized,
{
    fn lookup(&self, scope: &ScopeRef) -> Option<ResourceAcl> {
        (**self).lookup(scope)
    }
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResourceDirectory {
    entries: RwLock<HashMap<ScopeRef, ResourceAcl>>,
}

impl InMemoryResourceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, scope: ScopeRef, acl: ResourceAcl) {
        self.entries.write().insert(scope, acl);
    }

    pub fn remove(&self, scope: &ScopeRef) -> Option<ResourceAcl> {
        self.entries.write().remove(scope)
    }
}

impl ResourceDirectory for InMemoryResourceDirectory {
    fn lookup(&self, scope: &ScopeRef) -> Option<ResourceAcl> {
        self.entries.read().get(scope).cloned()
    }
}

/// Read-access policy for scopes.
///
/// - No IO beyond the directory lookup
/// - No panics
/// - Same answer for subscribe-time and delivery-time checks
#[derive(Clone)]
pub struct ScopeAuthorizer {
    directory: Arc<dyn ResourceDirectory>,
}

impl core::fmt::Debug for ScopeAuthorizer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScopeAuthorizer").finish_non_exhaustive()
    }
}

impl ScopeAuthorizer {
    pub fn new(directory: Arc<dyn ResourceDirectory>) -> Self {
        Self { directory }
    }

    /// Decide whether `identity` may read events addressed to `scope`.
    pub fn authorize(&self, identity: &Identity, scope: &ScopeRef) -> Result<(), AuthzError> {
        scope
            .validate()
            .map_err(|e| AuthzError::InvalidScope(e.to_string()))?;

        match scope.kind {
            ScopeKind::User => {
                if scope.id == identity.user_id.to_string() {
                    Ok(())
                } else {
                    Err(AuthzError::NotOwner(scope.clone()))
                }
            }
            ScopeKind::Organization => {
                let organization_id: OrganizationId = scope
                    .id
                    .parse()
                    .map_err(|_| AuthzError::InvalidScope(format!("{scope} is not an organization id")))?;
                if organization_id != identity.organization_id {
                    return Err(AuthzError::TenantMismatch);
                }
                require(identity, &Permission::ORGANIZATION_READ)
            }
            ScopeKind::Device | ScopeKind::Experiment | ScopeKind::Task => {
                let acl = self
                    .directory
                    .lookup(scope)
                    .ok_or_else(|| AuthzError::UnknownResource(scope.clone()))?;
                if acl.organization_id != identity.organization_id {
                    return Err(AuthzError::TenantMismatch);
                }
                if let Some(required) = Permission::read_for(scope.kind) {
                    require(identity, &required)?;
                }
                match &acl.readers {
                    Some(readers)
                        if !identity.has_wildcard() && !readers.contains(&identity.user_id) =>
                    {
                        Err(AuthzError::NotListed(scope.clone()))
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

fn require(identity: &Identity, required: &Permission) -> Result<(), AuthzError> {
    if identity.has(required) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ScopeAuthorizer, Arc<InMemoryResourceDirectory>) {
        let directory = Arc::new(InMemoryResourceDirectory::new());
        (ScopeAuthorizer::new(directory.clone()), directory)
    }

    fn reader(org: OrganizationId) -> Identity {
        Identity::new(
            UserId::new(),
            org,
            [
                Permission::DEVICE_READ,
                Permission::EXPERIMENT_READ,
                Permission::ORGANIZATION_READ,
            ],
        )
    }

    #[test]
    fn organization_scope_requires_matching_tenant() {
        let (authz, _) = setup();
        let org_a = OrganizationId::new();
        let org_b = OrganizationId::new();

        let member = reader(org_a);
        let outsider = reader(org_b);
        let scope = ScopeRef::organization(org_a);

        assert_eq!(authz.authorize(&member, &scope), Ok(()));
        assert_eq!(
            authz.authorize(&outsider, &scope),
            Err(AuthzError::TenantMismatch)
        );
    }

    #[test]
    fn wildcard_does_not_cross_tenants() {
        let (authz, _) = setup();
        let admin = Identity::new(UserId::new(), OrganizationId::new(), [Permission::WILDCARD]);
        let foreign = ScopeRef::organization(OrganizationId::new());
        assert_eq!(authz.authorize(&admin, &foreign), Err(AuthzError::TenantMismatch));
    }

    #[test]
    fn device_scope_uses_directory_owner() {
        let (authz, directory) = setup();
        let org = OrganizationId::new();
        let scope = ScopeRef::device("dev-1");
        directory.insert(scope.clone(), ResourceAcl::organization_wide(org));

        assert_eq!(authz.authorize(&reader(org), &scope), Ok(()));
        assert_eq!(
            authz.authorize(&reader(OrganizationId::new()), &scope),
            Err(AuthzError::TenantMismatch)
        );
        assert_eq!(
            authz.authorize(&reader(org), &ScopeRef::device("ghost")),
            Err(AuthzError::UnknownResource(ScopeRef::device("ghost")))
        );
    }

    #[test]
    fn missing_kind_permission_is_forbidden() {
        let (authz, directory) = setup();
        let org = OrganizationId::new();
        let scope = ScopeRef::task("task-1");
        directory.insert(scope.clone(), ResourceAcl::organization_wide(org));

        let err = authz.authorize(&reader(org), &scope).unwrap_err();
        assert_eq!(err, AuthzError::Forbidden("task.read".to_string()));
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn restricted_acl_lists_readers() {
        let (authz, directory) = setup();
        let org = OrganizationId::new();
        let listed = reader(org);
        let unlisted = reader(org);
        let scope = ScopeRef::experiment("exp-7");
        directory.insert(scope.clone(), ResourceAcl::restricted(org, [listed.user_id]));

        assert_eq!(authz.authorize(&listed, &scope), Ok(()));
        assert_eq!(
            authz.authorize(&unlisted, &scope),
            Err(AuthzError::NotListed(scope.clone()))
        );
    }

    #[test]
    fn user_scope_is_owner_only() {
        let (authz, _) = setup();
        let me = reader(OrganizationId::new());
        assert_eq!(authz.authorize(&me, &ScopeRef::user(me.user_id)), Ok(()));
        let other = ScopeRef::user(UserId::new());
        assert_eq!(authz.authorize(&me, &other), Err(AuthzError::NotOwner(other.clone())));
    }

    #[test]
    fn malformed_organization_id_is_invalid_scope() {
        let (authz, _) = setup();
        let me = reader(OrganizationId::new());
        let err = authz
            .authorize(&me, &ScopeRef::new(ScopeKind::Organization, "acme"))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_scope");
    }
}
