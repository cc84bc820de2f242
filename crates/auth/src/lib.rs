//! `labflow-auth` - identity verification and scope authorization.
//!
//! This crate is intentionally decoupled from HTTP and storage: credentials
//! come in as opaque strings, resource ownership comes from a
//! [`ResourceDirectory`] supplied by the caller.

pub mod authorize;
pub mod claims;
pub mod identity;
pub mod permissions;
pub mod verifier;

pub use authorize::{
    AuthzError, InMemoryResourceDirectory, ResourceAcl, ResourceDirectory, ScopeAuthorizer,
};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use identity::Identity;
pub use permissions::Permission;
pub use verifier::{Hs256IdentityVerifier, IdentityVerifier, StaticIdentityVerifier, VerifyError};
