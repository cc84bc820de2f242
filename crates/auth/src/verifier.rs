//! Credential → identity verification.
//!
//! The credential format is owned by the external auth subsystem; this crate
//! consumes it through [`IdentityVerifier`]. Two implementations ship here:
//! HS256 JWTs for deployments sharing a secret with the issuer, and a static
//! token table for tests/dev.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use thiserror::Error;

use crate::{Identity, JwtClaims, TokenValidationError, validate_claims};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("invalid credential: {0}")]
    Invalid(String),

    #[error("credential rejected: {0}")]
    Rejected(#[from] TokenValidationError),

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// `verify(credential) -> identity | Invalid`.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, VerifyError>;
}

/// HS256 JWT verifier.
#[derive(Clone)]
pub struct Hs256IdentityVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl core::fmt::Debug for Hs256IdentityVerifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hs256IdentityVerifier").finish_non_exhaustive()
    }
}

impl Hs256IdentityVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            decoding: DecodingKey::from_secret(secret.as_ref()),
            encoding: EncodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    /// Decode and validate a token synchronously.
    pub fn decode(&self, token: &str) -> Result<JwtClaims, VerifyError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    VerifyError::Rejected(TokenValidationError::Expired)
                }
                _ => VerifyError::Invalid(e.to_string()),
            })?;
        validate_claims(&data.claims, Utc::now())?;
        Ok(data.claims)
    }

    /// Sign claims with the shared secret (dev tooling and tests).
    pub fn sign(&self, claims: &JwtClaims) -> Result<String, VerifyError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| VerifyError::Invalid(e.to_string()))
    }
}

#[async_trait]
impl IdentityVerifier for Hs256IdentityVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, VerifyError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(VerifyError::Invalid("empty credential".to_string()));
        }
        self.decode(credential).map(JwtClaims::into_identity)
    }
}

/// Fixed token table for tests/dev.
#[derive(Debug, Default)]
pub struct StaticIdentityVerifier {
    tokens: RwLock<HashMap<String, Identity>>,
}

impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }

    pub fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.tokens.write().insert(token.into(), identity);
    }

    /// Revoke a token; subsequent verifications fail.
    pub fn revoke(&self, token: &str) -> Option<Identity> {
        self.tokens.write().remove(token)
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, VerifyError> {
        self.tokens
            .read()
            .get(credential.trim())
            .cloned()
            .ok_or_else(|| VerifyError::Invalid("unknown token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Permission;
    use chrono::Duration;
    use labflow_core::{OrganizationId, UserId};

    fn claims(ttl: Duration) -> JwtClaims {
        let now = Utc::now();
        JwtClaims {
            sub: UserId::new(),
            org: OrganizationId::new(),
            permissions: vec![Permission::ORGANIZATION_READ],
            issued_at: now - Duration::seconds(5),
            expires_at: now + ttl,
        }
    }

    #[tokio::test]
    async fn verifies_signed_token() {
        let verifier = Hs256IdentityVerifier::new("secret");
        let c = claims(Duration::minutes(10));
        let token = verifier.sign(&c).unwrap();

        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.user_id, c.sub);
        assert_eq!(identity.organization_id, c.org);
        assert!(identity.has(&Permission::ORGANIZATION_READ));
    }

    #[tokio::test]
    async fn rejects_wrong_secret_and_garbage() {
        let issuer = Hs256IdentityVerifier::new("issuer-secret");
        let verifier = Hs256IdentityVerifier::new("other-secret");
        let token = issuer.sign(&claims(Duration::minutes(10))).unwrap();

        assert!(matches!(verifier.verify(&token).await, Err(VerifyError::Invalid(_))));
        assert!(matches!(verifier.verify("not.a.jwt").await, Err(VerifyError::Invalid(_))));
        assert!(matches!(verifier.verify("  ").await, Err(VerifyError::Invalid(_))));
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let verifier = Hs256IdentityVerifier::new("secret");
        let mut c = claims(Duration::minutes(10));
        c.issued_at = Utc::now() - Duration::hours(2);
        c.expires_at = Utc::now() - Duration::hours(1);
        let token = verifier.sign(&c).unwrap();

        assert_eq!(
            verifier.verify(&token).await,
            Err(VerifyError::Rejected(TokenValidationError::Expired))
        );
    }

    #[tokio::test]
    async fn static_tokens_can_be_revoked() {
        let identity = Identity::new(UserId::new(), OrganizationId::new(), []);
        let verifier = StaticIdentityVerifier::new().with_token("t-1", identity.clone());

        assert_eq!(verifier.verify("t-1").await, Ok(identity));
        verifier.revoke("t-1");
        assert!(verifier.verify("t-1").await.is_err());
    }
}
