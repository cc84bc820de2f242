//! Session manager: authenticated real-time connections and their
//! subscriptions.
//!
//! Lifecycle: `Connecting → Authenticated → Active → Closed`. A credential
//! that fails verification never produces a [`Session`], so no scope state
//! exists for rejected handshakes.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use labflow_auth::{AuthzError, Identity, IdentityVerifier, ScopeAuthorizer, VerifyError};
use labflow_core::{ConnectionId, OrganizationId, ScopeRef, UserId};
use labflow_observability::MetricsCollector;

use crate::index::{ScopeConnections, ScopeIndex};
use crate::outbox::{CloseReason, Outbox, Pushed};
use crate::wire::ControlFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("missing credential")]
    MissingCredential,

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl ConnectError {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::MissingCredential => "missing_credential",
            ConnectError::Verify(VerifyError::Unavailable(_)) => "auth_unavailable",
            ConnectError::Verify(_) => "invalid_credential",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("session is not active")]
    NotActive,

    #[error(transparent)]
    Unauthorized(#[from] AuthzError),
}

impl SubscribeError {
    pub fn code(&self) -> &'static str {
        match self {
            SubscribeError::UnknownConnection(_) => "unknown_connection",
            SubscribeError::NotActive => "session_closed",
            SubscribeError::Unauthorized(e) => e.code(),
        }
    }
}

/// One authenticated connection.
#[derive(Debug)]
pub struct Session {
    connection_id: ConnectionId,
    identity: Identity,
    connected_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    subscriptions: Mutex<BTreeSet<ScopeRef>>,
    outbox: Arc<Outbox>,
}

impl Session {
    fn authenticated(identity: Identity, outbox_capacity: usize) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            identity,
            connected_at: Utc::now(),
            state: Mutex::new(SessionState::Authenticated),
            subscriptions: Mutex::new(BTreeSet::new()),
            outbox: Arc::new(Outbox::new(outbox_capacity)),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
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

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn subscriptions(&self) -> Vec<ScopeRef> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    pub fn is_subscribed(&self, scope: &ScopeRef) -> bool {
        self.subscriptions.lock().contains(scope)
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn ready_frame(&self) -> ControlFrame {
        ControlFrame::Ready {
            connection_id: self.connection_id,
            user_id: self.identity.user_id,
            organization_id: self.identity.organization_id,
        }
    }

    fn activate(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Authenticated {
            *state = SessionState::Active;
        }
    }

    /// Returns `true` on the first transition to `Closed`.
    fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        let was_open = *state != SessionState::Closed;
        *state = SessionState::Closed;
        was_open
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            connection_id: self.connection_id,
            user_id: self.identity.user_id,
            organization_id: self.identity.organization_id,
            connected_at: self.connected_at,
            state: self.state(),
            subscriptions: self.subscriptions(),
            buffered: self.outbox.len(),
        }
    }
}

/// Operator view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub connected_at: DateTime<Utc>,
    pub state: SessionState,
    pub subscriptions: Vec<ScopeRef>,
    pub buffered: usize,
}

/// Tally of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: u64,
    pub dropped: u64,
    pub revoked: u64,
}

pub struct SessionManager {
    verifier: Arc<dyn IdentityVerifier>,
    authorizer: ScopeAuthorizer,
    sessions: DashMap<ConnectionId, Arc<Session>>,
    index: ScopeIndex,
    metrics: Arc<MetricsCollector>,
    outbox_capacity: usize,
}

impl core::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("scopes", &self.index.scope_count())
            .field("outbox_capacity", &self.outbox_capacity)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        authorizer: ScopeAuthorizer,
        metrics: Arc<MetricsCollector>,
        outbox_capacity: usize,
    ) -> Self {
        Self {
            verifier,
            authorizer,
            sessions: DashMap::new(),
            index: ScopeIndex::new(),
            metrics,
            outbox_capacity,
        }
    }

    /// Verify the handshake credential and register an active session.
    pub async fn connect(&self, credential: Option<&str>) -> Result<Arc<Session>, ConnectError> {
        let identity = self.authenticate(credential).await?;
        Ok(self.open(identity))
    }

    /// Verify a handshake credential without registering anything, for
    /// transports that only hold a session once their upgrade completes.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, ConnectError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(ConnectError::MissingCredential)?;

        self.verifier.verify(credential).await.map_err(|e| {
            tracing::info!(error = %e, "real-time handshake rejected");
            ConnectError::from(e)
        })
    }

    /// Register an active session for an already verified identity.
    pub fn open(&self, identity: Identity) -> Arc<Session> {
        let session = Arc::new(Session::authenticated(identity, self.outbox_capacity));
        self.sessions.insert(session.connection_id, session.clone());
        session.activate();
        self.metrics.connection_opened();

        tracing::info!(
            connection_id = %session.connection_id,
            user_id = %session.identity.user_id,
            organization_id = %session.identity.organization_id,
            "real-time session opened"
        );
        session
    }

    pub fn session(&self, connection_id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions.get(&connection_id).map(|s| s.value().clone())
    }

    /// Subscribe an active session to `scope`. Idempotent.
    pub fn subscribe(&self, connection_id: ConnectionId, scope: ScopeRef) -> Result<(), SubscribeError> {
        let session = self
            .session(connection_id)
            .ok_or(SubscribeError::UnknownConnection(connection_id))?;

        if let Err(e) = self.authorizer.authorize(&session.identity, &scope) {
            self.metrics.record_subscription_rejected();
            tracing::info!(
                connection_id = %connection_id,
                user_id = %session.identity.user_id,
                scope = %scope,
                code = e.code(),
                "subscription rejected"
            );
            return Err(e.into());
        }

        // Holding the subscription lock across the state check keeps a
        // concurrent close from missing this scope when it unindexes.
        let mut subscriptions = session.subscriptions.lock();
        if !session.is_active() {
            return Err(SubscribeError::NotActive);
        }
        self.index.insert(scope.clone(), connection_id);
        if subscriptions.insert(scope.clone()) {
            tracing::debug!(connection_id = %connection_id, scope = %scope, "subscribed");
        }
        Ok(())
    }

    /// Returns whether the session was subscribed.
    pub fn unsubscribe(&self, connection_id: ConnectionId, scope: &ScopeRef) -> Result<bool, SubscribeError> {
        let session = self
            .session(connection_id)
            .ok_or(SubscribeError::UnknownConnection(connection_id))?;
        let mut subscriptions = session.subscriptions.lock();
        let removed = subscriptions.remove(scope);
        self.index.remove(scope, connection_id);
        Ok(removed)
    }

    /// Close a session: drop every subscription, cancel buffered frames and
    /// forget the connection. Idempotent.
    pub fn close(&self, connection_id: ConnectionId) {
        self.shutdown(connection_id, CloseReason::Disconnected);
    }

    /// Force a session out with a reason the client receives before the
    /// socket closes.
    pub fn evict(&self, connection_id: ConnectionId, reason: impl Into<String>) -> bool {
        self.shutdown(connection_id, CloseReason::Evicted(reason.into()))
    }

    /// Evict every session of `user_id`; used when a user's access is revoked.
    pub fn evict_user(&self, user_id: UserId, reason: &str) -> usize {
        let targets: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().identity.user_id == user_id)
            .map(|entry| *entry.key())
            .collect();
        targets
            .into_iter()
            .filter(|id| self.evict(*id, reason))
            .count()
    }

    fn shutdown(&self, connection_id: ConnectionId, reason: CloseReason) -> bool {
        let Some((_, session)) = self.sessions.remove(&connection_id) else {
            return false;
        };
        if !session.mark_closed() {
            return false;
        }
        let scopes = std::mem::take(&mut *session.subscriptions.lock());
        for scope in &scopes {
            self.index.remove(scope, connection_id);
        }
        session.outbox.close(reason.clone());
        self.metrics.connection_closed();

        tracing::info!(
            connection_id = %connection_id,
            user_id = %session.identity.user_id,
            subscriptions = scopes.len(),
            reason = ?reason,
            "real-time session closed"
        );
        true
    }

    /// Queue one pre-serialized event frame to every session following
    /// `scope`, re-checking authorization per session.
    pub fn deliver(&self, scope: &ScopeRef, frame: &Arc<str>) -> Delivery {
        let mut tally = Delivery::default();
        for connection_id in self.index.members(scope) {
            let Some(session) = self.session(connection_id) else {
                continue;
            };
            if !session.is_active() {
                continue;
            }
            if let Err(e) = self.authorizer.authorize(&session.identity, scope) {
                // Access changed since subscribe: stop following the scope.
                tally.revoked += 1;
                let _ = self.unsubscribe(connection_id, scope);
                tracing::info!(
                    connection_id = %connection_id,
                    scope = %scope,
                    code = e.code(),
                    "subscription revoked at delivery"
                );
                let notice = ControlFrame::error(e.code(), e.to_string(), Some(scope.clone()));
                session.outbox.push(Arc::from(notice.to_text()));
                continue;
            }
            match session.outbox.push(frame.clone()) {
                Pushed::Queued => tally.delivered += 1,
                Pushed::Overflowed => {
                    tally.delivered += 1;
                    tally.dropped += 1;
                }
                Pushed::Closed => {}
            }
        }
        tally
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connections_by_scope(&self) -> Vec<ScopeConnections> {
        self.index.counts()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.iter().map(|s| s.value().info()).collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }

    /// Close everything (server shutdown).
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|s| *s.key()).collect();
        ids.into_iter()
            .filter(|id| self.shutdown(*id, CloseReason::Evicted("server_shutdown".to_string())))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxItem;
    use labflow_auth::{InMemoryResourceDirectory, Permission, ResourceAcl, StaticIdentityVerifier};

    struct Fixture {
        manager: SessionManager,
        directory: Arc<InMemoryResourceDirectory>,
        metrics: Arc<MetricsCollector>,
        org_a: OrganizationId,
        org_b: OrganizationId,
    }

    fn fixture(outbox_capacity: usize) -> Fixture {
        let org_a = OrganizationId::new();
        let org_b = OrganizationId::new();
        let verifier = StaticIdentityVerifier::new()
            .with_token(
                "alice",
                Identity::new(UserId::new(), org_a, [Permission::DEVICE_READ, Permission::EXPERIMENT_READ]),
            )
            .with_token("mallory", Identity::new(UserId::new(), org_b, [Permission::WILDCARD]));
        let directory = Arc::new(InMemoryResourceDirectory::new());
        directory.insert(ScopeRef::device("d-a"), ResourceAcl::organization_wide(org_a));
        directory.insert(ScopeRef::device("d-b"), ResourceAcl::organization_wide(org_b));
        let metrics = Arc::new(MetricsCollector::new());
        let manager = SessionManager::new(
            Arc::new(verifier),
            ScopeAuthorizer::new(directory.clone()),
            metrics.clone(),
            outbox_capacity,
        );
        Fixture { manager, directory, metrics, org_a, org_b }
    }

    #[tokio::test]
    async fn rejects_missing_and_invalid_credentials() {
        let f = fixture(8);
        assert!(matches!(f.manager.connect(None).await, Err(ConnectError::MissingCredential)));
        assert!(matches!(f.manager.connect(Some("  ")).await, Err(ConnectError::MissingCredential)));
        let err = f.manager.connect(Some("forged")).await.unwrap_err();
        assert_eq!(err.code(), "invalid_credential");
        assert_eq!(f.manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn authenticating_holds_no_session_until_opened() {
        let f = fixture(8);
        let identity = f.manager.authenticate(Some("alice")).await.unwrap();
        assert_eq!(identity.organization_id, f.org_a);
        assert_eq!(f.manager.connection_count(), 0);
        assert_eq!(f.metrics.active_connections(), 0);

        let session = f.manager.open(identity);
        assert_eq!(f.metrics.active_connections(), 1);
        f.manager.close(session.connection_id());
        assert_eq!(f.metrics.active_connections(), 0);
    }

    #[tokio::test]
    async fn cross_organization_subscribe_is_rejected() {
        let f = fixture(8);
        let mallory = f.manager.connect(Some("mallory")).await.unwrap();
        assert_eq!(mallory.organization_id(), f.org_b);

        let err = f
            .manager
            .subscribe(mallory.connection_id(), ScopeRef::device("d-a"))
            .unwrap_err();
        assert_eq!(err, SubscribeError::Unauthorized(AuthzError::TenantMismatch));
        assert!(mallory.subscriptions().is_empty());
        assert_eq!(f.metrics.snapshot().subscriptions_rejected, 1);

        let delivered = f.manager.deliver(&ScopeRef::device("d-a"), &Arc::from("{}"));
        assert_eq!(delivered, Delivery::default());
        assert!(mallory.outbox().try_pop().is_none());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_close_unindexes() {
        let f = fixture(8);
        let alice = f.manager.connect(Some("alice")).await.unwrap();
        assert_eq!(alice.state(), SessionState::Active);
        assert_eq!(alice.organization_id(), f.org_a);

        let scope = ScopeRef::device("d-a");
        f.manager.subscribe(alice.connection_id(), scope.clone()).unwrap();
        f.manager.subscribe(alice.connection_id(), scope.clone()).unwrap();
        assert_eq!(alice.subscriptions(), vec![scope.clone()]);
        assert_eq!(f.manager.connections_by_scope()[0].connections, 1);

        f.manager.close(alice.connection_id());
        f.manager.close(alice.connection_id());
        assert_eq!(alice.state(), SessionState::Closed);
        assert!(f.manager.connections_by_scope().is_empty());
        assert_eq!(f.manager.connection_count(), 0);
        assert_eq!(f.metrics.active_connections(), 0);
        assert_eq!(
            f.manager.subscribe(alice.connection_id(), scope),
            Err(SubscribeError::UnknownConnection(alice.connection_id()))
        );
    }

    #[tokio::test]
    async fn delivery_rechecks_authorization() {
        let f = fixture(8);
        let alice = f.manager.connect(Some("alice")).await.unwrap();
        let scope = ScopeRef::device("d-a");
        f.manager.subscribe(alice.connection_id(), scope.clone()).unwrap();

        let frame: Arc<str> = Arc::from(r#"{"type":"device.heartbeat"}"#);
        assert_eq!(f.manager.deliver(&scope, &frame).delivered, 1);
        assert_eq!(alice.outbox().try_pop(), Some(OutboxItem::Frame(frame.clone())));

        // Device moves to another organization.
        f.directory.insert(scope.clone(), ResourceAcl::organization_wide(f.org_b));
        let tally = f.manager.deliver(&scope, &frame);
        assert_eq!(tally.delivered, 0);
        assert_eq!(tally.revoked, 1);
        assert!(!alice.is_subscribed(&scope));

        let Some(OutboxItem::Frame(notice)) = alice.outbox().try_pop() else {
            panic!("expected an error notice");
        };
        assert!(notice.contains("session.error"));
        assert!(notice.contains("tenant_mismatch"));
        assert!(alice.outbox().try_pop().is_none());
    }

    #[tokio::test]
    async fn evict_user_closes_all_of_their_sessions() {
        let f = fixture(8);
        let first = f.manager.connect(Some("alice")).await.unwrap();
        let second = f.manager.connect(Some("alice")).await.unwrap();
        let other = f.manager.connect(Some("mallory")).await.unwrap();

        assert_eq!(f.manager.evict_user(first.user_id(), "access_revoked"), 2);
        assert_eq!(f.manager.connection_count(), 1);
        assert_eq!(
            second.outbox().try_pop(),
            Some(OutboxItem::Closed(CloseReason::Evicted("access_revoked".into())))
        );
        assert!(other.is_active());
    }
}
