//! Scope → live connection index.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::Serialize;

use labflow_core::{ConnectionId, ScopeRef};

/// Number of live sessions following one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeConnections {
    pub scope: ScopeRef,
    pub connections: usize,
}

/// Concurrent index from scope to the sessions subscribed to it.
///
/// Empty buckets are removed so the index only ever holds scopes that have
/// at least one live subscriber.
#[derive(Debug, Default)]
pub struct ScopeIndex {
    buckets: DashMap<ScopeRef, HashSet<ConnectionId>>,
}

impl ScopeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the connection was already indexed under `scope`.
    pub fn insert(&self, scope: ScopeRef, connection: ConnectionId) -> bool {
        self.buckets.entry(scope).or_default().insert(connection)
    }

    pub fn remove(&self, scope: &ScopeRef, connection: ConnectionId) -> bool {
        let removed = match self.buckets.get_mut(scope) {
            Some(mut bucket) => bucket.remove(&connection),
            None => return false,
        };
        self.buckets.remove_if(scope, |_, bucket| bucket.is_empty());
        removed
    }

    /// Snapshot of the connections following `scope`.
    pub fn members(&self, scope: &ScopeRef) -> Vec<ConnectionId> {
        self.buckets
            .get(scope)
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn scope_count(&self) -> usize {
        self.buckets.len()
    }

    /// Per-scope connection counts, most followed first.
    pub fn counts(&self) -> Vec<ScopeConnections> {
        let mut counts: Vec<ScopeConnections> = self
            .buckets
            .iter()
            .map(|entry| ScopeConnections {
                scope: entry.key().clone(),
                connections: entry.value().len(),
            })
            .collect();
        counts.sort_by(|a, b| b.connections.cmp(&a.connections).then_with(|| a.scope.cmp(&b.scope)));
        counts
    }
}
