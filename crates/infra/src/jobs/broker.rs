//! Broker client: durable queueing with leases and visibility timeouts.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use labflow_core::JobId;

use super::types::{AckHandle, JobEnvelope, QueueClass};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("lease not found or expired for job {0}")]
    LeaseNotFound(JobId),

    #[error("envelope encoding failed: {0}")]
    Encoding(String),
}

/// Time-bounded exclusive claim on one delivered envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: Uuid,
    pub job_id: JobId,
    pub queue: QueueClass,
    pub expires_at: DateTime<Utc>,
}

/// Envelope delivered to a consumer together with its lease.
#[derive(Debug, Clone, PartialEq)]
pub struct Leased {
    pub envelope: JobEnvelope,
    pub lease: Lease,
}

/// Visible / delayed / leased envelope counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Accept an envelope. An idempotency key already held by a different
    /// job within the retention window returns that job's id with
    /// `duplicate = true` instead of enqueueing.
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<AckHandle, BrokerError>;

    /// Lease at most one visible envelope from the first queue in `queues`
    /// that has one. Never blocks; `None` when nothing is visible.
    async fn dequeue(
        &self,
        queues: &[QueueClass],
        visibility_timeout: Duration,
    ) -> Result<Option<Leased>, BrokerError>;

    /// Remove a leased envelope for good.
    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Make a leased envelope visible again immediately.
    async fn nack(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Push a live lease's deadline to `visibility_timeout` from now and
    /// return the new expiry. A lease that already lapsed is not revived.
    async fn extend(&self, lease: &Lease, visibility_timeout: Duration) -> Result<DateTime<Utc>, BrokerError>;

    async fn depth(&self, queue: QueueClass) -> Result<QueueDepth, BrokerError>;

    /// Visible envelopes in delivery order.
    async fn pending(&self, queue: QueueClass, limit: usize) -> Result<Vec<JobEnvelope>, BrokerError>;

    /// Envelopes waiting on `not_before`, soonest first.
    async fn scheduled(&self, limit: usize) -> Result<Vec<JobEnvelope>, BrokerError>;

    async fn in_flight(&self) -> Result<Vec<Leased>, BrokerError>;
}

#[derive(Debug)]
struct Stored {
    envelope: JobEnvelope,
    visible_at: Instant,
}

#[derive(Debug)]
struct Held {
    seq: u64,
    expires: Instant,
    lease: Lease,
}

#[derive(Debug, Clone, Copy)]
struct KeyOwner {
    job_id: JobId,
    /// `None` while the job is live; set when its envelope is acked.
    expires: Option<Instant>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// (priority desc, sequence) of visible envelopes.
    ready: BTreeSet<(Reverse<i32>, u64)>,
    /// (visible_at, sequence) of delayed envelopes.
    delayed: BTreeSet<(Instant, u64)>,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    entries: HashMap<u64, Stored>,
    queues: HashMap<QueueClass, QueueState>,
    leases: HashMap<Uuid, Held>,
    keys: HashMap<String, KeyOwner>,
    /// Live envelope count per job id (retry instances overlap briefly).
    live: HashMap<JobId, usize>,
}

impl State {
    fn queue(&mut self, queue: QueueClass) -> &mut QueueState {
        self.queues.entry(queue).or_default()
    }

    fn promote_due(&mut self, queue: QueueClass, now: Instant) {
        let mut due = Vec::new();
        let state = self.queue(queue);
        while let Some(&(at, seq)) = state.delayed.first() {
            if at > now {
                break;
            }
            state.delayed.pop_first();
            due.push(seq);
        }
        for seq in due {
            if let Some(priority) = self.entries.get(&seq).map(|s| s.envelope.priority) {
                self.queue(queue).ready.insert((Reverse(priority), seq));
            }
        }
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .leases
            .iter()
            .filter(|(_, held)| held.expires <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(held) = self.leases.remove(&token) {
                tracing::warn!(
                    job_id = %held.lease.job_id,
                    queue = %held.lease.queue,
                    "lease expired, envelope redelivered"
                );
                self.make_visible(held.seq, now);
            }
        }
    }

    fn make_visible(&mut self, seq: u64, now: Instant) {
        if let Some(stored) = self.entries.get_mut(&seq) {
            stored.visible_at = now;
            let key = (Reverse(stored.envelope.priority), seq);
            let queue = stored.envelope.queue;
            self.queue(queue).ready.insert(key);
        }
    }

    fn purge_keys(&mut self, now: Instant) {
        self.keys
            .retain(|_, owner| owner.expires.is_none_or(|expires| expires > now));
    }

    fn release_key(&mut self, envelope: &JobEnvelope, retention: Duration, now: Instant) {
        let remaining = match self.live.get_mut(&envelope.id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return;
        }
        self.live.remove(&envelope.id);
        if let Some(key) = &envelope.idempotency_key {
            if let Some(owner) = self.keys.get_mut(key) {
                if owner.job_id == envelope.id {
                    owner.expires = Some(now + retention);
                }
            }
        }
    }
}

/// In-process broker for tests/dev and single-node deployments.
///
/// Visibility and lease deadlines run on the tokio clock so paused-time
/// tests are deterministic.
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    retention: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

impl InMemoryBroker {
    /// `retention` is how long a completed job's idempotency key keeps
    /// deduplicating new enqueues.
    pub fn new(retention: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<AckHandle, BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_keys(now);

        if let Some(key) = &envelope.idempotency_key {
            match state.keys.get(key) {
                Some(owner) if owner.job_id != envelope.id => {
                    return Ok(AckHandle {
                        job_id: owner.job_id,
                        duplicate: true,
                    });
                }
                _ => {
                    state.keys.insert(
                        key.clone(),
                        KeyOwner {
                            job_id: envelope.id,
                            expires: None,
                        },
                    );
                }
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let delay = envelope.remaining_delay(Utc::now());
        let visible_at = now + delay;
        let queue = envelope.queue;
        let priority = envelope.priority;
        let job_id = envelope.id;

        *state.live.entry(job_id).or_default() += 1;
        state.entries.insert(seq, Stored { envelope, visible_at });
        if delay.is_zero() {
            state.queue(queue).ready.insert((Reverse(priority), seq));
        } else {
            state.queue(queue).delayed.insert((visible_at, seq));
        }

        Ok(AckHandle {
            job_id,
            duplicate: false,
        })
    }

    async fn dequeue(
        &self,
        queues: &[QueueClass],
        visibility_timeout: Duration,
    ) -> Result<Option<Leased>, BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.reclaim_expired(now);

        for &queue in queues {
            state.promote_due(queue, now);
            let Some((_, seq)) = state.queue(queue).ready.pop_first() else {
                continue;
            };
            let Some(stored) = state.entries.get(&seq) else {
                continue;
            };
            let envelope = stored.envelope.clone();
            let lease = Lease {
                token: Uuid::now_v7(),
                job_id: envelope.id,
                queue,
                expires_at: Utc::now() + chrono::Duration::from_std(visibility_timeout).unwrap_or_default(),
            };
            state.leases.insert(
                lease.token,
                Held {
                    seq,
                    expires: now + visibility_timeout,
                    lease: lease.clone(),
                },
            );
            return Ok(Some(Leased { envelope, lease }));
        }
        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let held = state
            .leases
            .remove(&lease.token)
            .ok_or(BrokerError::LeaseNotFound(lease.job_id))?;
        if let Some(stored) = state.entries.remove(&held.seq) {
            state.release_key(&stored.envelope, self.retention, now);
        }
        Ok(())
    }

    async fn nack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let held = state
            .leases
            .remove(&lease.token)
            .ok_or(BrokerError::LeaseNotFound(lease.job_id))?;
        state.make_visible(held.seq, now);
        Ok(())
    }

    async fn extend(&self, lease: &Lease, visibility_timeout: Duration) -> Result<DateTime<Utc>, BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.reclaim_expired(now);
        let held = state
            .leases
            .get_mut(&lease.token)
            .ok_or(BrokerError::LeaseNotFound(lease.job_id))?;
        held.expires = now + visibility_timeout;
        held.lease.expires_at = Utc::now() + chrono::Duration::from_std(visibility_timeout).unwrap_or_default();
        Ok(held.lease.expires_at)
    }

    async fn depth(&self, queue: QueueClass) -> Result<QueueDepth, BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.promote_due(queue, now);
        let in_flight = state.leases.values().filter(|h| h.lease.queue == queue).count();
        let q = state.queue(queue);
        Ok(QueueDepth {
            ready: q.ready.len(),
            delayed: q.delayed.len(),
            in_flight,
        })
    }

    async fn pending(&self, queue: QueueClass, limit: usize) -> Result<Vec<JobEnvelope>, BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.promote_due(queue, now);
        let seqs: Vec<u64> = state
            .queue(queue)
            .ready
            .iter()
            .take(limit)
            .map(|(_, seq)| *seq)
            .collect();
        Ok(seqs
            .into_iter()
            .filter_map(|seq| state.entries.get(&seq).map(|s| s.envelope.clone()))
            .collect())
    }

    async fn scheduled(&self, limit: usize) -> Result<Vec<JobEnvelope>, BrokerError> {
        let state = self.state.lock();
        let mut delayed: Vec<(Instant, u64)> = state
            .queues
            .values()
            .flat_map(|q| q.delayed.iter().copied())
            .collect();
        delayed.sort();
        Ok(delayed
            .into_iter()
            .take(limit)
            .filter_map(|(_, seq)| state.entries.get(&seq).map(|s| s.envelope.clone()))
            .collect())
    }

    async fn in_flight(&self) -> Result<Vec<Leased>, BrokerError> {
        let state = self.state.lock();
        let mut leased: Vec<Leased> = state
            .leases
            .values()
            .filter_map(|held| {
                state.entries.get(&held.seq).map(|stored| Leased {
                    envelope: stored.envelope.clone(),
                    lease: held.lease.clone(),
                })
            })
            .collect();
        leased.sort_by(|a, b| a.lease.expires_at.cmp(&b.lease.expires_at));
        Ok(leased)
    }
}
