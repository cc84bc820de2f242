//! Dead-letter store: terminal records for jobs that failed permanently or
//! exhausted their retries. Nothing here is retried automatically.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use labflow_core::JobId;

use super::types::JobEnvelope;

/// Why a job was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterCode {
    Permanent,
    RetriesExhausted,
    UnknownJob,
    /// The final attempt timed out.
    Timeout,
}

impl DeadLetterCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterCode::Permanent => "permanent",
            DeadLetterCode::RetriesExhausted => "retries_exhausted",
            DeadLetterCode::UnknownJob => "unknown_job",
            DeadLetterCode::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalError {
    pub code: DeadLetterCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub envelope: JobEnvelope,
    pub error: FinalError,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(envelope: JobEnvelope, code: DeadLetterCode, message: impl Into<String>) -> Self {
        Self {
            envelope,
            error: FinalError {
                code,
                message: message.into(),
            },
            failed_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.envelope.id
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeadLetterError {
    #[error("dead letter not found: {0}")]
    NotFound(JobId),

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert a record. Returns `false` if the job is already dead-lettered.
    async fn insert(&self, record: DeadLetterRecord) -> Result<bool, DeadLetterError>;

    async fn get(&self, job_id: JobId) -> Result<Option<DeadLetterRecord>, DeadLetterError>;

    /// Newest first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError>;

    async fn remove(&self, job_id: JobId) -> Result<DeadLetterRecord, DeadLetterError>;

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, DeadLetterError>;

    async fn count(&self) -> Result<usize, DeadLetterError>;
}

/// In-memory dead-letter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<HashMap<JobId, DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, record: DeadLetterRecord) -> Result<bool, DeadLetterError> {
        let mut records = self.records.write();
        if records.contains_key(&record.job_id()) {
            return Ok(false);
        }
        records.insert(record.job_id(), record);
        Ok(true)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<DeadLetterRecord>, DeadLetterError> {
        Ok(self.records.read().get(&job_id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let mut records: Vec<DeadLetterRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn remove(&self, job_id: JobId) -> Result<DeadLetterRecord, DeadLetterError> {
        self.records
            .write()
            .remove(&job_id)
            .ok_or(DeadLetterError::NotFound(job_id))
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, DeadLetterError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| r.failed_at >= cutoff);
        Ok(before - records.len())
    }

    async fn count(&self) -> Result<usize, DeadLetterError> {
        Ok(self.records.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_is_idempotent_per_job() {
        let store = InMemoryDeadLetterStore::new();
        let env = JobEnvelope::new("report", serde_json::json!({}));

        assert!(store
            .insert(DeadLetterRecord::new(env.clone(), DeadLetterCode::Permanent, "bad input"))
            .await
            .unwrap());
        assert!(!store
            .insert(DeadLetterRecord::new(env.clone(), DeadLetterCode::RetriesExhausted, "again"))
            .await
            .unwrap());

        assert_eq!(store.count().await.unwrap(), 1);
        let record = store.get(env.id).await.unwrap().unwrap();
        assert_eq!(record.error.code, DeadLetterCode::Permanent);
    }

    #[tokio::test]
    async fn purge_and_remove() {
        let store = InMemoryDeadLetterStore::new();
        let mut old = DeadLetterRecord::new(
            JobEnvelope::new("a", serde_json::Value::Null),
            DeadLetterCode::UnknownJob,
            "no handler",
        );
        old.failed_at = Utc::now() - chrono::Duration::days(30);
        let fresh = DeadLetterRecord::new(
            JobEnvelope::new("b", serde_json::Value::Null),
            DeadLetterCode::Timeout,
            "slow",
        );
        let fresh_id = fresh.job_id();
        store.insert(old).await.unwrap();
        store.insert(fresh).await.unwrap();

        let purged = store
            .purge_older_than(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        assert_eq!(store.remove(fresh_id).await.unwrap().job_id(), fresh_id);
        assert_eq!(store.remove(fresh_id).await, Err(DeadLetterError::NotFound(fresh_id)));
    }
}
