//! Bounded history of execution attempts for the operator surface.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use labflow_core::JobId;

use super::types::{ExecutionOutcome, QueueClass};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    pub name: String,
    pub queue: QueueClass,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: ExecutionOutcome,
    pub error: Option<String>,
}

/// Newest-N ring of execution records.
#[derive(Debug)]
pub struct ExecutionLog {
    records: Mutex<VecDeque<ExecutionRecord>>,
    capacity: usize,
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, record: ExecutionRecord) {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.records.lock().iter().rev().take(limit).cloned().collect()
    }

    /// All retained attempts of one job, oldest first.
    pub fn for_job(&self, job_id: JobId) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(job_id: JobId, attempt: u32) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            job_id,
            name: "job".into(),
            queue: QueueClass::Default,
            attempt,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            outcome: ExecutionOutcome::Success,
            error: None,
        }
    }

    #[test]
    fn keeps_newest_records() {
        let log = ExecutionLog::new(2);
        let id = JobId::new();
        log.record(record(id, 0));
        log.record(record(id, 1));
        log.record(record(id, 2));

        assert_eq!(log.len(), 2);
        let attempts: Vec<u32> = log.recent(10).iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![2, 1]);
        assert_eq!(log.for_job(id).len(), 2);
    }
}
