//! Durable schedule state with per-entry exclusive leases.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ScheduleEntry, ScheduleError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleLease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Persistence contract for the beat.
///
/// Fire protocol per due time: `begin_fire` records the intent, the job is
/// enqueued with a key derived from the due time, then `commit_fire`
/// advances `last_fired_at` and clears the intent. Both fire calls require
/// the caller to hold the entry's lease.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ScheduleEntry>, ScheduleError>;

    async fn get(&self, name: &str) -> Result<Option<ScheduleEntry>, ScheduleError>;

    /// Insert a new entry, or update the definition of an existing one while
    /// keeping its firing progress.
    async fn upsert_entry(&self, entry: ScheduleEntry) -> Result<(), ScheduleError>;

    async fn remove_entry(&self, name: &str) -> Result<bool, ScheduleError>;

    async fn begin_fire(&self, name: &str, holder: &str, fire_at: DateTime<Utc>) -> Result<(), ScheduleError>;

    async fn commit_fire(&self, name: &str, holder: &str, fired_at: DateTime<Utc>) -> Result<(), ScheduleError>;

    /// Take or renew the lease. `false` while another holder's lease is live.
    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError>;

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ScheduleError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    entry: ScheduleEntry,
    #[serde(default)]
    lease: Option<ScheduleLease>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ScheduleState {
    entries: BTreeMap<String, StoredEntry>,
}

impl ScheduleState {
    fn load(&self) -> Vec<ScheduleEntry> {
        self.entries.values().map(|s| s.entry.clone()).collect()
    }

    fn get(&self, name: &str) -> Option<ScheduleEntry> {
        self.entries.get(name).map(|s| s.entry.clone())
    }

    fn upsert(&mut self, entry: ScheduleEntry) {
        match self.entries.get_mut(&entry.name) {
            Some(stored) => stored.entry.redefine(entry),
            None => {
                self.entries
                    .insert(entry.name.clone(), StoredEntry { entry, lease: None });
            }
        }
    }

    fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    fn held(&mut self, name: &str, holder: &str) -> Result<&mut StoredEntry, ScheduleError> {
        let stored = self
            .entries
            .get_mut(name)
            .ok_or_else(|| ScheduleError::UnknownEntry(name.to_string()))?;
        match &stored.lease {
            Some(lease) if lease.holder == holder => Ok(stored),
            _ => Err(ScheduleError::LeaseLost {
                entry: name.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    fn begin_fire(&mut self, name: &str, holder: &str, fire_at: DateTime<Utc>) -> Result<(), ScheduleError> {
        let stored = self.held(name, holder)?;
        stored.entry.pending_fire = Some(fire_at);
        Ok(())
    }

    fn commit_fire(&mut self, name: &str, holder: &str, fired_at: DateTime<Utc>) -> Result<(), ScheduleError> {
        let stored = self.held(name, holder)?;
        let entry = &mut stored.entry;
        if entry.last_fired_at.is_none_or(|last| last < fired_at) {
            entry.last_fired_at = Some(fired_at);
        }
        if entry.pending_fire.is_some_and(|p| p <= fired_at) {
            entry.pending_fire = None;
        }
        Ok(())
    }

    fn acquire(&mut self, name: &str, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool, ScheduleError> {
        let stored = self
            .entries
            .get_mut(name)
            .ok_or_else(|| ScheduleError::UnknownEntry(name.to_string()))?;
        if let Some(lease) = &stored.lease {
            if lease.holder != holder && lease.expires_at > now {
                return Ok(false);
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        stored.lease = Some(ScheduleLease {
            holder: holder.to_string(),
            expires_at: now + ttl,
        });
        Ok(true)
    }

    fn release(&mut self, name: &str, holder: &str) {
        if let Some(stored) = self.entries.get_mut(name) {
            if stored.lease.as_ref().is_some_and(|l| l.holder == holder) {
                stored.lease = None;
            }
        }
    }
}

/// Process-local store. Survives scheduler restarts within one process,
/// which is what tests and single-node development need.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    state: Mutex<ScheduleState>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease(&self, name: &str) -> Option<ScheduleLease> {
        self.state.lock().entries.get(name).and_then(|s| s.lease.clone())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn load(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        Ok(self.state.lock().load())
    }

    async fn get(&self, name: &str) -> Result<Option<ScheduleEntry>, ScheduleError> {
        Ok(self.state.lock().get(name))
    }

    async fn upsert_entry(&self, entry: ScheduleEntry) -> Result<(), ScheduleError> {
        entry.cron()?;
        self.state.lock().upsert(entry);
        Ok(())
    }

    async fn remove_entry(&self, name: &str) -> Result<bool, ScheduleError> {
        Ok(self.state.lock().remove(name))
    }

    async fn begin_fire(&self, name: &str, holder: &str, fire_at: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.state.lock().begin_fire(name, holder, fire_at)
    }

    async fn commit_fire(&self, name: &str, holder: &str, fired_at: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.state.lock().commit_fire(name, holder, fired_at)
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        self.state.lock().acquire(name, holder, ttl, now)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ScheduleError> {
        self.state.lock().release(name, holder);
        Ok(())
    }
}

/// JSON state file, rewritten through a temp file and rename on every
/// mutation so a crash leaves either the old or the new state on disk.
///
/// Mutations hold an OS lock on a sidecar `.lock` file and re-read the state
/// under it, so leases stay exclusive across processes sharing the path.
#[derive(Debug)]
pub struct FileScheduleStore {
    path: PathBuf,
    lock_path: PathBuf,
    writer: tokio::sync::Mutex<()>,
}

async fn read_state(path: &Path) -> Result<ScheduleState, ScheduleError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) if raw.trim().is_empty() => Ok(ScheduleState::default()),
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ScheduleState::default()),
        Err(e) => Err(e.into()),
    }
}

impl FileScheduleStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ScheduleError> {
        let path = path.as_ref().to_path_buf();
        let state = read_state(&path).await?;
        tracing::debug!(path = %path.display(), entries = state.entries.len(), "schedule state loaded");
        Ok(Self {
            lock_path: path.with_extension("lock"),
            path,
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block (off the runtime) until this process owns the lock file.
    /// Dropping the returned handle closes it and releases the lock.
    async fn acquire_file_lock(&self) -> Result<std::fs::File, ScheduleError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let lock_path = self.lock_path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(file)
    }

    async fn persist(&self, state: &ScheduleState) -> Result<(), ScheduleError> {
        let json = serde_json::to_string_pretty(state)?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Apply `f` to the freshest on-disk state and persist the result, all
    /// under the cross-process lock.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut ScheduleState) -> Result<T, ScheduleError>,
    ) -> Result<T, ScheduleError> {
        let _local = self.writer.lock().await;
        let _lock = self.acquire_file_lock().await?;
        let mut state = read_state(&self.path).await?;
        let out = f(&mut state)?;
        self.persist(&state).await?;
        Ok(out)
    }
}

#[async_trait]
impl ScheduleStore for FileScheduleStore {
    async fn load(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        Ok(read_state(&self.path).await?.load())
    }

    async fn get(&self, name: &str) -> Result<Option<ScheduleEntry>, ScheduleError> {
        Ok(read_state(&self.path).await?.get(name))
    }

    async fn upsert_entry(&self, entry: ScheduleEntry) -> Result<(), ScheduleError> {
        entry.cron()?;
        self.mutate(|s| {
            s.upsert(entry);
            Ok(())
        })
        .await
    }

    async fn remove_entry(&self, name: &str) -> Result<bool, ScheduleError> {
        self.mutate(|s| Ok(s.remove(name))).await
    }

    async fn begin_fire(&self, name: &str, holder: &str, fire_at: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.mutate(|s| s.begin_fire(name, holder, fire_at)).await
    }

    async fn commit_fire(&self, name: &str, holder: &str, fired_at: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.mutate(|s| s.commit_fire(name, holder, fired_at)).await
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        self.mutate(|s| s.acquire(name, holder, ttl, now)).await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ScheduleError> {
        self.mutate(|s| {
            s.release(name, holder);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn entry() -> ScheduleEntry {
        ScheduleEntry::new("sweep", "*/5 * * * *", "mark_stale_devices_offline").created_at(t0())
    }

    #[tokio::test]
    async fn leases_are_exclusive_until_expiry() {
        let store = InMemoryScheduleStore::new();
        store.upsert_entry(entry()).await.unwrap();
        let ttl = Duration::from_secs(90);

        assert!(store.acquire_lease("sweep", "a", ttl, t0()).await.unwrap());
        assert!(!store.acquire_lease("sweep", "b", ttl, t0()).await.unwrap());
        // Renewal by the holder is allowed.
        assert!(store.acquire_lease("sweep", "a", ttl, t0()).await.unwrap());

        let later = t0() + chrono::Duration::seconds(91);
        assert!(store.acquire_lease("sweep", "b", ttl, later).await.unwrap());
        assert_eq!(store.lease("sweep").unwrap().holder, "b");
    }

    #[tokio::test]
    async fn fire_protocol_requires_the_lease() {
        let store = InMemoryScheduleStore::new();
        store.upsert_entry(entry()).await.unwrap();
        let at = t0() + chrono::Duration::minutes(5);

        assert!(matches!(
            store.begin_fire("sweep", "a", at).await,
            Err(ScheduleError::LeaseLost { .. })
        ));

        store
            .acquire_lease("sweep", "a", Duration::from_secs(60), t0())
            .await
            .unwrap();
        store.begin_fire("sweep", "a", at).await.unwrap();
        assert_eq!(store.get("sweep").await.unwrap().unwrap().pending_fire, Some(at));

        store.commit_fire("sweep", "a", at).await.unwrap();
        let saved = store.get("sweep").await.unwrap().unwrap();
        assert_eq!(saved.last_fired_at, Some(at));
        assert_eq!(saved.pending_fire, None);

        store.release_lease("sweep", "a").await.unwrap();
        assert!(store.lease("sweep").is_none());
    }

    #[tokio::test]
    async fn upsert_keeps_progress() {
        let store = InMemoryScheduleStore::new();
        store.upsert_entry(entry()).await.unwrap();
        store
            .acquire_lease("sweep", "a", Duration::from_secs(60), t0())
            .await
            .unwrap();
        let at = t0() + chrono::Duration::minutes(5);
        store.commit_fire("sweep", "a", at).await.unwrap();

        let mut redefined = entry();
        redefined.cron_expression = "*/10 * * * *".into();
        store.upsert_entry(redefined).await.unwrap();

        let saved = store.get("sweep").await.unwrap().unwrap();
        assert_eq!(saved.cron_expression, "*/10 * * * *");
        assert_eq!(saved.last_fired_at, Some(at));
    }

    #[tokio::test]
    async fn rejects_invalid_cron() {
        let store = InMemoryScheduleStore::new();
        let bad = ScheduleEntry::new("bad", "every tuesday", "job");
        assert!(matches!(
            store.upsert_entry(bad).await,
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!("labflow-schedule-{}.json", uuid::Uuid::now_v7()));
        let at = t0() + chrono::Duration::minutes(5);
        {
            let store = FileScheduleStore::open(&path).await.unwrap();
            store.upsert_entry(entry()).await.unwrap();
            store
                .acquire_lease("sweep", "a", Duration::from_secs(60), t0())
                .await
                .unwrap();
            store.begin_fire("sweep", "a", at).await.unwrap();
        }

        let reopened = FileScheduleStore::open(&path).await.unwrap();
        let saved = reopened.get("sweep").await.unwrap().unwrap();
        assert_eq!(saved.pending_fire, Some(at));
        // The lease persisted too, so another holder must wait for expiry.
        assert!(
            !reopened
                .acquire_lease("sweep", "b", Duration::from_secs(60), t0())
                .await
                .unwrap()
        );

        let _ = tokio::fs::remove_file(&path).await;
        let _ = tokio::fs::remove_file(path.with_extension("lock")).await;
    }

    #[tokio::test]
    async fn file_leases_are_exclusive_across_instances() {
        let dir = std::env::temp_dir().join(format!("labflow-schedule-{}", uuid::Uuid::now_v7()));
        let path = dir.join("schedule.json");
        let first = FileScheduleStore::open(&path).await.unwrap();
        let second = FileScheduleStore::open(&path).await.unwrap();
        let ttl = Duration::from_secs(60);

        // Written through one instance after the other was opened.
        first.upsert_entry(entry()).await.unwrap();
        assert!(second.get("sweep").await.unwrap().is_some());

        assert!(first.acquire_lease("sweep", "a", ttl, t0()).await.unwrap());
        assert!(!second.acquire_lease("sweep", "b", ttl, t0()).await.unwrap());
        assert!(matches!(
            second.begin_fire("sweep", "b", t0()).await,
            Err(ScheduleError::LeaseLost { .. })
        ));
        first.release_lease("sweep", "a").await.unwrap();

        // Racing acquirers on both instances: exactly one wins.
        let (first, second) = (Arc::new(first), Arc::new(second));
        let mut racers = tokio::task::JoinSet::new();
        for i in 0..8 {
            let store = if i % 2 == 0 { first.clone() } else { second.clone() };
            racers.spawn(async move {
                store
                    .acquire_lease("sweep", &format!("holder-{i}"), ttl, t0())
                    .await
                    .unwrap()
            });
        }
        let mut winners = 0;
        while let Some(won) = racers.join_next().await {
            winners += usize::from(won.unwrap());
        }
        assert_eq!(winners, 1);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
