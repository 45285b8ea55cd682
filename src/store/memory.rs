use super::distributed::{SharedStore, TxOutcome, Write};
use crate::clock::{Clock, WallClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at_millis: u64,
    version: u64,
}

// Full sweeps of expired entries run at most this often, triggered by writes.
const SWEEP_INTERVAL_MILLIS: u64 = 1_000;

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    next_version: u64,
    next_sweep_millis: u64,
}

impl Entries {
    /// Live entry for `key`; an expired one is dropped on the spot.
    fn live(&mut self, key: &str, now_millis: u64) -> Option<&Entry> {
        if self.map.get(key).is_some_and(|entry| entry.expires_at_millis <= now_millis) {
            self.map.remove(key);
        }
        self.map.get(key)
    }

    fn sweep(&mut self, now_millis: u64) {
        if now_millis < self.next_sweep_millis {
            return;
        }
        self.next_sweep_millis = now_millis.saturating_add(SWEEP_INTERVAL_MILLIS);
        self.map.retain(|_, entry| entry.expires_at_millis > now_millis);
    }

    fn put(&mut self, key: String, value: String, ttl: Duration, now_millis: u64) {
        self.sweep(now_millis);
        self.next_version += 1;
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let entry = Entry {
            value,
            expires_at_millis: now_millis.saturating_add(ttl),
            version: self.next_version,
        };
        self.map.insert(key, entry);
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    latency_millis: AtomicU64,
    forced_conflicts: AtomicU32,
}

/// Shared store living in this process.
///
/// Entries expire like Redis keys: an expired entry is dropped when it is next read,
/// and writes periodically sweep out the ones nobody reads again. Transactions abort
/// when a watched entry was rewritten between read and commit. Clones share state, so several
/// [`DistributedBucketStore`](super::DistributedBucketStore)s built on clones behave like
/// gateway instances sharing one server.
///
/// Fault hooks ([`set_unavailable`](Self::set_unavailable),
/// [`set_latency`](Self::set_latency), [`conflict_next`](Self::conflict_next)) let
/// callers rehearse store outages.
#[derive(Debug, Clone)]
pub struct InMemorySharedStore {
    entries: Arc<Mutex<Entries>>,
    faults: Arc<Faults>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            faults: Arc::new(Faults::default()),
            clock: Arc::new(WallClock),
        }
    }

    /// Override the clock used for expiry.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Make every call fail with [`StoreError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.faults.latency_millis.store(millis, Ordering::SeqCst);
    }

    /// Abort the next `n` transactions that try to commit, as if another writer won.
    pub fn conflict_next(&self, n: u32) {
        self.faults.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Current value of `key`, ignoring fault hooks.
    pub fn raw(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        self.lock().live(key, now).map(|entry| entry.value.clone())
    }

    /// Write a value directly, outside any transaction. Bumps the entry's version.
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Duration) {
        let now = self.clock.now_millis();
        self.lock().put(key.to_string(), value.to_string(), ttl, now);
    }

    /// Number of entries held, counting expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// Whether no entry is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Version stamp of a live entry; changes on every write.
    pub fn version_of(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        self.lock().live(key, now).map(|entry| entry.version)
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn round_trip(&self) -> Result<(), StoreError> {
        let latency = self.faults.latency_millis.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory store switched off"));
        }
        Ok(())
    }

    fn take_forced_conflict(&self) -> bool {
        self.faults
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.round_trip().await?;
        Ok(self.raw(key))
    }

    async fn transact<F>(&self, keys: &[String], plan: F) -> Result<TxOutcome, StoreError>
    where
        F: FnOnce(Vec<Option<String>>) -> Option<Vec<Write>> + Send + 'static,
    {
        self.round_trip().await?;

        let (values, watched): (Vec<Option<String>>, Vec<Option<u64>>) = {
            let now = self.clock.now_millis();
            let mut entries = self.lock();
            keys.iter()
                .map(|key| match entries.live(key, now) {
                    Some(entry) => (Some(entry.value.clone()), Some(entry.version)),
                    None => (None, None),
                })
                .unzip()
        };

        // let other transactions interleave between read and commit
        tokio::task::yield_now().await;

        let Some(writes) = plan(values) else {
            return Ok(TxOutcome::Released);
        };
        if self.take_forced_conflict() {
            return Ok(TxOutcome::Conflict);
        }

        let now = self.clock.now_millis();
        let mut entries = self.lock();
        let unchanged = keys
            .iter()
            .zip(&watched)
            .all(|(key, seen)| entries.live(key, now).map(|entry| entry.version) == *seen);
        if !unchanged {
            return Ok(TxOutcome::Conflict);
        }
        for write in writes {
            entries.put(write.key, write.value, write.ttl, now);
        }
        Ok(TxOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn write(key: &str, value: &str) -> Write {
        Write { key: key.into(), value: value.into(), ttl: Duration::from_secs(10) }
    }

    #[tokio::test]
    async fn commit_applies_writes_with_ttl() {
        let clock = ManualClock::starting_at(0);
        let store = InMemorySharedStore::new().with_clock(clock.clone());
        let keys = vec!["a".to_string(), "b".to_string()];

        let outcome = store
            .transact(&keys, |values| {
                assert_eq!(values, vec![None, None]);
                Some(vec![write("a", "1"), write("b", "2")])
            })
            .await
            .unwrap();
        assert_eq!(outcome, TxOutcome::Committed);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn plan_returning_none_releases() {
        let store = InMemorySharedStore::new();
        store.insert_raw("a", "x", Duration::from_secs(10));
        let version = store.version_of("a");
        let outcome = store.transact(&["a".to_string()], |_| None).await.unwrap();
        assert_eq!(outcome, TxOutcome::Released);
        assert_eq!(store.version_of("a"), version);
    }

    #[tokio::test]
    async fn concurrent_write_aborts_commit() {
        let store = InMemorySharedStore::new();
        let intruder = store.clone();
        let outcome = store
            .transact(&["a".to_string()], move |_| {
                intruder.insert_raw("a", "theirs", Duration::from_secs(10));
                Some(vec![write("a", "ours")])
            })
            .await
            .unwrap();
        assert_eq!(outcome, TxOutcome::Conflict);
        assert_eq!(store.raw("a").as_deref(), Some("theirs"));
    }

    #[tokio::test]
    async fn forced_conflicts_count_down() {
        let store = InMemorySharedStore::new();
        store.conflict_next(1);
        let keys = ["a".to_string()];
        let first = store.transact(&keys, |_| Some(vec![write("a", "1")])).await.unwrap();
        let second = store.transact(&keys, |_| Some(vec![write("a", "2")])).await.unwrap();
        assert_eq!(first, TxOutcome::Conflict);
        assert_eq!(second, TxOutcome::Committed);
        assert_eq!(store.raw("a").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn expired_entries_are_reclaimed() {
        let clock = ManualClock::starting_at(0);
        let store = InMemorySharedStore::new().with_clock(clock.clone());
        for i in 0..1_000 {
            store.insert_raw(&format!("k{i}"), "1", Duration::from_secs(1));
        }
        assert_eq!(store.len(), 1_000);

        clock.advance(Duration::from_secs(3_600));
        // a read drops the entry it finds expired
        assert_eq!(store.get("k0").await.unwrap(), None);
        assert_eq!(store.len(), 999);

        // the next write sweeps the rest
        store.insert_raw("fresh", "1", Duration::from_secs(1));
        assert_eq!(store.len(), 1);
        assert_eq!(store.raw("fresh").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn sweep_keeps_live_entries() {
        let clock = ManualClock::starting_at(0);
        let store = InMemorySharedStore::new().with_clock(clock.clone());
        store.insert_raw("short", "1", Duration::from_secs(1));
        store.insert_raw("long", "2", Duration::from_secs(60));

        clock.advance(Duration::from_secs(2));
        store.insert_raw("fresh", "3", Duration::from_secs(60));
        assert_eq!(store.len(), 2);
        assert_eq!(store.raw("long").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = InMemorySharedStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get("a").await, Err(StoreError::Unavailable(_))));
        let result = store.transact(&["a".to_string()], |_| None).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
