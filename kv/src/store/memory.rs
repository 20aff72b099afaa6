//! A single partition's live entries: a concurrent map guarded by one
//! `RwLock`, analogous to the teacher's single-threaded `BTreeMap` engine,
//! but sized for concurrent readers since many client requests hit the same
//! partition at once. Per-entry locking (§5 pessimistic mode) is recorded in
//! `Entry::locked_by` rather than via a second lock table, so a lock check
//! and a data read always observe a consistent pair.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::entry::{Entry, EntryValue, Readers};
use crate::version::CacheVersion;

#[derive(Default)]
pub struct PartitionMap {
    entries: RwLock<HashMap<Vec<u8>, Entry>>,
    readers: RwLock<HashMap<Vec<u8>, Readers>>,
}

impl PartitionMap {
    pub fn new() -> Self {
        PartitionMap::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peek(&self, key: &[u8]) -> Option<Entry> {
        self.entries.read().unwrap().get(key).cloned()
    }

    /// Returns `true` if the key is free or already held by `tx`, and marks
    /// it locked by `tx` as a side effect — the atomic test-and-set that
    /// pessimistic lock-at-first-reference needs.
    pub fn try_lock(&self, key: &[u8], tx: CacheVersion) -> LockOutcome {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(key.to_vec()).or_insert_with(|| Entry::new(EntryValue::Tombstone, CacheVersion::ZERO));
        match entry.locked_by {
            None => {
                entry.locked_by = Some(tx);
                LockOutcome::Acquired
            }
            Some(holder) if holder == tx => LockOutcome::AlreadyHeld,
            Some(holder) => LockOutcome::HeldBy(holder),
        }
    }

    pub fn unlock(&self, key: &[u8], tx: CacheVersion) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            if entry.locked_by == Some(tx) {
                entry.locked_by = None;
            }
        }
    }

    /// Installs a new value at `version`, clearing any lock held by `tx`.
    /// Returns the previous entry, if any, so the caller can invalidate near
    /// caches and update eviction bookkeeping.
    pub fn commit(&self, key: &[u8], value: EntryValue, version: CacheVersion, tx: Option<CacheVersion>) -> Option<Entry> {
        let mut entries = self.entries.write().unwrap();
        let previous = entries.get(key).cloned();
        let mut entry = Entry::new(value, version);
        if let (Some(prev), Some(tx)) = (&previous, tx) {
            if prev.locked_by != Some(tx) {
                // Lock was already released or never held by this tx; commit
                // still proceeds since the version comparison in the caller
                // already validated write eligibility.
            }
        }
        entry.locked_by = None;
        entries.insert(key.to_vec(), entry);
        previous
    }

    /// Optimistic-mode conflict check: true when `key`'s stored version is
    /// strictly newer than the version the transaction originally read.
    pub fn has_conflict(&self, key: &[u8], read_version: CacheVersion) -> bool {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .map(|e| e.version > read_version)
            .unwrap_or(false)
    }

    pub fn track_reader(&self, key: &[u8], node: crate::topology::NodeId) {
        self.readers.write().unwrap().entry(key.to_vec()).or_default().add(node);
    }

    pub fn untrack_reader(&self, key: &[u8], node: crate::topology::NodeId) {
        if let Some(readers) = self.readers.write().unwrap().get_mut(key) {
            readers.remove(node);
        }
    }

    /// The set of nodes to invalidate when `key` changes, consuming the
    /// tracked set — invalidation is one-shot per write, readers re-register
    /// the next time they fetch into their near cache.
    pub fn take_readers(&self, key: &[u8]) -> Readers {
        self.readers.write().unwrap().remove(key).unwrap_or_default()
    }

    pub fn iter_snapshot(&self) -> Vec<(Vec<u8>, Entry)> {
        self.entries.read().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Whether eviction may remove `key` right now: no active readers (an
    /// evicted key a remote node still thinks it's watching would silently
    /// break invalidation) and no transaction holds its lock.
    pub fn is_evictable(&self, key: &[u8]) -> bool {
        let has_readers = self.readers.read().unwrap().get(key).map(|r| !r.is_empty()).unwrap_or(false);
        if has_readers {
            return false;
        }
        !self.entries.read().unwrap().get(key).map(|e| e.is_locked()).unwrap_or(false)
    }

    /// Drops `key` entirely rather than leaving a tombstone, since eviction
    /// is a memory-pressure decision, not a write. Re-checks `is_evictable`
    /// under the write lock so a reader or lock that landed between the
    /// caller's check and this call still wins.
    pub fn evict(&self, key: &[u8]) -> bool {
        if !self.is_evictable(key) {
            return false;
        }
        let mut entries = self.entries.write().unwrap();
        match entries.get(key) {
            Some(e) if !e.is_locked() => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    AlreadyHeld,
    HeldBy(CacheVersion),
}
