//! The Entry Store: the sharded collection of per-partition maps that backs
//! every local `get`/`put`/`remove`, plus the optional write-behind path to
//! a `persist::Store`.

pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::entry::{Entry, EntryValue, Readers};
use crate::error::{CResult, Error};
use crate::eviction::{BlockId, BlockLru, EvictionOutcome};
use crate::persist::Store;
pub use crate::store::memory::LockOutcome;
use crate::store::memory::PartitionMap;
use crate::topology::{NodeId, PartitionId, PartitionState, PartitionTopology};
use crate::version::CacheVersion;

pub use crate::store::memory::LockOutcome as EntryLockOutcome;

pub struct EntryStore {
    partitions: HashMap<PartitionId, Arc<PartitionMap>>,
    persist: Option<tokio::sync::Mutex<Box<dyn Store>>>,
    topology: Option<Arc<PartitionTopology>>,
    eviction: Mutex<BlockLru>,
    /// Reverse lookup from an eviction block back to the key it bounds,
    /// since `BlockLru` only ever deals in opaque block ids.
    block_index: Mutex<HashMap<BlockId, (PartitionId, Vec<u8>)>>,
    exclude_paths: Vec<Vec<u8>>,
}

impl EntryStore {
    pub fn new(partition_count: u32) -> Self {
        let mut partitions = HashMap::with_capacity(partition_count as usize);
        for p in 0..partition_count {
            partitions.insert(p, Arc::new(PartitionMap::new()));
        }
        EntryStore {
            partitions,
            persist: None,
            topology: None,
            eviction: Mutex::new(BlockLru::new(u64::MAX)),
            block_index: Mutex::new(HashMap::new()),
            exclude_paths: Vec::new(),
        }
    }

    pub fn with_persist(mut self, store: Box<dyn Store>) -> Self {
        self.persist = Some(tokio::sync::Mutex::new(store));
        self
    }

    /// Needed only for the "partition not OWNING" eviction refusal; reads
    /// with no topology configured never refuse on that ground.
    pub fn with_topology(mut self, topology: Arc<PartitionTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_eviction(mut self, budget_bytes: u64, max_blocks: u64, exclude_paths: Vec<String>) -> Self {
        self.eviction = Mutex::new(BlockLru::new(budget_bytes).with_max_blocks(max_blocks));
        self.exclude_paths = exclude_paths.into_iter().map(String::into_bytes).collect();
        self
    }

    fn partition(&self, p: PartitionId) -> CResult<&Arc<PartitionMap>> {
        self.partitions.get(&p).ok_or(Error::NotOwner(p))
    }

    fn is_excluded(&self, key: &[u8]) -> bool {
        self.exclude_paths.iter().any(|prefix| key.starts_with(prefix.as_slice()))
    }

    fn block_for(p: PartitionId, key: &[u8]) -> BlockId {
        let mut hash: u64 = 0xcbf29ce484222325 ^ (p as u64);
        for &b in key {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }

    /// Registers that `key` was just written, moving its block to
    /// most-recently-used. Excluded paths are never tracked at all, so they
    /// can never be picked as an eviction candidate.
    fn track_put(&self, p: PartitionId, key: &[u8], bytes: u64) {
        if self.is_excluded(key) {
            return;
        }
        let block = Self::block_for(p, key);
        self.block_index.lock().unwrap().insert(block, (p, key.to_vec()));
        self.eviction.lock().unwrap().on_put(block, bytes);
    }

    /// Registers a real read of `key`, per §4.7's `onAccess`. Only called
    /// from `peek_through`'s hit branches, not from `peek`'s many internal
    /// uses (version-gate checks, rebalance bookkeeping), so LRU recency
    /// reflects actual client traffic.
    fn note_access(&self, p: PartitionId, key: &[u8], bytes: u64) {
        if self.is_excluded(key) {
            return;
        }
        let block = Self::block_for(p, key);
        self.block_index.lock().unwrap().insert(block, (p, key.to_vec()));
        self.eviction.lock().unwrap().on_access(block, bytes);
    }

    /// Runs one eviction pass, asking the partition map to actually drop
    /// each block `BlockLru` selects. A candidate is refused — and left
    /// resident — if it has active readers, is locked by a transaction, or
    /// its partition isn't `OWNING`; `OWNING` is assumed true when no
    /// topology was configured (e.g. plain `EntryStore` unit tests).
    fn run_eviction(&self) -> EvictionOutcome {
        let topology = &self.topology;
        let partitions = &self.partitions;
        let mut index = self.block_index.lock().unwrap();
        let (evicted, outcome) = self.eviction.lock().unwrap().evict_while_over_budget_with(|block| {
            let Some((p, key)) = index.get(&block) else { return false };
            let owning = topology.as_ref().map(|t| t.state(*p) == Some(PartitionState::Owning)).unwrap_or(true);
            owning && partitions.get(p).map(|part| part.is_evictable(key)).unwrap_or(false)
        });
        for block in &evicted {
            if let Some((p, key)) = index.remove(block) {
                if let Some(part) = self.partitions.get(&p) {
                    part.evict(&key);
                }
            }
        }
        outcome
    }

    pub fn peek(&self, p: PartitionId, key: &[u8]) -> CResult<Option<Entry>> {
        Ok(self.partition(p)?.peek(key))
    }

    /// Reads through to the configured persistent store on a local miss,
    /// backfilling the entry store so the next read serves from memory.
    /// The one concrete consumer of `persist::Store::load` on the read
    /// path — write-behind already covers the write side via
    /// `persist_async`.
    pub async fn peek_through(&self, p: PartitionId, key: &[u8]) -> CResult<Option<Entry>> {
        if let Some(entry) = self.peek(p, key)? {
            self.note_access(p, key, entry_size_bytes(key, &entry.value));
            return Ok(Some(entry));
        }
        let Some(persist) = &self.persist else { return Ok(None) };
        let loaded = {
            let mut store = persist.lock().await;
            store.load(key)?
        };
        let Some(bytes) = loaded else { return Ok(None) };

        let part = self.partition(p)?;
        // A concurrent writer may have raced in while the disk read was in
        // flight; never clobber a value that's already resident.
        if let Some(existing) = part.peek(key) {
            self.note_access(p, key, entry_size_bytes(key, &existing.value));
            return Ok(Some(existing));
        }
        let entry = Entry::new(EntryValue::Value(bytes), CacheVersion::ZERO);
        part.commit(key, entry.value.clone(), entry.version, None);
        self.track_put(p, key, entry_size_bytes(key, &entry.value));
        Ok(Some(entry))
    }

    pub fn try_lock(&self, p: PartitionId, key: &[u8], tx: CacheVersion) -> CResult<LockOutcome> {
        Ok(self.partition(p)?.try_lock(key, tx))
    }

    pub fn unlock(&self, p: PartitionId, key: &[u8], tx: CacheVersion) -> CResult<()> {
        self.partition(p)?.unlock(key, tx);
        Ok(())
    }

    pub fn has_conflict(&self, p: PartitionId, key: &[u8], read_version: CacheVersion) -> CResult<bool> {
        Ok(self.partition(p)?.has_conflict(key, read_version))
    }

    /// Installs a value, clearing the lock held by `tx` if any, and returns
    /// the displaced readers so the caller can send targeted invalidations.
    /// Does not touch the write-behind store; call `persist_async` for that.
    pub fn commit(
        &self,
        p: PartitionId,
        key: &[u8],
        value: EntryValue,
        version: CacheVersion,
        tx: Option<CacheVersion>,
    ) -> CResult<(Option<Entry>, Readers)> {
        let part = self.partition(p)?;
        let bytes = entry_size_bytes(key, &value);
        let previous = part.commit(key, value, version, tx);
        let readers = part.take_readers(key);
        self.track_put(p, key, bytes);
        if self.run_eviction() == EvictionOutcome::Stall {
            return Err(Error::EvictStall);
        }
        Ok((previous, readers))
    }

    pub fn track_reader(&self, p: PartitionId, key: &[u8], node: NodeId) -> CResult<()> {
        self.partition(p)?.track_reader(key, node);
        Ok(())
    }

    pub fn untrack_reader(&self, p: PartitionId, key: &[u8], node: NodeId) -> CResult<()> {
        self.partition(p)?.untrack_reader(key, node);
        Ok(())
    }

    pub fn partition_len(&self, p: PartitionId) -> CResult<usize> {
        Ok(self.partition(p)?.len())
    }

    pub fn total_entries(&self) -> usize {
        self.partitions.values().map(|p| p.len()).sum()
    }

    /// All live key/entry pairs in a partition, used by the preloader to
    /// build supply batches.
    pub fn iter_partition(&self, p: PartitionId) -> CResult<Vec<(Vec<u8>, Entry)>> {
        Ok(self.partition(p)?.iter_snapshot())
    }

    /// Applies a batch of entries received from a supply stream, keeping
    /// only the entries whose version dominates what's already stored
    /// (§7's version-gated apply — a demand batch retried after a partial
    /// failure must never regress an entry that already advanced).
    pub fn apply_batch(&self, p: PartitionId, batch: Vec<(Vec<u8>, Entry)>) -> CResult<usize> {
        let part = self.partition(p)?;
        let mut applied = 0;
        for (key, incoming) in batch {
            let should_apply = match part.peek(&key) {
                Some(existing) => incoming.version > existing.version,
                None => true,
            };
            if should_apply {
                let bytes = entry_size_bytes(&key, &incoming.value);
                part.commit(&key, incoming.value, incoming.version, None);
                self.track_put(p, &key, bytes);
                applied += 1;
            }
        }
        // One pass for the whole batch rather than per-entry: a partition
        // mid-rebalance is about to flip to OWNING, so there's no refusal
        // benefit to checking after every single entry.
        let _ = self.run_eviction();
        Ok(applied)
    }

    pub async fn persist_async(&self, key: &[u8], value: &EntryValue) -> CResult<()> {
        let Some(persist) = &self.persist else { return Ok(()) };
        let mut store = persist.lock().await;
        match value {
            EntryValue::Value(bytes) => store.put(key, bytes.clone()),
            EntryValue::Tombstone => store.remove(key),
        }
    }

    pub async fn warm_from_persist(&self, affinity: &crate::affinity::AffinityFunction) -> CResult<usize> {
        let Some(persist) = &self.persist else { return Ok(0) };
        let mut store = persist.lock().await;
        let pairs = store.load_all()?;
        let mut loaded = 0;
        for (key, value) in pairs {
            let p = affinity.partition_for_key(&key);
            if let Some(part) = self.partitions.get(&p) {
                let bytes = entry_size_bytes(&key, &EntryValue::Value(value.clone()));
                part.commit(&key, EntryValue::Value(value), CacheVersion::ZERO, None);
                self.track_put(p, &key, bytes);
                loaded += 1;
            }
        }
        let _ = self.run_eviction();
        Ok(loaded)
    }
}

fn entry_size_bytes(key: &[u8], value: &EntryValue) -> u64 {
    (key.len() + value.as_bytes().map(|v| v.len()).unwrap_or(0)) as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commit_returns_previous_value_and_displaced_readers() {
        let store = EntryStore::new(4);
        store.track_reader(0, b"a", 2).unwrap();
        let v1 = CacheVersion { top_ver: 1, global_time: 1, order: 1, node_order: 1 };
        let (prev, readers) = store.commit(0, b"a", EntryValue::Value(vec![1]), v1, None).unwrap();
        assert!(prev.is_none());
        assert_eq!(readers.iter().count(), 1);
    }

    #[test]
    fn apply_batch_only_advances_entries_with_a_newer_version() {
        let store = EntryStore::new(4);
        let v1 = CacheVersion { top_ver: 1, global_time: 1, order: 1, node_order: 1 };
        let v2 = CacheVersion { top_ver: 1, global_time: 2, order: 2, node_order: 1 };
        store.commit(0, b"a", EntryValue::Value(vec![9]), v2, None).unwrap();

        let applied = store
            .apply_batch(0, vec![(b"a".to_vec(), Entry::new(EntryValue::Value(vec![1]), v1))])
            .unwrap();
        assert_eq!(applied, 0, "stale batch entry must not regress a newer local value");
        assert_eq!(store.peek(0, b"a").unwrap().unwrap().value, EntryValue::Value(vec![9]));
    }

    #[test]
    fn unknown_partition_returns_not_owner() {
        let store = EntryStore::new(1);
        assert!(store.peek(5, b"a").is_err());
    }

    #[tokio::test]
    async fn peek_through_backfills_from_persist_on_a_local_miss() {
        let mut disk = crate::persist::memory::MemoryStore::new();
        disk.put(b"a", vec![9, 9]).unwrap();
        let store = EntryStore::new(4).with_persist(Box::new(disk));

        assert!(store.peek(0, b"a").unwrap().is_none(), "not resident in memory yet");
        let entry = store.peek_through(0, b"a").await.unwrap().unwrap();
        assert_eq!(entry.value, EntryValue::Value(vec![9, 9]));

        // Backfilled into memory, so a second read never touches the store.
        assert_eq!(store.peek(0, b"a").unwrap().unwrap().value, EntryValue::Value(vec![9, 9]));
    }

    #[tokio::test]
    async fn peek_through_is_a_plain_miss_with_no_persist_configured() {
        let store = EntryStore::new(4);
        assert!(store.peek_through(0, b"a").await.unwrap().is_none());
    }

    fn v(order: u64) -> CacheVersion {
        CacheVersion { top_ver: 1, global_time: order, order, node_order: 1 }
    }

    // Equivalent to the literal "LRU bound under puts" scenario: maxBlocks=3,
    // put k1..k5 each one block with no pinning; after quiescence exactly 3
    // blocks are resident and they're the 3 most-recently put keys.
    #[test]
    fn eviction_bounds_the_entry_store_by_block_count() {
        let store = EntryStore::new(1).with_eviction(1024 * 1024, 3, Vec::new());
        for i in 1..=5u64 {
            store.commit(0, format!("k{i}").as_bytes(), EntryValue::Value(vec![0u8; 4]), v(i), None).unwrap();
        }

        let resident: Vec<u8> = (1..=5u64)
            .filter(|i| store.peek(0, format!("k{i}").as_bytes()).unwrap().is_some())
            .map(|i| i as u8)
            .collect();
        assert_eq!(resident, vec![3, 4, 5], "only the 3 most-recently put keys should survive");
    }

    // Continuation of the scenario above: touching k3 (a real read, via
    // `peek_through`) then putting k6 evicts the now-tail (k4), not k3.
    #[tokio::test]
    async fn touching_a_key_protects_it_from_the_next_eviction() {
        let store = EntryStore::new(1).with_eviction(1024 * 1024, 3, Vec::new());
        for i in 1..=5u64 {
            store.commit(0, format!("k{i}").as_bytes(), EntryValue::Value(vec![0u8; 4]), v(i), None).unwrap();
        }

        store.peek_through(0, b"k3").await.unwrap();
        store.commit(0, b"k6", EntryValue::Value(vec![0u8; 4]), v(6), None).unwrap();

        assert!(store.peek(0, b"k3").unwrap().is_some(), "k3 was touched, must survive");
        assert!(store.peek(0, b"k4").unwrap().is_none(), "k4 is the true LRU tail and must be evicted");
        assert!(store.peek(0, b"k5").unwrap().is_some());
        assert!(store.peek(0, b"k6").unwrap().is_some());
    }

    #[test]
    fn excluded_paths_are_never_tracked_for_eviction() {
        let store = EntryStore::new(1).with_eviction(1024 * 1024, 1, vec!["session/".to_string()]);
        store.commit(0, b"session/admin", EntryValue::Value(vec![1]), v(1), None).unwrap();
        store.commit(0, b"k1", EntryValue::Value(vec![1]), v(2), None).unwrap();
        store.commit(0, b"k2", EntryValue::Value(vec![1]), v(3), None).unwrap();

        // maxBlocks=1 evicted k1, but never touched the excluded key.
        assert!(store.peek(0, b"session/admin").unwrap().is_some());
        assert!(store.peek(0, b"k1").unwrap().is_none());
        assert!(store.peek(0, b"k2").unwrap().is_some());
    }

    // A key with an active reader is skipped; the unprotected key absorbs
    // the eviction instead, so the write itself still succeeds.
    #[test]
    fn eviction_refuses_to_evict_a_key_with_an_active_reader() {
        let store = EntryStore::new(1).with_eviction(1024 * 1024, 1, Vec::new());
        store.commit(0, b"k1", EntryValue::Value(vec![1]), v(1), None).unwrap();
        store.track_reader(0, b"k1", 7).unwrap();

        store.commit(0, b"k2", EntryValue::Value(vec![1]), v(2), None).unwrap();

        assert!(store.peek(0, b"k1").unwrap().is_some(), "an active reader must block eviction");
        assert!(store.peek(0, b"k2").unwrap().is_none(), "k2 had no protection and absorbed the eviction instead");
    }

    #[test]
    fn eviction_refuses_to_evict_a_locked_key() {
        let store = EntryStore::new(1).with_eviction(1024 * 1024, 1, Vec::new());
        store.commit(0, b"k1", EntryValue::Value(vec![1]), v(1), None).unwrap();
        store.try_lock(0, b"k1", v(99)).unwrap();

        store.commit(0, b"k2", EntryValue::Value(vec![1]), v(2), None).unwrap();

        assert!(store.peek(0, b"k1").unwrap().is_some(), "a locked key must block eviction");
        assert!(store.peek(0, b"k2").unwrap().is_none());
    }

    #[test]
    fn eviction_refuses_a_partition_that_is_not_owning() {
        let topology = Arc::new(crate::topology::PartitionTopology::new(1, 1));
        let mut map = HashMap::new();
        map.insert(0, crate::topology::PartitionEntry { state: PartitionState::Renting, owners: vec![2] });
        topology.update(1, map);

        let store = EntryStore::new(1).with_eviction(1024 * 1024, 1, Vec::new()).with_topology(topology);
        store.commit(0, b"k1", EntryValue::Value(vec![1]), v(1), None).unwrap();
        let err = store.commit(0, b"k2", EntryValue::Value(vec![1]), v(2), None).unwrap_err();
        assert!(matches!(err, Error::EvictStall));
        assert!(store.peek(0, b"k1").unwrap().is_some(), "a RENTING partition must not be evicted from");
    }
}
