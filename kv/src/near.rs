//! Near cache (§3): an opportunistic, bounded replica of recently read
//! entries kept at nodes that are not the owning primary/backup. Bounded by
//! the same block-LRU machinery the entry store's eviction uses, so a hot
//! near cache can't grow without limit on a client-facing node.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::entry::{EntryValue, NearEntry};
use crate::eviction::BlockLru;
use crate::version::CacheVersion;

pub struct NearCache {
    entries: RwLock<HashMap<Vec<u8>, NearEntry>>,
    lru: RwLock<BlockLru>,
}

impl NearCache {
    pub fn new(budget_bytes: u64) -> Self {
        NearCache { entries: RwLock::new(HashMap::new()), lru: RwLock::new(BlockLru::new(budget_bytes)) }
    }

    /// Serves a locally-cached replica only if it's at least as new as
    /// `primary_version` — a near cache never serves a value it can't prove
    /// is current.
    pub fn get_if_fresh(&self, key: &[u8], primary_version: &CacheVersion) -> Option<EntryValue> {
        let entries = self.entries.read().unwrap();
        let near = entries.get(key)?;
        if near.is_fresh_for(primary_version) {
            Some(near.value.clone())
        } else {
            None
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<NearEntry> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn put(&self, key: &[u8], value: EntryValue, version: CacheVersion, now_millis: u64) {
        let block = block_id_for_key(key);
        let bytes = entry_size_bytes(key, &value);
        self.entries.write().unwrap().insert(key.to_vec(), NearEntry::new(value, version, now_millis));
        self.lru.write().unwrap().on_put(block, bytes);
        self.sweep_evicted();
    }

    /// Drops the replica outright — called on an invalidation push from the
    /// owning primary after that key was written elsewhere.
    pub fn invalidate(&self, key: &[u8]) {
        let block = block_id_for_key(key);
        self.entries.write().unwrap().remove(key);
        self.lru.write().unwrap().on_remove(block);
    }

    fn sweep_evicted(&self) {
        let (evicted, _) = self.lru.write().unwrap().evict_while_over_budget();
        if evicted.is_empty() {
            return;
        }
        let evicted: std::collections::HashSet<_> = evicted.into_iter().collect();
        self.entries.write().unwrap().retain(|key, _| !evicted.contains(&block_id_for_key(key)));
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One near-cache key maps to exactly one eviction block; a finer block
/// granularity buys nothing here since there's no shared backing page to
/// amortize, unlike disk-backed storage.
fn block_id_for_key(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in key {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn entry_size_bytes(key: &[u8], value: &EntryValue) -> u64 {
    (key.len() + value.as_bytes().map(|v| v.len()).unwrap_or(0)) as u64
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(order: u64) -> CacheVersion {
        CacheVersion { top_ver: 1, global_time: order, order, node_order: 1 }
    }

    #[test]
    fn stale_replica_is_not_served() {
        let cache = NearCache::new(1024);
        cache.put(b"a", EntryValue::Value(vec![1]), v(1), 0);
        assert!(cache.get_if_fresh(b"a", &v(2)).is_none());
        assert!(cache.get_if_fresh(b"a", &v(1)).is_some());
    }

    #[test]
    fn invalidate_removes_the_replica() {
        let cache = NearCache::new(1024);
        cache.put(b"a", EntryValue::Value(vec![1]), v(1), 0);
        cache.invalidate(b"a");
        assert!(cache.get(b"a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_is_bounded_by_its_budget() {
        let cache = NearCache::new(16);
        for i in 0..50u32 {
            let key = i.to_le_bytes();
            cache.put(&key, EntryValue::Value(vec![0u8; 8]), v(i as u64), 0);
        }
        assert!(cache.len() < 50, "eviction must have kept the cache bounded");
    }
}
