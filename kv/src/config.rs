//! Cache-wide configuration (§6 ambient). Loaded from TOML via `confy` at
//! the CLI boundary and passed down as a plain struct everywhere else, so
//! the core library never depends on a config-file format.

use serde_derive::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicityMode {
    /// Single-key writes bypass the Transaction Manager entirely.
    Atomic,
    /// All writes go through the Transaction Manager, even single-key ones.
    Transactional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteSyncMode {
    FullSync,
    PrimarySync,
    FullAsync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreloadMode {
    Sync,
    Async,
}

/// Whether non-owning nodes keep a near-cache replica of keys they read.
/// `PartitionedOnly` turns the near cache off entirely: every read of a
/// key this node doesn't own goes to the primary every time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionMode {
    PartitionedOnly,
    NearPartitioned,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub partitions: u32,
    pub backups: usize,
    pub atomicity_mode: AtomicityMode,
    pub write_sync_mode: WriteSyncMode,
    pub preload_mode: PreloadMode,
    pub distribution_mode: DistributionMode,

    /// Bytes a node's entry-store + near-cache eviction budget allows before
    /// block-LRU eviction kicks in.
    pub eviction_budget_bytes: u64,
    /// Bytes reserved for near-cache replicas specifically.
    pub near_cache_budget_bytes: u64,
    /// Dual bound alongside the byte budgets above: whichever of blocks or
    /// bytes is tighter wins.
    pub eviction_max_blocks: u64,
    /// Path prefixes excluded from eviction tracking entirely (e.g. config
    /// or session keys that must never be evicted out from under a reader).
    pub eviction_exclude_paths: Vec<String>,

    pub lock_timeout_millis: u64,
    pub tx_timeout_millis: u64,
    /// How long recovery waits for CheckCommitted replies before falling
    /// back to a heuristic decision.
    pub recovery_timeout_millis: u64,

    pub demand_batch_size: usize,
    pub rebalance_throttle_millis: u64,

    pub listen_addr: String,
    pub persist_path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            partitions: 1024,
            backups: 1,
            atomicity_mode: AtomicityMode::Transactional,
            write_sync_mode: WriteSyncMode::PrimarySync,
            preload_mode: PreloadMode::Async,
            distribution_mode: DistributionMode::NearPartitioned,
            eviction_budget_bytes: 256 * 1024 * 1024,
            near_cache_budget_bytes: 32 * 1024 * 1024,
            eviction_max_blocks: 65_536,
            eviction_exclude_paths: Vec::new(),
            lock_timeout_millis: 5_000,
            tx_timeout_millis: 15_000,
            recovery_timeout_millis: 10_000,
            demand_batch_size: 512,
            rebalance_throttle_millis: 0,
            listen_addr: "127.0.0.1:7070".to_string(),
            persist_path: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = CacheConfig::default();
        assert!(cfg.partitions > 0);
        assert!(cfg.lock_timeout_millis < cfg.tx_timeout_millis);
    }
}
