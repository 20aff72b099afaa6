//! Two-phase distributed transactions (§3, §4.4): the `Transaction` value,
//! its states, and the two concurrency/three isolation axes. The manager
//! and recovery protocol live in sibling modules.

pub mod manager;
pub mod recovery;

use std::collections::{HashMap, HashSet};

use serde_derive::{Deserialize, Serialize};

use crate::entry::EntryValue;
use crate::net::message::{ReadVersion, WriteOp};
use crate::topology::NodeId;
use crate::version::CacheVersion;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyMode {
    Optimistic,
    Pessimistic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

pub struct Transaction {
    pub id: CacheVersion,
    pub coordinator: NodeId,
    pub concurrency: ConcurrencyMode,
    pub isolation: IsolationLevel,
    pub state: TxState,
    pub write_set: HashMap<Vec<u8>, EntryValue>,
    pub read_set: HashMap<Vec<u8>, CacheVersion>,
    pub participants: HashSet<NodeId>,
    pub timeout_millis: u64,
}

impl Transaction {
    pub fn new(id: CacheVersion, coordinator: NodeId, concurrency: ConcurrencyMode, isolation: IsolationLevel, timeout_millis: u64) -> Self {
        Transaction {
            id,
            coordinator,
            concurrency,
            isolation,
            state: TxState::Active,
            write_set: HashMap::new(),
            read_set: HashMap::new(),
            participants: HashSet::new(),
            timeout_millis,
        }
    }

    pub fn stage_write(&mut self, key: Vec<u8>, value: EntryValue) {
        self.write_set.insert(key, value);
    }

    pub fn record_read(&mut self, key: Vec<u8>, version: CacheVersion) {
        self.read_set.entry(key).or_insert(version);
    }

    pub fn write_ops(&self) -> Vec<WriteOp> {
        self.write_set.iter().map(|(k, v)| WriteOp { key: k.clone(), value: v.clone() }).collect()
    }

    pub fn read_versions(&self) -> Vec<ReadVersion> {
        self.read_set.iter().map(|(k, v)| ReadVersion { key: k.clone(), version: *v }).collect()
    }

    /// Requires a lock (not just a buffered read) under pessimistic mode for
    /// every read, and under any mode for REPEATABLE_READ/SERIALIZABLE reads.
    pub fn read_requires_lock(&self) -> bool {
        self.concurrency == ConcurrencyMode::Pessimistic || self.isolation != IsolationLevel::ReadCommitted
    }
}

/// Lock acquisition order for a transaction's key set: `(partition, hash(key))`
/// ascending, per §4.4 — both pessimistic deadlock avoidance between the
/// locally-held keys and optimistic prepare's per-recipient canonical order
/// rely on this.
pub fn canonical_lock_order(partition: crate::topology::PartitionId, key: &[u8]) -> (crate::topology::PartitionId, u64) {
    (partition, fnv1a64(key))
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
