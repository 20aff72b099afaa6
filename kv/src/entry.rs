//! The per-key entry data model (§3): the value a partition stores, the
//! near-cache replica of it, and the bookkeeping each carries.

use std::collections::HashSet;

use bytes::Bytes;
use serde_derive::{Deserialize, Serialize};

use crate::topology::NodeId;
use crate::version::CacheVersion;

/// A stored value, or a tombstone recording that a key was removed. The
/// tombstone itself carries a version so a stale supply/demand batch can
/// never resurrect a value that was already removed at a higher version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryValue {
    Value(#[serde(with = "serde_bytes")] Vec<u8>),
    Tombstone,
}

impl EntryValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            EntryValue::Value(v) => Some(v.as_slice()),
            EntryValue::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, EntryValue::Tombstone)
    }
}

impl From<Vec<u8>> for EntryValue {
    fn from(v: Vec<u8>) -> Self {
        EntryValue::Value(v)
    }
}

impl From<Bytes> for EntryValue {
    fn from(v: Bytes) -> Self {
        EntryValue::Value(v.to_vec())
    }
}

/// One key's state in the entry store: the value, its version, an optional
/// TTL deadline (wall-clock millis), and the exclusive-lock holder, if any.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub value: EntryValue,
    pub version: CacheVersion,
    pub expire_at_millis: Option<u64>,
    /// The transaction version currently holding the per-entry lock, set by
    /// pessimistic lock-at-first-reference (§5) and cleared at finish.
    pub locked_by: Option<CacheVersion>,
}

impl Entry {
    pub fn new(value: EntryValue, version: CacheVersion) -> Self {
        Entry { value, version, expire_at_millis: None, locked_by: None }
    }

    pub fn with_ttl(mut self, expire_at_millis: u64) -> Self {
        self.expire_at_millis = Some(expire_at_millis);
        self
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expire_at_millis.map(|deadline| now_millis >= deadline).unwrap_or(false)
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

/// A key's opportunistic replica at a node that isn't a partition owner
/// (§3's near cache). Readers are tracked so the owning primary can send
/// targeted invalidations instead of broadcasting on every write.
#[derive(Clone, Debug)]
pub struct NearEntry {
    pub value: EntryValue,
    pub version: CacheVersion,
    pub last_access_millis: u64,
}

impl NearEntry {
    pub fn new(value: EntryValue, version: CacheVersion, now_millis: u64) -> Self {
        NearEntry { value, version, last_access_millis: now_millis }
    }

    /// A near entry is only useful while it isn't behind the primary's
    /// version; a stale replica must be dropped rather than served.
    pub fn is_fresh_for(&self, primary_version: &CacheVersion) -> bool {
        self.version >= *primary_version
    }
}

/// The set of nodes holding a near-cache replica of one key, kept at the
/// primary so invalidation on write can target exactly those readers.
#[derive(Clone, Debug, Default)]
pub struct Readers {
    nodes: HashSet<NodeId>,
}

impl Readers {
    pub fn new() -> Self {
        Readers::default()
    }

    pub fn add(&mut self, node: NodeId) {
        self.nodes.insert(node);
    }

    pub fn remove(&mut self, node: NodeId) {
        self.nodes.remove(&node);
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
