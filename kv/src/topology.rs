//! Partition topology: per-node view of `partition -> {state, owners}`.
//!
//! Readers see the map lock-free via a cloned snapshot; writers — only the
//! preloader, at an exchange barrier — take the exclusive lock. This mirrors
//! the shared-resource model in §5: "Partition map: readers lock-free via
//! versioned snapshot; writers under an exchange-scoped exclusive lock."

use std::collections::HashMap;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, RwLock};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

pub type NodeId = u32;
pub type PartitionId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    Moving,
    Owning,
    Renting,
    Evicted,
    Lost,
}

/// A partition's state plus its affinity-assigned owners, as carried on the
/// wire in `PartitionsSingle`/`PartitionsFull` (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub state: PartitionState,
    pub owners: Vec<NodeId>,
}

/// An immutable view of the partition map at one topology version. Affinity
/// is a pure function of a snapshot, never of the live topology, per the
/// one-way-ownership redesign in §9.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub top_ver: u32,
    pub partitions: Vec<PartitionEntry>,
}

impl TopologySnapshot {
    pub fn empty(partitions: u32) -> Self {
        TopologySnapshot {
            top_ver: 0,
            partitions: (0..partitions)
                .map(|_| PartitionEntry { state: PartitionState::Lost, owners: Vec::new() })
                .collect(),
        }
    }

    pub fn owners(&self, p: PartitionId) -> &[NodeId] {
        self.partitions.get(p as usize).map(|e| e.owners.as_slice()).unwrap_or(&[])
    }

    pub fn primary(&self, p: PartitionId) -> Option<NodeId> {
        self.owners(p).first().copied()
    }
}

/// An RAII pin against rent/eviction for the duration of a single operation.
/// Dropping it returns the reservation via `PartitionTopology::on_entry_removed`-style
/// bookkeeping handled internally by the counter it decrements.
pub struct Reservation {
    counter: Arc<AtomicIsize>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LocalPartition {
    entry: PartitionEntry,
    /// Active reservations + outstanding local references (open
    /// transactions, in-flight supply batches). Gates RENTING -> EVICTED,
    /// per the §9 open-question resolution recorded in DESIGN.md.
    refs: Arc<AtomicIsize>,
    entry_count: AtomicIsize,
}

/// Per-node partition lifecycle tracker.
pub struct PartitionTopology {
    local_node: NodeId,
    inner: RwLock<Inner>,
}

struct Inner {
    top_ver: u32,
    partitions: HashMap<PartitionId, LocalPartition>,
}

impl PartitionTopology {
    pub fn new(local_node: NodeId, total_partitions: u32) -> Self {
        let mut partitions = HashMap::with_capacity(total_partitions as usize);
        for p in 0..total_partitions {
            partitions.insert(
                p,
                LocalPartition {
                    entry: PartitionEntry { state: PartitionState::Lost, owners: Vec::new() },
                    refs: Arc::new(AtomicIsize::new(0)),
                    entry_count: AtomicIsize::new(0),
                },
            );
        }
        PartitionTopology { local_node, inner: RwLock::new(Inner { top_ver: 0, partitions }) }
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn current_top_ver(&self) -> u32 {
        self.inner.read().unwrap().top_ver
    }

    pub fn state(&self, p: PartitionId) -> Option<PartitionState> {
        self.inner.read().unwrap().partitions.get(&p).map(|lp| lp.entry.state)
    }

    pub fn owners(&self, p: PartitionId) -> Vec<NodeId> {
        self.inner.read().unwrap().partitions.get(&p).map(|lp| lp.entry.owners.clone()).unwrap_or_default()
    }

    /// A lock-free, point-in-time snapshot of the whole map, handed to the
    /// affinity function and to exchange messages.
    pub fn snapshot(&self) -> TopologySnapshot {
        let inner = self.inner.read().unwrap();
        let max = inner.partitions.keys().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut partitions = vec![PartitionEntry { state: PartitionState::Lost, owners: Vec::new() }; max as usize];
        for (p, lp) in inner.partitions.iter() {
            partitions[*p as usize] = lp.entry.clone();
        }
        TopologySnapshot { top_ver: inner.top_ver, partitions }
    }

    /// Pins a partition against rent/eviction for the duration of an
    /// operation. Fails unless the partition is locally `OWNING`.
    pub fn reserve(&self, p: PartitionId) -> CResult<Reservation> {
        let inner = self.inner.read().unwrap();
        let lp = inner.partitions.get(&p).ok_or(Error::NotOwner(p))?;
        if lp.entry.state != PartitionState::Owning {
            return Err(Error::NotOwner(p));
        }
        lp.refs.fetch_add(1, Ordering::SeqCst);
        Ok(Reservation { counter: lp.refs.clone() })
    }

    /// Applies a new authoritative partition map received during an
    /// exchange. Exclusive, exchange-scoped: only the preloader calls this.
    pub fn update(&self, top_ver: u32, map: HashMap<PartitionId, PartitionEntry>) {
        let mut inner = self.inner.write().unwrap();
        inner.top_ver = top_ver;
        for (p, entry) in map {
            inner
                .partitions
                .entry(p)
                .or_insert_with(|| LocalPartition {
                    entry: PartitionEntry { state: PartitionState::Lost, owners: Vec::new() },
                    refs: Arc::new(AtomicIsize::new(0)),
                    entry_count: AtomicIsize::new(0),
                })
                .entry = entry;
        }
    }

    /// Directly transitions one partition's state (used by the preloader as
    /// streaming completes, or to mark a partition `LOST`). Takes the
    /// exclusive lock briefly; state transitions are rare compared to reads.
    pub fn set_state(&self, p: PartitionId, state: PartitionState) {
        let mut inner = self.inner.write().unwrap();
        if let Some(lp) = inner.partitions.get_mut(&p) {
            lp.entry.state = state;
        }
    }

    pub fn on_entry_added(&self, p: PartitionId) {
        if let Some(lp) = self.inner.read().unwrap().partitions.get(&p) {
            lp.entry_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn on_entry_removed(&self, p: PartitionId) {
        if let Some(lp) = self.inner.read().unwrap().partitions.get(&p) {
            lp.entry_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// True once a `RENTING` partition has no outstanding reservations, no
    /// in-flight supply as a source, and should move to `EVICTED`.
    pub fn can_evict_renting(&self, p: PartitionId) -> bool {
        let inner = self.inner.read().unwrap();
        match inner.partitions.get(&p) {
            Some(lp) => lp.entry.state == PartitionState::Renting && lp.refs.load(Ordering::SeqCst) <= 0,
            None => false,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.inner.read().unwrap().partitions.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reserve_fails_unless_owning() {
        let topo = PartitionTopology::new(1, 4);
        assert!(topo.reserve(0).is_err());

        let mut map = HashMap::new();
        map.insert(0, PartitionEntry { state: PartitionState::Owning, owners: vec![1] });
        topo.update(1, map);

        let r = topo.reserve(0).unwrap();
        assert!(!topo.can_evict_renting(0));
        drop(r);
    }

    #[test]
    fn renting_to_evicted_gate_requires_zero_refs() {
        let topo = PartitionTopology::new(1, 1);
        let mut map = HashMap::new();
        map.insert(0, PartitionEntry { state: PartitionState::Owning, owners: vec![1] });
        topo.update(1, map);
        let r = topo.reserve(0).unwrap();

        topo.set_state(0, PartitionState::Renting);
        assert!(!topo.can_evict_renting(0), "still reserved");
        drop(r);
        assert!(topo.can_evict_renting(0));
    }
}
