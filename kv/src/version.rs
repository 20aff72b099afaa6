//! Cache versions and the Version Oracle that produces them.
//!
//! A `CacheVersion` is the `(topVer, globalTime, order, nodeOrder)` tuple
//! from the spec's data model. Field declaration order matters: deriving
//! `Ord` over fields in this order gives exactly the strict lexicographic
//! comparator every "newer" relation in the cache relies on.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde_derive::{Deserialize, Serialize};

use crate::topology::NodeId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheVersion {
    pub top_ver: u32,
    pub global_time: u64,
    pub order: u64,
    pub node_order: u32,
}

impl CacheVersion {
    pub const ZERO: CacheVersion =
        CacheVersion { top_ver: 0, global_time: 0, order: 0, node_order: 0 };

    /// The atomic-version comparator from §4.2: strict lexicographic order
    /// over (topVer, globalTime, order, nodeOrder). `Ord` already gives us
    /// this since the fields are declared in that order, but the named
    /// method documents the invariant at call sites that compare versions.
    pub fn dominates(&self, other: &CacheVersion) -> bool {
        self > other
    }
}

/// Produces totally ordered cache versions for one node. `order` is a
/// node-local monotonic counter; `node_order` breaks ties deterministically
/// across nodes that raced to commit at the same `global_time`.
pub struct VersionOracle {
    node_order: NodeId,
    top_ver: AtomicU32,
    order: AtomicU64,
}

impl VersionOracle {
    pub fn new(node_order: NodeId, initial_top_ver: u32) -> Self {
        VersionOracle { node_order, top_ver: AtomicU32::new(initial_top_ver), order: AtomicU64::new(0) }
    }

    /// Produces the next version for this node. Monotonically non-decreasing
    /// in `order` per node, as required by §3.
    pub fn next(&self) -> CacheVersion {
        let order = self.order.fetch_add(1, Ordering::SeqCst) + 1;
        CacheVersion {
            top_ver: self.top_ver.load(Ordering::SeqCst),
            global_time: wall_clock_millis(),
            order,
            node_order: self.node_order,
        }
    }

    /// Called by the preloader once a new topology version is established by
    /// the exchange barrier; subsequent versions carry the new `topVer`.
    pub fn advance_topology(&self, new_top_ver: u32) {
        self.top_ver.fetch_max(new_top_ver, Ordering::SeqCst);
    }

    pub fn current_top_ver(&self) -> u32 {
        self.top_ver.load(Ordering::SeqCst)
    }
}

fn wall_clock_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
