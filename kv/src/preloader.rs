//! DHT Preloader (§4.6): exchange barrier, assignment, demand/supply batch
//! streaming, and version-gated application that brings a newly assigned
//! partition from `MOVING` to `OWNING`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use crate::affinity::AffinityFunction;
use crate::config::{CacheConfig, PreloadMode};
use crate::entry::Entry;
use crate::error::CResult;
use crate::net::dispatcher::Dispatcher;
use crate::net::message::{Message, SupplyEntry};
use crate::net::transport::Transport;
use crate::store::EntryStore;
use crate::topology::{NodeId, PartitionEntry, PartitionId, PartitionState, PartitionTopology};

pub struct Preloader<T: Transport> {
    node: NodeId,
    topology: Arc<PartitionTopology>,
    affinity: Arc<AffinityFunction>,
    store: Arc<EntryStore>,
    dispatcher: Arc<Dispatcher<T>>,
    config: CacheConfig,
    pending: Mutex<HashMap<PartitionId, oneshot::Sender<()>>>,
    /// Batches applied so far per partition this node is demanding, used to
    /// tell a `last=true` supply batch from an out-of-order earlier one.
    applied_batches: Mutex<HashMap<PartitionId, usize>>,
}

impl<T: Transport + 'static> Preloader<T> {
    pub fn new(
        node: NodeId,
        topology: Arc<PartitionTopology>,
        affinity: Arc<AffinityFunction>,
        store: Arc<EntryStore>,
        dispatcher: Arc<Dispatcher<T>>,
        config: CacheConfig,
    ) -> Arc<Self> {
        Arc::new(Preloader {
            node,
            topology,
            affinity,
            store,
            dispatcher,
            config,
            pending: Mutex::new(HashMap::new()),
            applied_batches: Mutex::new(HashMap::new()),
        })
    }

    /// Runs one exchange for `new_top_ver` given the authoritative member
    /// list and each partition's previous owners (for supplier selection).
    /// The cluster-wide barrier that produces this authoritative input is
    /// the membership/failure-detector collaborator named in §1; here it is
    /// assumed already agreed (gossip itself is out of this crate's scope,
    /// same as the membership detector named as an external collaborator).
    pub async fn exchange(self: &Arc<Self>, new_top_ver: u32, members: &[NodeId], previous: HashMap<PartitionId, PartitionEntry>) -> CResult<()> {
        let partitions = self.affinity.partitions();
        let mut new_map = HashMap::with_capacity(partitions as usize);
        let mut to_demand = Vec::new();

        for p in 0..partitions {
            let owners = self.affinity.assign_for_partition(p, members);
            if owners.is_empty() {
                new_map.insert(p, PartitionEntry { state: PartitionState::Lost, owners });
                continue;
            }
            let i_own_now = owners.contains(&self.node);
            let i_owned_before = previous.get(&p).map(|e| e.owners.contains(&self.node)).unwrap_or(false);

            let state = if i_own_now && i_owned_before {
                PartitionState::Owning
            } else if i_own_now {
                PartitionState::Moving
            } else if i_owned_before {
                PartitionState::Renting
            } else {
                PartitionState::Owning // owned by someone else; irrelevant to this node's local state map entry
            };
            new_map.insert(p, PartitionEntry { state, owners: owners.clone() });

            if i_own_now && !i_owned_before {
                to_demand.push(p);
            }
        }

        self.topology.update(new_top_ver, new_map.clone());

        let mut waiters = Vec::with_capacity(to_demand.len());
        {
            let mut pending = self.pending.lock().await;
            for p in &to_demand {
                let (tx, rx) = oneshot::channel();
                pending.insert(*p, tx);
                waiters.push(rx);
            }
        }

        let mut by_supplier: HashMap<NodeId, Vec<PartitionId>> = HashMap::new();
        for p in &to_demand {
            let supplier = select_supplier(self.node, *p, members, &previous, &new_map);
            if let Some(supplier) = supplier {
                by_supplier.entry(supplier).or_default().push(*p);
            } else {
                self.topology.set_state(*p, PartitionState::Lost);
                if let Some(pending) = self.pending.lock().await.remove(p) {
                    let _ = pending.send(());
                }
            }
        }

        for (supplier, parts) in by_supplier {
            let _ = self.dispatcher.send(supplier, Message::DemandMessage { top_ver: new_top_ver, partitions: parts }).await;
        }

        match self.config.preload_mode {
            PreloadMode::Sync => {
                for rx in waiters {
                    let _ = tokio::time::timeout(Duration::from_millis(self.config.tx_timeout_millis), rx).await;
                }
            }
            PreloadMode::Async => {
                // Client operations proceed immediately, routed against the
                // pre-exchange owners for still-MOVING partitions by the
                // caller; completion is awaited only by whoever explicitly
                // asks via `await_completion`.
            }
        }
        Ok(())
    }

    /// Supplier side: streams a demanded partition's entries back in
    /// bounded batches.
    pub async fn handle_demand(&self, from: NodeId, top_ver: u32, partitions: Vec<PartitionId>) -> CResult<()> {
        for p in partitions {
            let entries = self.store.iter_partition(p)?;
            let batch_size = self.config.demand_batch_size.max(1);
            let mut chunks = entries.chunks(batch_size).peekable();
            if chunks.peek().is_none() {
                let _ = self
                    .dispatcher
                    .send(from, Message::SupplyMessage { top_ver, part_id: p, entries: Vec::new(), last: true })
                    .await;
                continue;
            }
            while let Some(chunk) = chunks.next() {
                let last = chunks.peek().is_none();
                let supply_entries = chunk
                    .iter()
                    .map(|(k, e)| SupplyEntry { key: k.clone(), value: e.value.clone(), version: e.version })
                    .collect();
                let _ = self.dispatcher.send(from, Message::SupplyMessage { top_ver, part_id: p, entries: supply_entries, last }).await;
            }
        }
        Ok(())
    }

    /// Demander side: applies one supply batch, version-gated per §4.2, and
    /// completes the partition's exchange waiter once the last batch lands.
    pub async fn handle_supply(&self, from: NodeId, _top_ver: u32, part_id: PartitionId, entries: Vec<SupplyEntry>, last: bool) -> CResult<()> {
        let batch: Vec<(Vec<u8>, Entry)> = entries.into_iter().map(|e| (e.key, Entry::new(e.value, e.version))).collect();
        self.store.apply_batch(part_id, batch)?;

        *self.applied_batches.lock().await.entry(part_id).or_insert(0) += 1;

        if last {
            self.topology.set_state(part_id, PartitionState::Owning);
            if let Some(waiter) = self.pending.lock().await.remove(&part_id) {
                let _ = waiter.send(());
            }
            let ack = Message::PartitionsSingle {
                top_ver: self.topology.current_top_ver(),
                partitions: vec![(part_id, PartitionEntry { state: PartitionState::Owning, owners: self.topology.owners(part_id) })],
            };
            let _ = self.dispatcher.send(from, ack).await;
        }
        Ok(())
    }
}

/// Previous-primary-first supplier selection, falling back to the live
/// backup with the lowest `NodeId` — the §9 open-question resolution.
/// "Live" means present in the current cluster membership, not that the
/// candidate still owns the partition after the exchange: with zero
/// backups a partition's whole owner set can change, and the old primary
/// is still the only node holding the data.
fn select_supplier(
    requesting_node: NodeId,
    p: PartitionId,
    members: &[NodeId],
    previous: &HashMap<PartitionId, PartitionEntry>,
    new_map: &HashMap<PartitionId, PartitionEntry>,
) -> Option<NodeId> {
    let live = |candidate: &NodeId| *candidate != requesting_node && members.contains(candidate);

    if let Some(prev) = previous.get(&p) {
        if let Some(&prev_primary) = prev.owners.first() {
            if live(&prev_primary) {
                return Some(prev_primary);
            }
        }
        let mut backups: Vec<NodeId> = prev.owners.iter().skip(1).copied().filter(|c| live(c)).collect();
        backups.sort();
        if let Some(&lowest) = backups.first() {
            return Some(lowest);
        }
    }
    let new_owners = new_map.get(&p).map(|e| e.owners.as_slice()).unwrap_or(&[]);
    let mut candidates: Vec<NodeId> = new_owners.iter().copied().filter(|c| live(c)).collect();
    candidates.sort();
    candidates.first().copied()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn previous_primary_is_preferred_when_still_live() {
        let mut previous = HashMap::new();
        previous.insert(0, PartitionEntry { state: PartitionState::Owning, owners: vec![1, 2] });
        let mut new_map = HashMap::new();
        new_map.insert(0, PartitionEntry { state: PartitionState::Moving, owners: vec![1, 2, 3] });
        let members = [1, 2, 3];

        assert_eq!(select_supplier(3, 0, &members, &previous, &new_map), Some(1));
    }

    #[test]
    fn falls_back_to_lowest_live_backup_when_primary_gone() {
        let mut previous = HashMap::new();
        previous.insert(0, PartitionEntry { state: PartitionState::Owning, owners: vec![1, 2, 5] });
        let mut new_map = HashMap::new();
        new_map.insert(0, PartitionEntry { state: PartitionState::Moving, owners: vec![2, 3, 5] });
        let members = [2, 3, 5];

        assert_eq!(select_supplier(3, 0, &members, &previous, &new_map), Some(2));
    }

    #[test]
    fn previous_primary_supplies_even_after_losing_ownership_with_zero_backups() {
        // backups=0: the whole owner set changes with no overlap, so the
        // old primary is the only node holding the data even though it is
        // no longer a new owner.
        let mut previous = HashMap::new();
        previous.insert(0, PartitionEntry { state: PartitionState::Owning, owners: vec![1] });
        let mut new_map = HashMap::new();
        new_map.insert(0, PartitionEntry { state: PartitionState::Moving, owners: vec![2] });
        let members = [1, 2];

        assert_eq!(select_supplier(2, 0, &members, &previous, &new_map), Some(1));
    }
}
