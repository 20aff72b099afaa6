//! Node/Context: wires every component into one addressable cluster member
//! and exposes the public `get`/`put`/`remove`/transaction/status API. This
//! is the composition root the CLI and any embedder talks to; no other
//! module constructs more than one of these components together.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::affinity::AffinityFunction;
use crate::config::{AtomicityMode, CacheConfig, DistributionMode, WriteSyncMode};
use crate::entry::EntryValue;
use crate::error::{CResult, Error};
use crate::near::NearCache;
use crate::net::dispatcher::{CorrelationId, Dispatcher};
use crate::net::message::Message;
use crate::net::transport::Transport;
use crate::preloader::Preloader;
use crate::store::EntryStore;
use crate::topology::{NodeId, PartitionEntry, PartitionId, PartitionState, PartitionTopology};
use crate::txn::manager::TransactionManager;
use crate::txn::recovery;
use crate::txn::{ConcurrencyMode, IsolationLevel};
use crate::version::{CacheVersion, VersionOracle};

pub struct Node<T: Transport> {
    id: NodeId,
    config: CacheConfig,
    topology: Arc<PartitionTopology>,
    affinity: Arc<AffinityFunction>,
    store: Arc<EntryStore>,
    near: Arc<NearCache>,
    oracle: Arc<VersionOracle>,
    dispatcher: Arc<Dispatcher<T>>,
    txns: Arc<TransactionManager<T>>,
    preloader: Arc<Preloader<T>>,
    members: RwLock<Vec<NodeId>>,
}

impl<T: Transport + 'static> Node<T> {
    /// Builds a single-node cluster (`members == [id]`) ready to accept
    /// requests. Call `rebalance` to admit additional members.
    pub fn new(id: NodeId, config: CacheConfig, transport: Arc<T>) -> CResult<Arc<Self>> {
        Self::build(id, config, transport, true)
    }

    /// Builds a node that owns nothing yet, meant to `rebalance` into an
    /// already-running cluster. `new`'s "I already own everything" guess is
    /// only valid for the first node bootstrapping a fresh cluster; a node
    /// joining one later must start from no ownership so its first exchange
    /// correctly demands every partition it's assigned instead of assuming
    /// it already has data it has never actually received.
    pub fn join(id: NodeId, config: CacheConfig, transport: Arc<T>) -> CResult<Arc<Self>> {
        Self::build(id, config, transport, false)
    }

    fn build(id: NodeId, config: CacheConfig, transport: Arc<T>, self_owned: bool) -> CResult<Arc<Self>> {
        let topology = Arc::new(PartitionTopology::new(id, config.partitions));
        let affinity = Arc::new(AffinityFunction::new(config.partitions, config.backups));

        let mut store = EntryStore::new(config.partitions)
            .with_eviction(config.eviction_budget_bytes, config.eviction_max_blocks, config.eviction_exclude_paths.clone())
            .with_topology(topology.clone());
        if let Some(path) = &config.persist_path {
            let log = crate::persist::disk::LogStore::open(path)?;
            store = store.with_persist(Box::new(log));
        }
        let store = Arc::new(store);

        let near = Arc::new(NearCache::new(config.near_cache_budget_bytes));
        let oracle = Arc::new(VersionOracle::new(id, 0));
        let dispatcher = Dispatcher::new(transport, 0);
        let txns = TransactionManager::new(id, store.clone(), topology.clone(), affinity.clone(), oracle.clone(), dispatcher.clone(), config.clone());
        let preloader = Preloader::new(id, topology.clone(), affinity.clone(), store.clone(), dispatcher.clone(), config.clone());

        let mut owned = HashMap::with_capacity(config.partitions as usize);
        for p in 0..config.partitions {
            let entry = if self_owned {
                PartitionEntry { state: PartitionState::Owning, owners: vec![id] }
            } else {
                PartitionEntry { state: PartitionState::Lost, owners: Vec::new() }
            };
            owned.insert(p, entry);
        }
        topology.update(0, owned);

        let node = Arc::new(Node {
            id,
            config,
            topology,
            affinity,
            store,
            near,
            oracle,
            dispatcher: dispatcher.clone(),
            txns,
            preloader,
            members: RwLock::new(vec![id]),
        });

        let routed = node.clone();
        dispatcher.spawn_receive_loop(move |from, msg| {
            let node = routed.clone();
            tokio::spawn(async move {
                node.route_unsolicited(from, msg).await;
            });
        });

        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.members.read().unwrap().clone()
    }

    /// Loads every key this node already persisted from a prior run. Call
    /// once before serving traffic; not part of `new` since it's async.
    pub async fn warm(&self) -> CResult<usize> {
        self.store.warm_from_persist(&self.affinity).await
    }

    fn primary_of(&self, key: &[u8]) -> (PartitionId, NodeId) {
        let partition = self.affinity.partition_for_key(key);
        let members = self.members();
        let owners = self.affinity.assign_for_partition(partition, &members);
        (partition, owners.first().copied().unwrap_or(self.id))
    }

    pub async fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let (partition, primary) = self.primary_of(key);

        if primary == self.id {
            let entry = self.store.peek_through(partition, key).await?;
            return Ok(entry.and_then(|e| e.value.as_bytes().map(|b| b.to_vec())));
        }

        let near_enabled = self.config.distribution_mode == DistributionMode::NearPartitioned;
        if near_enabled {
            if let Some(cached) = self.near.get(key) {
                return Ok(cached.value.as_bytes().map(|b| b.to_vec()));
            }
        }

        let top_ver = self.topology.current_top_ver();
        let msg = Message::GetRequest { key: key.to_vec(), requester_id: self.id, top_ver };
        let reply = self
            .dispatcher
            .request(primary, msg, CorrelationId::Get { key: key.to_vec() }, top_ver, Duration::from_millis(self.config.tx_timeout_millis))
            .await?;

        match reply {
            Message::GetResponse { value, version, err, .. } => {
                if let Some(err) = err {
                    return Err(Error::Internal(err));
                }
                match (value, version) {
                    (Some(v), Some(ver)) => {
                        if near_enabled {
                            self.near.put(key, v.clone(), ver, now_millis());
                        }
                        Ok(v.as_bytes().map(|b| b.to_vec()))
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    async fn single_op(&self, key: Vec<u8>, value: EntryValue) -> CResult<()> {
        let tx = self.txns.begin(ConcurrencyMode::Pessimistic, IsolationLevel::ReadCommitted).await;
        let members = self.members();
        self.txns.stage_write(tx, &members, key, value).await?;
        self.txns.commit(tx).await
    }

    /// `AtomicityMode::Atomic` writes to a locally-owned key skip the
    /// Transaction Manager entirely, per §6; every other case (remote
    /// primary, or `Transactional` mode) still goes through a one-shot
    /// pessimistic transaction since the wire protocol has no separate
    /// single-key fast-path message.
    async fn write_one(&self, key: Vec<u8>, value: EntryValue) -> CResult<()> {
        let (partition, primary) = self.primary_of(&key);
        if self.config.atomicity_mode == AtomicityMode::Atomic && primary == self.id {
            return self.atomic_local_write(partition, key, value).await;
        }
        self.single_op(key, value).await
    }

    async fn atomic_local_write(&self, partition: PartitionId, key: Vec<u8>, value: EntryValue) -> CResult<()> {
        let version = self.oracle.next();
        let (_, readers) = self.store.commit(partition, &key, value.clone(), version, None)?;
        self.store.persist_async(&key, &value).await?;

        let top_ver = self.topology.current_top_ver();
        for reader in readers.iter() {
            let msg = Message::Invalidate { key: key.clone(), new_version: version, tx_id: None };
            if self.config.write_sync_mode == WriteSyncMode::FullSync {
                let _ = self
                    .dispatcher
                    .request(reader, msg, CorrelationId::Get { key: key.clone() }, top_ver, Duration::from_millis(self.config.tx_timeout_millis))
                    .await;
            } else {
                let _ = self.dispatcher.send(reader, msg).await;
            }
        }
        Ok(())
    }

    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> CResult<()> {
        self.write_one(key, EntryValue::Value(value)).await
    }

    pub async fn remove(&self, key: Vec<u8>) -> CResult<()> {
        self.write_one(key, EntryValue::Tombstone).await
    }

    /// Explicit multi-key transactions are available regardless of
    /// `AtomicityMode`; atomic mode only changes what `put`/`remove` do
    /// under the hood, never what the client can ask for directly.
    pub async fn begin_transaction(&self, concurrency: ConcurrencyMode, isolation: IsolationLevel) -> CacheVersion {
        self.txns.begin(concurrency, isolation).await
    }

    pub async fn tx_put(&self, tx: CacheVersion, key: Vec<u8>, value: Vec<u8>) -> CResult<()> {
        let members = self.members();
        self.txns.stage_write(tx, &members, key, EntryValue::Value(value)).await
    }

    pub async fn tx_remove(&self, tx: CacheVersion, key: Vec<u8>) -> CResult<()> {
        let members = self.members();
        self.txns.stage_write(tx, &members, key, EntryValue::Tombstone).await
    }

    /// Records the version a transaction observed for `key`, so an
    /// optimistic commit can validate it hasn't changed since.
    pub async fn tx_read(&self, tx: CacheVersion, key: Vec<u8>) -> CResult<Option<Vec<u8>>> {
        let (partition, _) = self.primary_of(&key);
        let entry = self.store.peek_through(partition, &key).await?;
        let version = entry.as_ref().map(|e| e.version).unwrap_or(CacheVersion::ZERO);
        self.txns.record_read(tx, key, version).await?;
        Ok(entry.and_then(|e| e.value.as_bytes().map(|b| b.to_vec())))
    }

    pub async fn commit_transaction(&self, tx: CacheVersion) -> CResult<()> {
        self.txns.commit(tx).await
    }

    pub async fn rollback_transaction(&self, tx: CacheVersion) -> CResult<()> {
        self.txns.rollback(tx).await
    }

    /// Recovers `tx` when this node suspects its coordinator is gone.
    /// Applies `Commit`/`Rollback` locally; logs and applies a rollback for
    /// `HeuristicRollback`.
    pub async fn recover_transaction(self: &Arc<Self>, tx: CacheVersion, participants: Vec<NodeId>) -> CResult<recovery::RecoveryOutcome> {
        let top_ver = self.topology.current_top_ver();
        let timeout = Duration::from_millis(self.config.recovery_timeout_millis);
        let outcome = recovery::recover(&self.txns, &self.dispatcher, tx, participants, top_ver, timeout).await?;
        match &outcome {
            recovery::RecoveryOutcome::Commit(_) => self.txns.handle_finish(tx, true).await?,
            recovery::RecoveryOutcome::Rollback => self.txns.handle_finish(tx, false).await?,
            recovery::RecoveryOutcome::HeuristicRollback => {
                log::warn!("transaction {tx:?} heuristically rolled back during recovery");
                self.txns.handle_finish(tx, false).await?;
            }
        }
        Ok(outcome)
    }

    /// Admits a new member list at `new_top_ver`: runs the DHT exchange and
    /// streams any newly-owned partitions in from their previous owners.
    pub async fn rebalance(self: &Arc<Self>, new_top_ver: u32, members: Vec<NodeId>) -> CResult<()> {
        let mut previous = HashMap::with_capacity(self.affinity.partitions() as usize);
        for p in 0..self.affinity.partitions() {
            if let Some(state) = self.topology.state(p) {
                previous.insert(p, PartitionEntry { state, owners: self.topology.owners(p) });
            }
        }

        self.preloader.exchange(new_top_ver, &members, previous).await?;
        *self.members.write().unwrap() = members;
        self.oracle.advance_topology(new_top_ver);
        self.dispatcher.advance_topology(new_top_ver);
        Ok(())
    }

    pub fn status(&self) -> NodeStatus {
        let owned_partitions = (0..self.affinity.partitions()).filter(|p| self.topology.state(*p) == Some(PartitionState::Owning)).count();
        NodeStatus {
            node: self.id,
            top_ver: self.topology.current_top_ver(),
            owned_partitions,
            total_entries: self.store.total_entries(),
            near_cache_entries: self.near.len(),
            members: self.members(),
        }
    }

    async fn route_unsolicited(self: Arc<Self>, from: NodeId, msg: Message) {
        if let Err(e) = self.handle_unsolicited(from, msg).await {
            log::warn!("node {} failed to handle message from {from}: {e}", self.id);
        }
    }

    async fn handle_unsolicited(&self, from: NodeId, msg: Message) -> CResult<()> {
        match msg {
            Message::GetRequest { key, requester_id, .. } => {
                let (partition, primary) = self.primary_of(&key);
                let (value, version, err) = if primary != self.id {
                    (None, None, Some("not primary for key".to_string()))
                } else {
                    match self.store.peek_through(partition, &key).await {
                        Ok(entry) => {
                            self.store.track_reader(partition, &key, requester_id)?;
                            match entry {
                                Some(e) => (Some(e.value), Some(e.version), None),
                                None => (None, None, None),
                            }
                        }
                        Err(e) => (None, None, Some(e.to_string())),
                    }
                };
                self.dispatcher.send(from, Message::GetResponse { key, value, version, err }).await
            }
            Message::Invalidate { key, .. } => {
                self.near.invalidate(&key);
                Ok(())
            }
            Message::PrepareRequest { tx_id, write_set, read_versions, isolation, concurrency, .. } => {
                let (ok, conflict_keys) = self.txns.handle_prepare(tx_id, write_set, read_versions, isolation, concurrency).await;
                self.dispatcher.send(from, Message::PrepareResponse { tx_id, ok, conflict_keys }).await
            }
            Message::FinishRequest { tx_id, commit } => {
                self.txns.handle_finish(tx_id, commit).await?;
                self.dispatcher.send(from, Message::FinishResponse { tx_id, ok: true }).await
            }
            Message::CheckCommitted { tx_id, .. } => {
                let committed_info = recovery::handle_check_committed(&self.txns, tx_id).await;
                self.dispatcher.send(from, Message::CheckCommittedResponse { tx_id, committed_info }).await
            }
            Message::PartitionsSingle { top_ver, partitions } => {
                self.topology.update(top_ver, partitions.into_iter().collect());
                Ok(())
            }
            Message::PartitionsFull { top_ver, map } => {
                if let Some((_, partitions)) = map.into_iter().find(|(n, _)| *n == self.id) {
                    self.topology.update(top_ver, partitions.into_iter().collect());
                }
                Ok(())
            }
            Message::DemandMessage { top_ver, partitions } => self.preloader.handle_demand(from, top_ver, partitions).await,
            Message::SupplyMessage { top_ver, part_id, entries, last } => self.preloader.handle_supply(from, top_ver, part_id, entries, last).await,
            // Responses are consumed by the dispatcher's correlation table
            // before reaching here; anything else is a stale or malformed
            // reply with no pending waiter left to deliver it to.
            Message::GetResponse { .. } | Message::PrepareResponse { .. } | Message::FinishResponse { .. } | Message::CheckCommittedResponse { .. } => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node: NodeId,
    pub top_ver: u32,
    pub owned_partitions: usize,
    pub total_entries: usize,
    pub near_cache_entries: usize,
    pub members: Vec<NodeId>,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "node {} | topVer={} | owned_partitions={} | entries={} | near_cache={} | members={:?}",
            self.node, self.top_ver, self.owned_partitions, self.total_entries, self.near_cache_entries, self.members
        )
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::transport::local::Registry;

    async fn single_node() -> Arc<Node<crate::net::transport::local::LocalTransport>> {
        let registry = Registry::new();
        let transport = Arc::new(registry.register(1).await);
        let mut config = CacheConfig::default();
        config.partitions = 16;
        config.backups = 0;
        Node::new(1, config, transport).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_on_a_single_node() {
        let node = single_node().await;
        node.put(b"a".to_vec(), vec![1, 2, 3]).await.unwrap();
        assert_eq!(node.get(b"a").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn remove_clears_the_value() {
        let node = single_node().await;
        node.put(b"a".to_vec(), vec![1]).await.unwrap();
        node.remove(b"a".to_vec()).await.unwrap();
        assert_eq!(node.get(b"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn explicit_transaction_commits_multiple_keys_together() {
        let node = single_node().await;
        let tx = node.begin_transaction(ConcurrencyMode::Pessimistic, IsolationLevel::ReadCommitted).await;
        node.tx_put(tx, b"a".to_vec(), vec![1]).await.unwrap();
        node.tx_put(tx, b"b".to_vec(), vec![2]).await.unwrap();
        node.commit_transaction(tx).await.unwrap();

        assert_eq!(node.get(b"a").await.unwrap(), Some(vec![1]));
        assert_eq!(node.get(b"b").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn status_reports_every_partition_as_owned_on_a_single_node() {
        let node = single_node().await;
        let status = node.status();
        assert_eq!(status.owned_partitions, 16);
        assert_eq!(status.members, vec![1]);
    }
}
