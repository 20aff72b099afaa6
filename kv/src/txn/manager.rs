//! Transaction Manager (§4.4): per-node coordinator and participant state.
//!
//! A node plays coordinator for transactions it begins and participant for
//! any transaction whose write touches a partition it owns. Both roles
//! share one `TransactionManager` instance since every node does both.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::affinity::AffinityFunction;
use crate::config::{CacheConfig, WriteSyncMode};
use crate::entry::EntryValue;
use crate::error::{CResult, Error};
use crate::net::dispatcher::{CorrelationId, Dispatcher};
use crate::net::message::{CommittedInfo, Message, ReadVersion, WriteOp};
use crate::net::transport::Transport;
use crate::store::{EntryStore, LockOutcome};
use crate::topology::{NodeId, PartitionTopology};
use crate::txn::{canonical_lock_order, ConcurrencyMode, IsolationLevel, Transaction, TxState};
use crate::version::{CacheVersion, VersionOracle};

pub struct TransactionManager<T: Transport> {
    node: NodeId,
    store: Arc<EntryStore>,
    topology: Arc<PartitionTopology>,
    affinity: Arc<AffinityFunction>,
    oracle: Arc<VersionOracle>,
    dispatcher: Arc<Dispatcher<T>>,
    config: CacheConfig,
    active: Mutex<HashMap<CacheVersion, Transaction>>,
    /// Committed transactions this node has applied as a participant,
    /// retained long enough to answer `CheckCommitted` idempotently.
    pub(crate) committed_log: Mutex<HashMap<CacheVersion, CommittedInfo>>,
}

impl<T: Transport + 'static> TransactionManager<T> {
    pub fn new(
        node: NodeId,
        store: Arc<EntryStore>,
        topology: Arc<PartitionTopology>,
        affinity: Arc<AffinityFunction>,
        oracle: Arc<VersionOracle>,
        dispatcher: Arc<Dispatcher<T>>,
        config: CacheConfig,
    ) -> Arc<Self> {
        Arc::new(TransactionManager {
            node,
            store,
            topology,
            affinity,
            oracle,
            dispatcher,
            config,
            active: Mutex::new(HashMap::new()),
            committed_log: Mutex::new(HashMap::new()),
        })
    }

    pub async fn begin(&self, concurrency: ConcurrencyMode, isolation: IsolationLevel) -> CacheVersion {
        let id = self.oracle.next();
        let tx = Transaction::new(id, self.node, concurrency, isolation, self.config.tx_timeout_millis);
        self.active.lock().await.insert(id, tx);
        id
    }

    fn primary_for(&self, members: &[NodeId], key: &[u8]) -> (crate::topology::PartitionId, NodeId) {
        let partition = self.affinity.partition_for_key(key);
        let owners = self.affinity.assign_for_partition(partition, members);
        (partition, owners.first().copied().unwrap_or(self.node))
    }

    /// Buffers a write locally; under pessimistic concurrency on a locally
    /// owned key, also locks at first reference, per §4.4.
    pub async fn stage_write(&self, tx_id: CacheVersion, members: &[NodeId], key: Vec<u8>, value: EntryValue) -> CResult<()> {
        let mut active = self.active.lock().await;
        let tx = active.get_mut(&tx_id).ok_or(Error::InvalidTxState { tx: tx_id, detail: "unknown transaction" })?;
        if tx.state != TxState::Active {
            return Err(Error::InvalidTxState { tx: tx_id, detail: "not active" });
        }
        let (partition, primary) = self.primary_for(members, &key);
        tx.participants.insert(primary);
        let pessimistic = tx.concurrency == ConcurrencyMode::Pessimistic;
        tx.stage_write(key.clone(), value);
        drop(active);

        if pessimistic && primary == self.node {
            self.acquire_lock_with_wound_wait(partition, &key, tx_id).await?;
        }
        Ok(())
    }

    pub async fn record_read(&self, tx_id: CacheVersion, key: Vec<u8>, version: CacheVersion) -> CResult<()> {
        let mut active = self.active.lock().await;
        let tx = active.get_mut(&tx_id).ok_or(Error::InvalidTxState { tx: tx_id, detail: "unknown transaction" })?;
        tx.record_read(key, version);
        Ok(())
    }

    async fn acquire_lock_with_wound_wait(&self, partition: crate::topology::PartitionId, key: &[u8], tx_id: CacheVersion) -> CResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.lock_timeout_millis);
        loop {
            match self.store.try_lock(partition, key, tx_id)? {
                LockOutcome::Acquired | LockOutcome::AlreadyHeld => return Ok(()),
                LockOutcome::HeldBy(holder) => {
                    if tokio::time::Instant::now() >= deadline {
                        if tx_id < holder {
                            return Err(Error::Deadlock { tx: tx_id });
                        }
                        // This request is the elder; the younger holder yields.
                        self.store.unlock(partition, key, holder)?;
                        if let Some(holder_tx) = self.active.lock().await.get_mut(&holder) {
                            holder_tx.state = TxState::RolledBack;
                        }
                        continue;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Coordinator-side commit: prepares every participant, then finishes.
    pub async fn commit(&self, tx_id: CacheVersion) -> CResult<()> {
        let (write_set, read_versions, isolation, concurrency, participants, timeout_millis) = {
            let mut active = self.active.lock().await;
            let tx = active.get_mut(&tx_id).ok_or(Error::InvalidTxState { tx: tx_id, detail: "unknown transaction" })?;
            tx.state = TxState::Preparing;
            (
                tx.write_ops(),
                tx.read_versions(),
                tx.isolation,
                tx.concurrency,
                tx.participants.clone(),
                tx.timeout_millis,
            )
        };

        let top_ver = self.topology.current_top_ver();
        let timeout = Duration::from_millis(timeout_millis);

        let mut prepared_nodes = Vec::new();
        let mut conflict = false;
        for participant in &participants {
            let write_for_node: Vec<WriteOp> = write_set
                .iter()
                .filter(|op| self.primary_for(&participants.iter().copied().collect::<Vec<_>>(), &op.key).1 == *participant)
                .cloned()
                .collect();
            let read_for_node: Vec<ReadVersion> = read_versions.clone();

            let response = if *participant == self.node {
                self.handle_prepare_local(tx_id, write_for_node, read_for_node, isolation, concurrency).await
            } else {
                let msg = Message::PrepareRequest {
                    tx_id,
                    write_set: write_for_node,
                    read_versions: read_for_node,
                    isolation,
                    concurrency,
                    timeout_millis,
                };
                self.dispatcher
                    .request(*participant, msg, CorrelationId::Tx(tx_id), top_ver, timeout)
                    .await
                    .map(|m| match m {
                        Message::PrepareResponse { ok, conflict_keys, .. } => (ok, conflict_keys),
                        _ => (false, Vec::new()),
                    })
                    .unwrap_or((false, Vec::new()))
            };

            if response.0 {
                prepared_nodes.push(*participant);
            } else {
                conflict = true;
            }
        }

        let commit = !conflict;
        for participant in &participants {
            let msg = Message::FinishRequest { tx_id, commit };
            if *participant == self.node {
                self.handle_finish_local(tx_id, commit).await?;
            } else {
                let _ = self
                    .dispatcher
                    .request(*participant, msg, CorrelationId::Tx(tx_id), top_ver, timeout)
                    .await;
            }
        }

        let mut active = self.active.lock().await;
        if let Some(tx) = active.get_mut(&tx_id) {
            tx.state = if commit { TxState::Committed } else { TxState::RolledBack };
        }

        if commit {
            Ok(())
        } else if concurrency == ConcurrencyMode::Pessimistic {
            Err(Error::Deadlock { tx: tx_id })
        } else {
            Err(Error::OptimisticConflict { key: Vec::new() })
        }
    }

    pub async fn rollback(&self, tx_id: CacheVersion) -> CResult<()> {
        let participants = {
            let mut active = self.active.lock().await;
            let tx = active.get_mut(&tx_id).ok_or(Error::InvalidTxState { tx: tx_id, detail: "unknown transaction" })?;
            tx.state = TxState::RollingBack;
            tx.participants.clone()
        };
        let top_ver = self.topology.current_top_ver();
        for participant in participants {
            if participant == self.node {
                self.handle_finish_local(tx_id, false).await?;
            } else {
                let _ = self
                    .dispatcher
                    .request(
                        participant,
                        Message::FinishRequest { tx_id, commit: false },
                        CorrelationId::Tx(tx_id),
                        top_ver,
                        Duration::from_millis(self.config.tx_timeout_millis),
                    )
                    .await;
            }
        }
        if let Some(tx) = self.active.lock().await.get_mut(&tx_id) {
            tx.state = TxState::RolledBack;
        }
        Ok(())
    }

    /// Participant-side prepare, invoked either locally (coordinator ==
    /// this node) or from the dispatcher's unsolicited-message handler.
    pub async fn handle_prepare(
        &self,
        tx_id: CacheVersion,
        write_set: Vec<WriteOp>,
        read_versions: Vec<ReadVersion>,
        isolation: IsolationLevel,
        concurrency: ConcurrencyMode,
    ) -> (bool, Vec<Vec<u8>>) {
        self.handle_prepare_local(tx_id, write_set, read_versions, isolation, concurrency).await
    }

    async fn handle_prepare_local(
        &self,
        tx_id: CacheVersion,
        write_set: Vec<WriteOp>,
        read_versions: Vec<ReadVersion>,
        isolation: IsolationLevel,
        concurrency: ConcurrencyMode,
    ) -> (bool, Vec<Vec<u8>>) {
        let mut ordered: Vec<&WriteOp> = write_set.iter().collect();
        ordered.sort_by_key(|op| canonical_lock_order(self.affinity.partition_for_key(&op.key), &op.key));

        let mut conflict_keys = Vec::new();
        for op in &ordered {
            let partition = self.affinity.partition_for_key(&op.key);
            match concurrency {
                ConcurrencyMode::Pessimistic => {
                    if self.acquire_lock_with_wound_wait(partition, &op.key, tx_id).await.is_err() {
                        conflict_keys.push(op.key.clone());
                    }
                }
                ConcurrencyMode::Optimistic => {
                    match self.store.try_lock(partition, &op.key, tx_id) {
                        Ok(LockOutcome::Acquired) | Ok(LockOutcome::AlreadyHeld) => {}
                        _ => {
                            conflict_keys.push(op.key.clone());
                            continue;
                        }
                    }
                    if isolation == IsolationLevel::Serializable {
                        if let Some(read) = read_versions.iter().find(|r| r.key == op.key) {
                            if self.store.has_conflict(partition, &op.key, read.version).unwrap_or(false) {
                                conflict_keys.push(op.key.clone());
                            }
                        }
                    }
                }
            }
        }

        if !conflict_keys.is_empty() {
            for op in &ordered {
                let partition = self.affinity.partition_for_key(&op.key);
                let _ = self.store.unlock(partition, &op.key, tx_id);
            }
            return (false, conflict_keys);
        }
        (true, Vec::new())
    }

    pub async fn handle_finish(&self, tx_id: CacheVersion, commit: bool) -> CResult<()> {
        self.handle_finish_local(tx_id, commit).await
    }

    async fn handle_finish_local(&self, tx_id: CacheVersion, commit: bool) -> CResult<()> {
        let write_set = self.active.lock().await.get(&tx_id).map(|tx| tx.write_ops()).unwrap_or_default();

        if !commit {
            for op in &write_set {
                let partition = self.affinity.partition_for_key(&op.key);
                let _ = self.store.unlock(partition, &op.key, tx_id);
            }
            return Ok(());
        }

        let mut applied = Vec::with_capacity(write_set.len());
        for op in &write_set {
            let partition = self.affinity.partition_for_key(&op.key);
            let version = self.oracle.next();
            let (_, readers) = self.store.commit(partition, &op.key, op.value.clone(), version, Some(tx_id))?;
            self.store.persist_async(&op.key, &op.value).await?;
            applied.push((op.key.clone(), version, readers));
        }

        let top_ver = self.topology.current_top_ver();
        for (key, version, readers) in &applied {
            for reader in readers.iter() {
                let msg = Message::Invalidate { key: key.clone(), new_version: *version, tx_id: Some(tx_id) };
                if self.config.write_sync_mode == WriteSyncMode::FullSync {
                    let _ = self
                        .dispatcher
                        .request(reader, msg, CorrelationId::Get { key: key.clone() }, top_ver, Duration::from_millis(self.config.tx_timeout_millis))
                        .await;
                } else {
                    let _ = self.dispatcher.send(reader, msg).await;
                }
            }
        }

        self.committed_log.lock().await.insert(
            tx_id,
            CommittedInfo { write_set: write_set.clone(), commit_version: applied.last().map(|(_, v, _)| *v).unwrap_or(CacheVersion::ZERO) },
        );
        Ok(())
    }

    pub fn local_node(&self) -> NodeId {
        self.node
    }
}
