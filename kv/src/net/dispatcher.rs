//! Message Dispatcher: correlates outgoing requests with their responses
//! via the request's own natural key (a transaction id, or a `(node, key)`
//! pair), resolving a `oneshot` future per in-flight request instead of a
//! blocking wait — the "coroutines become futures" redesign from §9.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use crate::error::{CResult, Error};
use crate::net::message::Message;
use crate::net::transport::Transport;
use crate::topology::NodeId;
use crate::version::CacheVersion;

/// A correlation key a reply can be matched back to. The request kinds in
/// §6 each carry one of these naturally (`txId` for transaction messages,
/// `(node, key)` for a near-cache get).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CorrelationId {
    Tx(CacheVersion),
    /// A dispatcher instance belongs to exactly one local node, so the key
    /// alone disambiguates in-flight `GetRequest`s from that node.
    Get { key: Vec<u8> },
}

pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    local_top_ver: std::sync::atomic::AtomicU32,
    pending: Mutex<HashMap<CorrelationId, oneshot::Sender<Message>>>,
}

impl<T: Transport + 'static> Dispatcher<T> {
    pub fn new(transport: Arc<T>, top_ver: u32) -> Arc<Self> {
        Arc::new(Dispatcher {
            transport,
            local_top_ver: std::sync::atomic::AtomicU32::new(top_ver),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn advance_topology(&self, top_ver: u32) {
        self.local_top_ver.fetch_max(top_ver, std::sync::atomic::Ordering::SeqCst);
    }

    /// Spawns the receive loop; every inbound message either resolves a
    /// pending correlation or is handed to `on_unsolicited` (requests this
    /// node must answer, e.g. `GetRequest`, `PrepareRequest`).
    pub fn spawn_receive_loop<F>(self: &Arc<Self>, on_unsolicited: F)
    where
        F: Fn(NodeId, Message) + Send + Sync + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some((from, msg)) = this.transport.recv().await {
                if let Some(correlation) = correlation_of(&msg) {
                    let mut pending = this.pending.lock().await;
                    if let Some(tx) = pending.remove(&correlation) {
                        let _ = tx.send(msg);
                        continue;
                    }
                }
                on_unsolicited(from, msg);
            }
        });
    }

    /// Sends `msg` to `to` and awaits the correlated reply, or times out.
    /// Returns `TopologyChanged` immediately if the topology has already
    /// moved past `started_at_top_ver`, rather than waiting out a request
    /// doomed to be stale.
    pub async fn request(
        &self,
        to: NodeId,
        msg: Message,
        correlation: CorrelationId,
        started_at_top_ver: u32,
        timeout: Duration,
    ) -> CResult<Message> {
        let current = self.local_top_ver.load(std::sync::atomic::Ordering::SeqCst);
        if current != started_at_top_ver {
            return Err(Error::TopologyChanged { started: started_at_top_ver, current });
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation.clone(), tx);

        if let Err(e) = self.transport.send(to, msg).await {
            self.pending.lock().await.remove(&correlation);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Internal("dispatcher sender dropped".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&correlation);
                Err(Error::Timeout)
            }
        }
    }

    pub async fn send(&self, to: NodeId, msg: Message) -> CResult<()> {
        self.transport.send(to, msg).await
    }
}

fn correlation_of(msg: &Message) -> Option<CorrelationId> {
    match msg {
        Message::PrepareResponse { tx_id, .. }
        | Message::FinishResponse { tx_id, .. }
        | Message::CheckCommittedResponse { tx_id, .. } => Some(CorrelationId::Tx(*tx_id)),
        Message::GetResponse { key, .. } => Some(CorrelationId::Get { key: key.clone() }),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::transport::local::Registry;

    #[tokio::test]
    async fn request_times_out_when_no_reply_arrives() {
        let registry = Registry::new();
        let t1 = Arc::new(registry.register(1).await);
        let _t2 = Arc::new(registry.register(2).await);
        let dispatcher = Dispatcher::new(t1, 0);
        dispatcher.spawn_receive_loop(|_, _| {});

        let result = dispatcher
            .request(
                2,
                Message::FinishRequest { tx_id: CacheVersion::ZERO, commit: true },
                CorrelationId::Tx(CacheVersion::ZERO),
                0,
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn stale_topology_version_is_rejected_before_sending() {
        let registry = Registry::new();
        let t1 = Arc::new(registry.register(1).await);
        let dispatcher = Dispatcher::new(t1, 5);

        let result = dispatcher
            .request(
                2,
                Message::FinishRequest { tx_id: CacheVersion::ZERO, commit: true },
                CorrelationId::Tx(CacheVersion::ZERO),
                3,
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(Error::TopologyChanged { started: 3, current: 5 })));
    }
}
