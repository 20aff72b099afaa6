//! Point-to-point message transport (§1's "reliable message transport"
//! external collaborator): enqueue+deliver, FIFO per sender→receiver pair.
//!
//! Two implementations share one trait: `tcp` for a real cluster, `local`
//! for an in-process registry that lets every end-to-end scenario in the
//! spec run deterministically inside one test process without sockets.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::{CResult, Error};
use crate::net::message::Message;
use crate::topology::NodeId;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: NodeId, msg: Message) -> CResult<()>;

    /// Blocks until the next message addressed to this node arrives.
    async fn recv(&self) -> Option<(NodeId, Message)>;
}

pub mod local {
    use super::*;

    /// An in-process registry of mailboxes, one per node, connected by
    /// unbounded FIFO channels — delivery order per `(sender, receiver)`
    /// pair is exactly send order, satisfying §5's ordering guarantee
    /// without any real network involved.
    #[derive(Clone, Default)]
    pub struct Registry {
        mailboxes: Arc<RwLock<HashMap<NodeId, mpsc::UnboundedSender<(NodeId, Message)>>>>,
    }

    impl Registry {
        pub fn new() -> Self {
            Registry::default()
        }

        pub async fn register(&self, node: NodeId) -> LocalTransport {
            let (tx, rx) = mpsc::unbounded_channel();
            self.mailboxes.write().await.insert(node, tx);
            LocalTransport { node, registry: self.clone(), inbox: Mutex::new(rx) }
        }
    }

    pub struct LocalTransport {
        node: NodeId,
        registry: Registry,
        inbox: Mutex<mpsc::UnboundedReceiver<(NodeId, Message)>>,
    }

    #[async_trait::async_trait]
    impl Transport for LocalTransport {
        async fn send(&self, to: NodeId, msg: Message) -> CResult<()> {
            let mailboxes = self.registry.mailboxes.read().await;
            let sender = mailboxes.get(&to).ok_or(Error::NodeLeft(to))?;
            sender.send((self.node, msg)).map_err(|_| Error::NodeLeft(to))
        }

        async fn recv(&self) -> Option<(NodeId, Message)> {
            self.inbox.lock().await.recv().await
        }
    }
}

pub mod tcp {
    use super::*;
    use std::net::SocketAddr;

    /// Real sockets, one persistent outbound connection per destination
    /// node, a single inbound listener fanning every accepted connection
    /// into one receive queue.
    pub struct TcpTransport {
        local: NodeId,
        peers: HashMap<NodeId, SocketAddr>,
        outbound: RwLock<HashMap<NodeId, Mutex<TcpStream>>>,
        inbound: Mutex<mpsc::UnboundedReceiver<(NodeId, Message)>>,
    }

    impl TcpTransport {
        pub async fn bind(local: NodeId, listen_addr: SocketAddr, peers: HashMap<NodeId, SocketAddr>) -> CResult<Arc<Self>> {
            let listener = TcpListener::bind(listen_addr).await?;
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(TcpTransport {
                local,
                peers,
                outbound: RwLock::new(HashMap::new()),
                inbound: Mutex::new(rx),
            });

            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            let tx = tx.clone();
                            tokio::spawn(read_loop(stream, addr, tx));
                        }
                        Err(e) => {
                            log::error!("tcp accept failed: {e}");
                            break;
                        }
                    }
                }
            });

            Ok(transport)
        }

        async fn connection_for(&self, to: NodeId) -> CResult<()> {
            if self.outbound.read().await.contains_key(&to) {
                return Ok(());
            }
            let addr = *self.peers.get(&to).ok_or(Error::NodeLeft(to))?;
            let stream = TcpStream::connect(addr).await?;
            self.outbound.write().await.insert(to, Mutex::new(stream));
            Ok(())
        }
    }

    async fn read_loop(mut stream: TcpStream, addr: SocketAddr, tx: mpsc::UnboundedSender<(NodeId, Message)>) {
        loop {
            match read_frame(&mut stream).await {
                Ok(Some(body)) => match Message::decode(&body) {
                    Ok(msg) => {
                        // The sender's NodeId isn't on the wire in this
                        // minimal framing; callers that need it carry their
                        // own id inside the message payload (every request
                        // variant above already does).
                        let _ = tx.send((0, msg));
                    }
                    Err(e) => log::warn!("failed to decode frame from {addr}: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    log::warn!("connection from {addr} closed: {e}");
                    break;
                }
            }
        }
    }

    async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    #[async_trait::async_trait]
    impl Transport for TcpTransport {
        async fn send(&self, to: NodeId, msg: Message) -> CResult<()> {
            self.connection_for(to).await?;
            let frame = msg.encode()?;
            let outbound = self.outbound.read().await;
            let conn = outbound.get(&to).ok_or(Error::NodeLeft(to))?;
            let mut stream = conn.lock().await;
            stream.write_all(&frame).await?;
            Ok(())
        }

        async fn recv(&self) -> Option<(NodeId, Message)> {
            self.inbound.lock().await.recv().await
        }
    }

    impl TcpTransport {
        pub fn local_node(&self) -> NodeId {
            self.local
        }
    }
}
