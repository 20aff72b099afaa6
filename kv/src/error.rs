//! Crate-wide error taxonomy.
//!
//! Every cross-node and cross-component failure mode named by the cache
//! core maps to one variant here. Message-layer and transient failures are
//! expected to be absorbed into bounded retries by the caller; transactional
//! and partition-loss errors are never silently retried and must surface to
//! whoever started the operation.

use std::fmt;

use crate::topology::{NodeId, PartitionId};
use crate::version::CacheVersion;

pub type CResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The target node of an operation has left the topology.
    NodeLeft(NodeId),
    /// The operation started at one topology version and a new version
    /// committed before it completed.
    TopologyChanged { started: u32, current: u32 },
    /// An entry lock could not be acquired before its deadline.
    LockTimeout { key: Vec<u8> },
    /// Wound-wait detected a cycle and this transaction was chosen to yield.
    Deadlock { tx: CacheVersion },
    /// Optimistic prepare found the read version stale.
    OptimisticConflict { key: Vec<u8> },
    /// No surviving owner exists for a partition.
    PartitionLost(PartitionId),
    /// A cross-node operation exceeded its deadline.
    Timeout,
    /// Recovery could not determine the outcome of a transaction and fell
    /// back to a heuristic rollback. Logged loudly by the caller.
    TxHeuristic { tx: CacheVersion },
    /// The partition is not owned locally and cannot serve the request.
    NotOwner(PartitionId),
    /// A transaction is not in a state that permits the requested operation.
    InvalidTxState { tx: CacheVersion, detail: &'static str },
    /// The entry store stayed over its eviction budget after a full pass —
    /// every resident block is pinned by a reader, a lock, or non-`OWNING`
    /// state. Backpressure for the write that pushed it over, not a failure
    /// of the write itself.
    EvictStall,
    Io(std::io::Error),
    Encode(String),
    Decode(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NodeLeft(id) => write!(f, "node {id} left the topology"),
            Error::TopologyChanged { started, current } => {
                write!(f, "topology changed from version {started} to {current}")
            }
            Error::LockTimeout { key } => write!(f, "lock timeout on key {:?}", key),
            Error::Deadlock { tx } => write!(f, "transaction {:?} wounded, rolling back", tx),
            Error::OptimisticConflict { key } => {
                write!(f, "optimistic conflict on key {:?}", key)
            }
            Error::PartitionLost(p) => write!(f, "partition {p} lost, no surviving owner"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::TxHeuristic { tx } => {
                write!(f, "transaction {:?} heuristically rolled back during recovery", tx)
            }
            Error::NotOwner(p) => write!(f, "partition {p} is not owned locally"),
            Error::InvalidTxState { tx, detail } => {
                write!(f, "transaction {:?} invalid state: {detail}", tx)
            }
            Error::EvictStall => write!(f, "entry store over its eviction budget, nothing evictable"),
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Encode(e) => write!(f, "encode error: {e}"),
            Error::Decode(e) => write!(f, "decode error: {e}"),
            Error::Config(e) => write!(f, "config error: {e}"),
            Error::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encode(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl Error {
    /// Transient, message-layer errors the core retries internally up to a
    /// bounded attempt count; all other variants surface to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NodeLeft(_) | Error::TopologyChanged { .. } | Error::Timeout | Error::EvictStall)
    }
}
