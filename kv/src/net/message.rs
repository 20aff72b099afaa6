//! Typed wire messages (§6's table) and their length-prefixed framing.
//!
//! On the wire: a little-endian `u32` length (of everything that follows),
//! a little-endian `u32` message kind tag, then a `bincode`-encoded
//! payload. Kept as plain serialize/deserialize functions rather than
//! stateful message objects with an internal cursor, per §9's "no
//! per-message cursor state" redesign note.

use serde_derive::{Deserialize, Serialize};

use crate::entry::EntryValue;
use crate::error::{CResult, Error};
use crate::topology::{NodeId, PartitionEntry, PartitionId};
use crate::txn::{ConcurrencyMode, IsolationLevel};
use crate::version::CacheVersion;

pub type TxId = CacheVersion;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOp {
    pub key: Vec<u8>,
    pub value: EntryValue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadVersion {
    pub key: Vec<u8>,
    pub version: CacheVersion,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedInfo {
    pub write_set: Vec<WriteOp>,
    pub commit_version: CacheVersion,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupplyEntry {
    pub key: Vec<u8>,
    pub value: EntryValue,
    pub version: CacheVersion,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    GetRequest { key: Vec<u8>, requester_id: NodeId, top_ver: u32 },
    GetResponse { key: Vec<u8>, value: Option<EntryValue>, version: Option<CacheVersion>, err: Option<String> },

    Invalidate { key: Vec<u8>, new_version: CacheVersion, tx_id: Option<TxId> },

    PrepareRequest {
        tx_id: TxId,
        write_set: Vec<WriteOp>,
        read_versions: Vec<ReadVersion>,
        isolation: IsolationLevel,
        concurrency: ConcurrencyMode,
        timeout_millis: u64,
    },
    PrepareResponse { tx_id: TxId, ok: bool, conflict_keys: Vec<Vec<u8>> },

    FinishRequest { tx_id: TxId, commit: bool },
    FinishResponse { tx_id: TxId, ok: bool },

    CheckCommitted { tx_id: TxId, participants: Vec<NodeId> },
    CheckCommittedResponse { tx_id: TxId, committed_info: Option<CommittedInfo> },

    PartitionsSingle { top_ver: u32, partitions: Vec<(PartitionId, PartitionEntry)> },
    PartitionsFull { top_ver: u32, map: Vec<(NodeId, Vec<(PartitionId, PartitionEntry)>)> },

    DemandMessage { top_ver: u32, partitions: Vec<PartitionId> },
    SupplyMessage { top_ver: u32, part_id: PartitionId, entries: Vec<SupplyEntry>, last: bool },
}

impl Message {
    fn kind(&self) -> u32 {
        match self {
            Message::GetRequest { .. } => 1,
            Message::GetResponse { .. } => 2,
            Message::Invalidate { .. } => 3,
            Message::PrepareRequest { .. } => 4,
            Message::PrepareResponse { .. } => 5,
            Message::FinishRequest { .. } => 6,
            Message::FinishResponse { .. } => 7,
            Message::CheckCommitted { .. } => 8,
            Message::CheckCommittedResponse { .. } => 9,
            Message::PartitionsSingle { .. } => 10,
            Message::PartitionsFull { .. } => 11,
            Message::DemandMessage { .. } => 12,
            Message::SupplyMessage { .. } => 13,
        }
    }

    /// Encodes `len(kind ++ payload) : u32 LE | kind : u32 LE | payload`.
    pub fn encode(&self) -> CResult<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let body_len = 4u32 + payload.len() as u32;
        let mut buf = Vec::with_capacity(4 + body_len as usize);
        buf.extend_from_slice(&body_len.to_le_bytes());
        buf.extend_from_slice(&self.kind().to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decodes a frame body (kind + payload, without the outer length
    /// prefix — the transport strips that while reading).
    pub fn decode(body: &[u8]) -> CResult<Message> {
        if body.len() < 4 {
            return Err(Error::Decode("frame shorter than kind tag".to_string()));
        }
        bincode::deserialize(&body[4..]).map_err(Error::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_request_round_trips_through_encode_decode() {
        let msg = Message::GetRequest { key: b"a".to_vec(), requester_id: 3, top_ver: 7 };
        let encoded = msg.encode().unwrap();
        let body_len = u32::from_le_bytes(encoded[0..4].try_into().unwrap()) as usize;
        assert_eq!(encoded.len(), 4 + body_len);

        let decoded = Message::decode(&encoded[4..]).unwrap();
        match decoded {
            Message::GetRequest { key, requester_id, top_ver } => {
                assert_eq!(key, b"a");
                assert_eq!(requester_id, 3);
                assert_eq!(top_ver, 7);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn kind_tag_is_stable_per_variant() {
        let a = Message::FinishRequest { tx_id: CacheVersion::ZERO, commit: true };
        let b = Message::FinishRequest { tx_id: CacheVersion::ZERO, commit: false };
        assert_eq!(a.kind(), b.kind());
    }
}
