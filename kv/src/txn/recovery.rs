//! Tx Recovery (§4.5): when a participant notices its transaction's
//! coordinator has left the topology, it queries every other participant
//! with `CheckCommitted` and decides the outcome by the four-way rule.

use std::sync::Arc;
use std::time::Duration;

use crate::error::CResult;
use crate::net::dispatcher::{CorrelationId, Dispatcher};
use crate::net::message::{CommittedInfo, Message};
use crate::net::transport::Transport;
use crate::topology::NodeId;
use crate::txn::manager::TransactionManager;
use crate::version::CacheVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Commit(CommittedInfo),
    Rollback,
    /// Some participants never answered even after a retry; recovery gave
    /// up and rolled back heuristically. Callers must log `TX_HEURISTIC`.
    HeuristicRollback,
}

/// One participant's answer: `Answered(None)` for an explicit "I never
/// applied this transaction", `Answered(Some(_))` for a committed record,
/// `NoReply` for a timeout — the three-way distinction step 4 needs.
#[derive(Clone)]
enum Reply {
    Answered(Option<CommittedInfo>),
    NoReply,
}

/// Drives recovery for one transaction against a known participant set,
/// re-issuing once to any participant that didn't answer before giving up.
pub async fn recover<T: Transport + 'static>(
    manager: &Arc<TransactionManager<T>>,
    dispatcher: &Arc<Dispatcher<T>>,
    tx_id: CacheVersion,
    participants: Vec<NodeId>,
    top_ver: u32,
    timeout: Duration,
) -> CResult<RecoveryOutcome> {
    if let Some(info) = manager.committed_log.lock().await.get(&tx_id).cloned() {
        return Ok(RecoveryOutcome::Commit(info));
    }

    let mut replies = query_all(dispatcher, tx_id, &participants, top_ver, timeout).await;

    if let Some(outcome) = decide(&replies) {
        return Ok(outcome);
    }

    // One retry to whoever didn't answer, per §4.5 step 4.
    let missing: Vec<NodeId> = participants
        .iter()
        .zip(replies.iter())
        .filter(|(_, r)| matches!(r, Reply::NoReply))
        .map(|(n, _)| *n)
        .collect();
    if !missing.is_empty() {
        let retry = query_all(dispatcher, tx_id, &missing, top_ver, timeout).await;
        let mut retry_iter = retry.into_iter();
        for slot in replies.iter_mut() {
            if matches!(slot, Reply::NoReply) {
                if let Some(r) = retry_iter.next() {
                    *slot = r;
                }
            }
        }
    }

    Ok(decide(&replies).unwrap_or(RecoveryOutcome::HeuristicRollback))
}

async fn query_all<T: Transport + 'static>(
    dispatcher: &Arc<Dispatcher<T>>,
    tx_id: CacheVersion,
    participants: &[NodeId],
    top_ver: u32,
    timeout: Duration,
) -> Vec<Reply> {
    let mut out = Vec::with_capacity(participants.len());
    for node in participants {
        let msg = Message::CheckCommitted { tx_id, participants: participants.to_vec() };
        let result = dispatcher.request(*node, msg, CorrelationId::Tx(tx_id), top_ver, timeout).await;
        let reply = match result {
            Ok(Message::CheckCommittedResponse { committed_info, .. }) => Reply::Answered(committed_info),
            _ => Reply::NoReply,
        };
        out.push(reply);
    }
    out
}

/// The four-way rule from §4.5: any committed record wins; all-explicit-None
/// rolls back; anything still missing a reply is undecided (caller retries,
/// then falls back to `HeuristicRollback`).
fn decide(replies: &[Reply]) -> Option<RecoveryOutcome> {
    if let Some(info) = replies.iter().find_map(|r| match r {
        Reply::Answered(Some(info)) => Some(info.clone()),
        _ => None,
    }) {
        return Some(RecoveryOutcome::Commit(info));
    }
    if replies.iter().all(|r| matches!(r, Reply::Answered(None))) {
        return Some(RecoveryOutcome::Rollback);
    }
    None
}

/// Answers a `CheckCommitted` query: idempotent, since it only ever reads
/// `committed_log` and never mutates state.
pub async fn handle_check_committed<T: Transport + 'static>(manager: &Arc<TransactionManager<T>>, tx_id: CacheVersion) -> Option<CommittedInfo> {
    manager.committed_log.lock().await.get(&tx_id).cloned()
}
