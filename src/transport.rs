//! The `Transport` collaborator: sends `RequestVote`/`AppendEntries` RPCs to a
//! peer and returns the reply, or an error if none was received.
//!
//! Grounded on the teacher's `server::peer` module, which built
//! `AppendEntriesMessage`/`RequestVoteMessage` and shipped them over a capnp +
//! custom TCP `rpc` crate via `Peer::append_entries_blocking`/`send_request_vote`.
//! This module keeps the same request/reply shapes but drops the capnp framing
//! (out of this crate's scope per SPEC_FULL §6.1 — the core only needs a trait
//! boundary, not a wire format) in favor of an `async_trait` call, matching how
//! the async-Raft implementations in the example pack expose their RPC layer.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::{Command, LogEntry, LogIndex, ServerId};

/// Arguments for a `RequestVote` RPC.
#[derive(Debug, Clone)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: u64,
}

/// Reply to a `RequestVote` RPC.
#[derive(Debug, Clone, Default)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// Arguments for an `AppendEntries` RPC (also used as the heartbeat when
/// `entries` is empty).
#[derive(Debug, Clone)]
pub struct AppendEntriesArgs<C> {
    pub term: u64,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: LogIndex,
}

/// Reply to an `AppendEntries` RPC.
#[derive(Debug, Clone, Default)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
}

/// Sends RPCs to peer replicas.
///
/// Implementations are expected to fail (return `Err`) rather than block
/// indefinitely; the core treats any error as "no reply received" and relies on
/// the next heartbeat or election cycle to retry.
#[async_trait]
pub trait Transport<C: Command>: Send + Sync {
    async fn request_vote(
        &self,
        peer: ServerId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    async fn append_entries(
        &self,
        peer: ServerId,
        args: AppendEntriesArgs<C>,
    ) -> Result<AppendEntriesReply, TransportError>;
}

/// An in-process `Transport` that dispatches directly to peer `Raft` handles,
/// skipping any wire format.
///
/// Grounded on the teacher's test double pattern (`peer.rs`'s
/// `#[cfg(test)] mod tests`, which built `Peer`/`PeerHandle` pairs wired
/// together with `std::sync::mpsc` channels rather than real sockets to
/// exercise RPC handling in isolation). Peers are registered after
/// construction since every replica's `Transport` is needed before any
/// replica's `Raft` handle exists.
pub struct LoopbackTransport<C: Command> {
    peers: std::sync::Mutex<std::collections::HashMap<ServerId, crate::consensus::Raft<C>>>,
}

impl<C: Command> LoopbackTransport<C> {
    pub fn new() -> Self {
        LoopbackTransport {
            peers: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Registers `raft` as the handle reachable at `id`. Call once per
    /// replica after every replica in the cluster has been constructed.
    pub fn register(&self, id: ServerId, raft: crate::consensus::Raft<C>) {
        self.peers.lock().unwrap().insert(id, raft);
    }

    fn handle(&self, peer: ServerId) -> Option<crate::consensus::Raft<C>> {
        self.peers.lock().unwrap().get(&peer).cloned()
    }
}

impl<C: Command> Default for LoopbackTransport<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: Command> Transport<C> for LoopbackTransport<C> {
    async fn request_vote(
        &self,
        peer: ServerId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        let raft = self
            .handle(peer)
            .ok_or_else(|| TransportError(format!("no such peer: {peer}")))?;
        Ok(raft.handle_request_vote(args).await)
    }

    async fn append_entries(
        &self,
        peer: ServerId,
        args: AppendEntriesArgs<C>,
    ) -> Result<AppendEntriesReply, TransportError> {
        let raft = self
            .handle(peer)
            .ok_or_else(|| TransportError(format!("no such peer: {peer}")))?;
        Ok(raft.handle_append_entries(args).await)
    }
}
