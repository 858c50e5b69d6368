//! Core data types shared across the consensus module.
//!
//! `Entry` in the teacher's `server::log` module was a concrete
//! `(index, term, data: Vec<u8>)` triple. Here `data` becomes a type parameter so
//! the core stays opaque to whatever the embedding client wants to replicate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identifies one replica in the cluster.
pub type ServerId = u64;

/// A position in the replicated log. `-1` is the sentinel for "no entry".
pub type LogIndex = i64;

/// No log entry / no leader-log position.
pub const NIL_INDEX: LogIndex = -1;

/// Bound required of anything the core will replicate.
///
/// The core never inspects a command's contents; it only needs to move it across
/// an `.await` point, clone it for the leader's local log, and persist it.
pub trait Command: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Command for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// An entry in the replicated log: an opaque command tagged with the term in
/// which the leader appended it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub command: C,
    pub term: u64,
}

/// A committed entry delivered to the client state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry<C> {
    pub command: C,
    pub index: LogIndex,
    pub term: u64,
}
