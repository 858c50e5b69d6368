//! A replicated-log consensus core implementing the Raft protocol's election,
//! log replication, and commit pipeline.
//!
//! Embedders supply a [`transport::Transport`] (how RPCs reach peers) and a
//! [`storage::Storage`] (how durable state survives a restart); this crate
//! owns the state machine that decides when to hold an election, how to
//! replicate a leader's log, and when an entry is safe to apply. Entries
//! become visible to the embedder as [`types::CommitEntry`] values delivered
//! over a `tokio::sync::mpsc` channel supplied to [`consensus::Raft::new`].
//!
//! Descends from a capnp/TCP-based Raft prototype; this crate keeps its role
//! state machine and replication logic but runs on `tokio` tasks and
//! channels instead of dedicated OS threads, and treats the wire format as
//! entirely the embedder's concern.

pub mod config;
pub mod consensus;
pub mod error;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::RaftOptions;
pub use consensus::Raft;
pub use error::Error;
pub use storage::{MemoryStorage, Storage};
pub use transport::{LoopbackTransport, Transport};
pub use types::{Command, CommitEntry, LogEntry, LogIndex, ServerId};
