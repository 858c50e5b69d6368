//! The consensus core: role state machine, election, replication, commit
//! advancement and persistence, all guarded by one mutex per the teacher's
//! `server::Server` / `server::ServerState` split (a handle holding
//! `Arc<Mutex<ServerState>>` plus peer handles) generalised to `tokio` tasks.

pub mod commit;
pub mod election;
pub mod persistence;
pub mod replication;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use log::info;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::RaftOptions;
use crate::error::Error;
use crate::storage::Storage;
use crate::transport::Transport;
use crate::types::{Command, CommitEntry, LogEntry, LogIndex, ServerId, NIL_INDEX};

/// A replica's role in the Raft role state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Dead,
}

/// The single mutex-guarded state record described in SPEC_FULL §3.
///
/// Mirrors the teacher's `server::ServerState`, which bundled
/// `current_state`/`current_term`/`commit_index`/`voted_for`/`last_leader_contact`
/// behind one lock (`server::Server::state`). `log`, `last_applied`, and the
/// leader-only `next_index`/`match_index` maps join that bundle here since the
/// spec requires every one of those fields to be observed under the same
/// critical section.
pub(crate) struct State<C> {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<ServerId>,
    pub log: Vec<LogEntry<C>>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub election_reset_deadline: Instant,
    pub next_index: HashMap<ServerId, LogIndex>,
    pub match_index: HashMap<ServerId, LogIndex>,
}

impl<C> State<C> {
    fn new() -> Self {
        State {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: NIL_INDEX,
            last_applied: NIL_INDEX,
            election_reset_deadline: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// `(index, term)` of the last entry in the log, or `(-1, 0)` if empty.
    pub fn last_log_index_term(&self) -> (LogIndex, u64) {
        match self.log.last() {
            Some(entry) => ((self.log.len() - 1) as LogIndex, entry.term),
            None => (NIL_INDEX, 0),
        }
    }
}

/// A bounded, closeable notification channel.
///
/// Generalises the teacher's `std::sync::mpsc::Sender<MainThreadMessage>` /
/// `Sender<PeerThreadMessage>` pipes (always-open, blocking `send`) into the
/// non-blocking, explicitly-closeable channels SPEC_FULL §5 calls for.
pub(crate) struct NotifyChannel {
    tx: StdMutex<Option<mpsc::Sender<()>>>,
}

impl NotifyChannel {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            NotifyChannel {
                tx: StdMutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Non-blocking notify. A full or already-closed channel is not an error:
    /// a pending wakeup already satisfies the request, or there is no
    /// consumer left to satisfy.
    pub(crate) fn notify(&self) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Closes the channel so the consumer's next `recv` drains and returns
    /// `None`.
    pub(crate) fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// The shared innards behind every clone of a `Raft` handle.
pub(crate) struct Inner<C: Command> {
    pub id: ServerId,
    pub peer_ids: Vec<ServerId>,
    pub state: Mutex<State<C>>,
    pub transport: Arc<dyn Transport<C>>,
    pub storage: Arc<dyn Storage>,
    pub options: RaftOptions,
    pub commit_tx: mpsc::Sender<CommitEntry<C>>,
    pub new_commit_ready: NotifyChannel,
    pub trigger_append: NotifyChannel,
    /// Reused across leader epochs: taken by the heartbeat task on
    /// `start_leader`, handed back when that task exits.
    pub trigger_append_rx: StdMutex<Option<mpsc::Receiver<()>>>,
}

/// A single replica in a fixed-size Raft cluster.
///
/// Cheaply `Clone`-able; every clone shares the same underlying state and
/// background tasks (an `Arc<Inner<C>>`), matching the teacher's
/// `Arc<Mutex<ServerState>>` sharing between `Server` and its RPC handlers
/// (`RequestVoteHandler`, `AppendEntriesHandler`).
#[derive(Clone)]
pub struct Raft<C: Command> {
    pub(crate) inner: Arc<Inner<C>>,
}

impl<C: Command> Raft<C> {
    /// Constructs a new replica.
    ///
    /// Restores persisted state if `storage.has_data()`, then spawns the
    /// commit-delivery task and a task that awaits `ready` before starting the
    /// election timer — mirroring the teacher's `Server::new` (which started
    /// peer threads and bound the RPC server eagerly) but deferring election
    /// activity until the caller releases every replica simultaneously.
    pub async fn new(
        id: ServerId,
        peer_ids: Vec<ServerId>,
        transport: Arc<dyn Transport<C>>,
        storage: Arc<dyn Storage>,
        ready: oneshot::Receiver<()>,
        commit_tx: mpsc::Sender<CommitEntry<C>>,
        options: RaftOptions,
    ) -> Result<Self, Error> {
        let mut state = State::new();
        if storage.has_data() {
            persistence::restore_from_storage(&mut state, storage.as_ref())?;
        }

        let (new_commit_ready, new_commit_rx) =
            NotifyChannel::new(options.new_commit_ready_capacity);
        let (trigger_append, trigger_append_rx) = NotifyChannel::new(1);

        let raft = Raft {
            inner: Arc::new(Inner {
                id,
                peer_ids,
                state: Mutex::new(state),
                transport,
                storage,
                options,
                commit_tx,
                new_commit_ready,
                trigger_append,
                trigger_append_rx: StdMutex::new(Some(trigger_append_rx)),
            }),
        };

        commit::spawn_commit_task(raft.clone(), new_commit_rx);

        {
            let raft = raft.clone();
            tokio::spawn(async move {
                let _ = ready.await;
                {
                    let mut state = raft.inner.state.lock().await;
                    state.election_reset_deadline = Instant::now();
                }
                raft.spawn_election_timer();
            });
        }

        Ok(raft)
    }

    /// `(id, current_term, is_leader)`. No side effects.
    pub async fn report(&self) -> (ServerId, u64, bool) {
        let state = self.inner.state.lock().await;
        (self.inner.id, state.current_term, state.role == Role::Leader)
    }

    /// Transitions to `Dead`. One-way: there is no way back to a live role.
    ///
    /// Mirrors the teacher's `Drop for PeerHandle`, which sent a `Shutdown`
    /// message and joined the background thread; here, closing
    /// `new_commit_ready` plays the same role for the commit-delivery task,
    /// and every other background task observes `Role::Dead` on its own
    /// mutex-guarded poll rather than needing an explicit join.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        info!("{}: becomes Dead", self.inner.id);
        state.role = Role::Dead;
        drop(state);
        self.inner.new_commit_ready.close();
    }

    /// If this replica is the Leader, appends `command` to the log, persists
    /// durable state, and wakes the heartbeat/append loop. Returns whether the
    /// command was accepted.
    pub async fn submit(&self, command: C) -> Result<bool, Error> {
        let mut state = self.inner.state.lock().await;
        if state.role != Role::Leader {
            return Ok(false);
        }

        let term = state.current_term;
        state.log.push(LogEntry { command, term });
        if let Err(err) = self.persist(&state) {
            self.fail_fatally(&mut state, &err);
            return Err(err);
        }
        drop(state);

        self.inner.trigger_append.notify();
        Ok(true)
    }

    /// Transitions to `Follower` for `term`. Caller must already hold `state`.
    ///
    /// Generalises the teacher's `ServerState::transition_to_follower`
    /// (`current_term`/`current_state`/`voted_for`/`election_timeout` reset) by
    /// also persisting the change and spawning a fresh election timer, the way
    /// the teacher's own comment (`// TODO: We need to stop the peers from
    /// continuing to send AppendEntries here`) wished it could.
    pub(crate) fn become_follower(&self, state: &mut State<C>, term: u64) -> Result<(), Error> {
        info!(
            "{}: becomes Follower, term={} (was {:?} term={})",
            self.inner.id, term, state.role, state.current_term
        );
        state.role = Role::Follower;
        state.current_term = term;
        state.voted_for = None;
        state.election_reset_deadline = Instant::now();
        self.persist(state)?;
        self.spawn_election_timer();
        Ok(())
    }

    /// Total number of replicas in the cluster, including self.
    pub(crate) fn total_replicas(&self) -> usize {
        self.inner.peer_ids.len() + 1
    }

    fn persist(&self, state: &State<C>) -> Result<(), Error> {
        persistence::persist_to_storage(state, self.inner.storage.as_ref())
    }

    /// A persist failure is fatal per SPEC_FULL §7: a replica that cannot
    /// durably record its own state can no longer guarantee invariant 1
    /// (`currentTerm` non-decreasing across restarts) or invariant 2 (at most
    /// one `votedFor` per term), so it must not continue participating.
    /// Marks the replica Dead in place, the same terminal transition `stop`
    /// performs, so every RPC handler and background task short-circuits
    /// from here on.
    pub(crate) fn fail_fatally(&self, state: &mut State<C>, err: &Error) {
        log::error!(
            "{}: fatal persistence failure, becoming Dead: {}",
            self.inner.id,
            err
        );
        state.role = Role::Dead;
        self.inner.new_commit_ready.close();
    }
}

/// Test-only scaffolding shared by the `election`/`replication` handler unit
/// tests: a standalone replica with a transport that is never actually
/// dispatched to, so RPC handlers can be called directly and inspected
/// without a live cluster around them.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::TransportError;
    use crate::storage::MemoryStorage;
    use crate::transport::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, Transport};
    use async_trait::async_trait;

    pub(crate) struct NeverTransport;

    #[async_trait]
    impl Transport<String> for NeverTransport {
        async fn request_vote(
            &self,
            _peer: ServerId,
            _args: RequestVoteArgs,
        ) -> Result<RequestVoteReply, TransportError> {
            Err(TransportError("unit test transport has no peers".into()))
        }

        async fn append_entries(
            &self,
            _peer: ServerId,
            _args: AppendEntriesArgs<String>,
        ) -> Result<AppendEntriesReply, TransportError> {
            Err(TransportError("unit test transport has no peers".into()))
        }
    }

    pub(crate) async fn new_test_raft(peer_ids: Vec<ServerId>) -> Raft<String> {
        new_test_raft_with_storage(peer_ids, Arc::new(MemoryStorage::new())).await
    }

    pub(crate) async fn new_test_raft_with_storage(
        peer_ids: Vec<ServerId>,
        storage: Arc<dyn crate::storage::Storage>,
    ) -> Raft<String> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (commit_tx, _commit_rx) = mpsc::channel(16);
        let raft = Raft::new(
            1,
            peer_ids,
            Arc::new(NeverTransport),
            storage,
            ready_rx,
            commit_tx,
            RaftOptions::default(),
        )
        .await
        .unwrap();
        // Never fires: these unit tests drive RPC handlers directly and must
        // not have a background election timer mutating state underneath them.
        std::mem::forget(ready_tx);
        raft
    }

    /// A `Storage` whose `set` always fails, for exercising the fatal
    /// persist-failure path (SPEC_FULL §7).
    pub(crate) struct FailingStorage;

    impl crate::storage::Storage for FailingStorage {
        fn has_data(&self) -> bool {
            false
        }

        fn get(&self, _key: &str) -> Option<Vec<u8>> {
            None
        }

        fn set(&self, _key: &str, _value: Vec<u8>) -> Result<(), crate::error::StorageError> {
            Err(crate::error::StorageError("disk full".into()))
        }
    }

    pub(crate) async fn set_state<C: Command>(raft: &Raft<C>, f: impl FnOnce(&mut State<C>)) {
        let mut state = raft.inner.state.lock().await;
        f(&mut state);
    }
}
