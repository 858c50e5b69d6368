//! Commit-delivery task: turns advances in `commit_index` into an ordered
//! stream of `CommitEntry<C>` on the outbound channel.
//!
//! No teacher analogue exists — `server::mod.rs`'s `update_commit_index` only
//! advanced the index and left application to a `TODO`. Built from SPEC_FULL
//! §4.7, following the teacher's convention of a dedicated background task
//! communicating over a channel (`peer.rs`'s `MainThreadMessage` loop).

use log::{debug, warn};
use tokio::sync::mpsc;

use super::Raft;
use crate::types::{Command, CommitEntry};

pub(crate) fn spawn_commit_task<C: Command>(raft: Raft<C>, mut new_commit_ready: mpsc::Receiver<()>) {
    tokio::spawn(async move {
        while new_commit_ready.recv().await.is_some() {
            let to_deliver = {
                let mut state = raft.inner.state.lock().await;
                // Snapshotted once per wakeup and reused for every entry in
                // this batch, per SPEC_FULL §4.7 — not each entry's own
                // stored term.
                let snapshot_term = state.current_term;
                let mut entries = Vec::new();
                while state.last_applied < state.commit_index {
                    state.last_applied += 1;
                    let entry = &state.log[state.last_applied as usize];
                    entries.push(CommitEntry {
                        command: entry.command.clone(),
                        index: state.last_applied,
                        term: snapshot_term,
                    });
                }
                entries
            };

            for entry in to_deliver {
                if raft.inner.commit_tx.send(entry).await.is_err() {
                    warn!(
                        "{}: commit consumer dropped, stopping commit delivery",
                        raft.inner.id
                    );
                    return;
                }
            }
        }
        debug!("{}: commit-delivery task exiting, channel closed", raft.inner.id);
    });
}
