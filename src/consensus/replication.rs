//! Leader heartbeats/log replication and inbound `AppendEntries` handling.
//!
//! Grounded on the teacher's `Server::send_append_entries`,
//! `Server::update_commit_index`, `AppendEntriesHandler`, and `peer::Peer`'s
//! per-peer background loop — generalised from one long-lived thread per peer
//! (`peer.rs`'s `channel_select!` over timer/append/shutdown messages) into a
//! single heartbeat task that spawns one RPC task per peer per round, plus a
//! `tokio::select!` over the interval timer and the "trigger append" channel.

use std::cmp::min;

use log::{debug, info};

use super::{Raft, Role};
use crate::transport::{AppendEntriesArgs, AppendEntriesReply};
use crate::types::{Command, LogIndex, ServerId, NIL_INDEX};

impl<C: Command> Raft<C> {
    /// Transitions to Leader: initializes `nextIndex`/`matchIndex` for every
    /// peer and spawns the heartbeat/append task.
    pub(crate) async fn start_leader(&self) {
        let next_default = {
            let mut state = self.inner.state.lock().await;
            if state.role != Role::Candidate {
                return;
            }
            state.role = Role::Leader;
            let next_default = state.log.len() as LogIndex;
            for peer in &self.inner.peer_ids {
                state.next_index.insert(*peer, next_default);
                state.match_index.insert(*peer, NIL_INDEX);
            }
            info!(
                "{}: becomes Leader, term={}",
                self.inner.id, state.current_term
            );
            next_default
        };
        debug!("{}: initial nextIndex {}", self.inner.id, next_default);

        let rx = self
            .inner
            .trigger_append_rx
            .lock()
            .unwrap()
            .take()
            .expect("trigger_append_rx taken by a concurrent leader epoch");

        let raft = self.clone();
        tokio::spawn(async move {
            raft.run_heartbeat_task(rx).await;
        });
    }

    async fn run_heartbeat_task(&self, mut trigger_rx: tokio::sync::mpsc::Receiver<()>) {
        self.send_append_entries_to_all_peers().await;

        let mut ticker = tokio::time::interval(self.inner.options.heartbeat_interval);
        ticker.tick().await; // first tick fires immediately; already sent above

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                woken = trigger_rx.recv() => {
                    if woken.is_none() {
                        debug!("{}: heartbeat task exiting, trigger channel closed", self.inner.id);
                        *self.inner.trigger_append_rx.lock().unwrap() = Some(trigger_rx);
                        return;
                    }
                }
            }

            {
                let state = self.inner.state.lock().await;
                if state.role != Role::Leader {
                    debug!("{}: heartbeat task exiting, role is {:?}", self.inner.id, state.role);
                    drop(state);
                    *self.inner.trigger_append_rx.lock().unwrap() = Some(trigger_rx);
                    return;
                }
            }

            self.send_append_entries_to_all_peers().await;
        }
    }

    async fn send_append_entries_to_all_peers(&self) {
        for peer in self.inner.peer_ids.clone() {
            let raft = self.clone();
            tokio::spawn(async move {
                raft.send_append_entries(peer).await;
            });
        }
    }

    /// Sends a single `AppendEntries` RPC to `peer`, with whatever entries
    /// follow its last-known `nextIndex`, and applies the reply.
    async fn send_append_entries(&self, peer: ServerId) {
        let (term, args) = {
            let state = self.inner.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            let term = state.current_term;
            let next_index = (*state.next_index.get(&peer).unwrap_or(&0)).clamp(0, state.log.len() as LogIndex);
            let prev_log_index = next_index - 1;
            // The spec's sentinel for "no previous entry" is prevLogTerm = -1,
            // paired with prevLogIndex = -1. Terms are represented here as
            // unsigned (`u64`), so `0` stands in for that sentinel instead —
            // safe because term 0 never appears on a real entry (the first
            // election produces term 1).
            let prev_log_term = if prev_log_index >= 0 {
                state.log[prev_log_index as usize].term
            } else {
                0
            };
            let entries = state.log[next_index as usize..].to_vec();
            let args = AppendEntriesArgs {
                term,
                leader_id: self.inner.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: state.commit_index,
            };
            (term, args)
        };

        if let Ok(reply) = self.inner.transport.append_entries(peer, args.clone()).await {
            self.handle_append_entries_reply(peer, term, args, reply)
                .await;
        }
    }

    async fn handle_append_entries_reply(
        &self,
        peer: ServerId,
        sent_term: u64,
        sent_args: AppendEntriesArgs<C>,
        reply: AppendEntriesReply,
    ) {
        let mut state = self.inner.state.lock().await;

        if reply.term > sent_term {
            if let Err(err) = self.become_follower(&mut state, reply.term) {
                self.fail_fatally(&mut state, &err);
            }
            return;
        }
        if state.role != Role::Leader || state.current_term != sent_term {
            return;
        }

        if reply.success {
            let new_match = sent_args.prev_log_index + sent_args.entries.len() as LogIndex;
            state.match_index.insert(peer, new_match);
            state.next_index.insert(peer, new_match + 1);
            self.advance_commit_index(&mut state);
        } else {
            let next = state.next_index.entry(peer).or_insert(0);
            *next = (*next - 1).max(0);
            debug!(
                "{}: AppendEntries to {} rejected, retrying at nextIndex {}",
                self.inner.id, peer, *next
            );
        }
    }

    /// Scans for the highest index replicated on a majority of replicas whose
    /// term matches the current term, and advances `commit_index` to it.
    fn advance_commit_index(&self, state: &mut super::State<C>) {
        if state.role != Role::Leader {
            return;
        }

        let total = self.total_replicas();
        let last_index = state.log.len() as LogIndex - 1;
        let mut new_commit_index = state.commit_index;

        let mut candidate = last_index;
        while candidate > state.commit_index {
            if state.log[candidate as usize].term == state.current_term {
                let mut count = 1;
                for peer in &self.inner.peer_ids {
                    if *state.match_index.get(peer).unwrap_or(&NIL_INDEX) >= candidate {
                        count += 1;
                    }
                }
                if 2 * count > total {
                    new_commit_index = candidate;
                    break;
                }
            }
            candidate -= 1;
        }

        if new_commit_index != state.commit_index {
            info!(
                "{}: advances commitIndex {} -> {}",
                self.inner.id, state.commit_index, new_commit_index
            );
            state.commit_index = new_commit_index;
            self.inner.new_commit_ready.notify();
            // Wake the heartbeat loop so followers learn the new leaderCommit
            // without waiting for the next scheduled heartbeat tick.
            self.inner.trigger_append.notify();
        }
    }

    /// Handles an inbound `AppendEntries` RPC, including the heartbeat case
    /// where `entries` is empty.
    pub async fn handle_append_entries(&self, args: AppendEntriesArgs<C>) -> AppendEntriesReply {
        let mut state = self.inner.state.lock().await;
        if state.role == Role::Dead {
            return AppendEntriesReply::default();
        }

        if args.term > state.current_term {
            if let Err(err) = self.become_follower(&mut state, args.term) {
                self.fail_fatally(&mut state, &err);
                return AppendEntriesReply::default();
            }
        }

        if args.term < state.current_term {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
            };
        }

        if state.role == Role::Candidate {
            if let Err(err) = self.become_follower(&mut state, args.term) {
                self.fail_fatally(&mut state, &err);
                return AppendEntriesReply::default();
            }
        }
        state.election_reset_deadline = std::time::Instant::now();

        let log_ok = if args.prev_log_index == NIL_INDEX {
            true
        } else {
            let idx = args.prev_log_index as usize;
            idx < state.log.len() && state.log[idx].term == args.prev_log_term
        };

        if !log_ok {
            let reply_term = state.current_term;
            if let Err(err) = self.persist(&state) {
                self.fail_fatally(&mut state, &err);
                return AppendEntriesReply::default();
            }
            return AppendEntriesReply {
                term: reply_term,
                success: false,
            };
        }

        let mut insert_at = (args.prev_log_index + 1) as usize;
        let mut new_entries = args.entries.into_iter();
        loop {
            let (existing, incoming) = (state.log.get(insert_at), new_entries.next());
            match (existing, incoming) {
                (Some(existing), Some(incoming)) => {
                    if existing.term != incoming.term {
                        state.log.truncate(insert_at);
                        state.log.push(incoming);
                        insert_at += 1;
                        break;
                    }
                    insert_at += 1;
                }
                (None, Some(incoming)) => {
                    state.log.push(incoming);
                    insert_at += 1;
                }
                (_, None) => break,
            }
        }
        for incoming in new_entries {
            state.log.push(incoming);
        }

        if args.leader_commit > state.commit_index {
            let last_new_index = state.log.len() as LogIndex - 1;
            state.commit_index = min(args.leader_commit, last_new_index);
            self.inner.new_commit_ready.notify();
        }

        if let Err(err) = self.persist(&state) {
            self.fail_fatally(&mut state, &err);
            return AppendEntriesReply::default();
        }

        AppendEntriesReply {
            term: state.current_term,
            success: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{new_test_raft, set_state};
    use super::*;
    use crate::types::LogEntry;

    fn entry(command: &str, term: u64) -> LogEntry<String> {
        LogEntry {
            command: command.to_string(),
            term,
        }
    }

    #[tokio::test]
    async fn first_heartbeat_is_accepted_with_no_prior_entries() {
        let raft = new_test_raft(vec![2, 3]).await;
        let reply = raft
            .handle_append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: NIL_INDEX,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: NIL_INDEX,
            })
            .await;
        assert!(reply.success);
        assert_eq!(reply.term, 1);
    }

    #[tokio::test]
    async fn rejects_stale_leader_term() {
        let raft = new_test_raft(vec![2, 3]).await;
        set_state(&raft, |state| state.current_term = 9).await;

        let reply = raft
            .handle_append_entries(AppendEntriesArgs {
                term: 4,
                leader_id: 2,
                prev_log_index: NIL_INDEX,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: NIL_INDEX,
            })
            .await;

        assert!(!reply.success);
        assert_eq!(reply.term, 9);
    }

    // Consistency check: a prevLogIndex past the end of our log is rejected.
    #[tokio::test]
    async fn rejects_append_past_end_of_log() {
        let raft = new_test_raft(vec![2, 3]).await;
        set_state(&raft, |state| state.current_term = 1).await;

        let reply = raft
            .handle_append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 3,
                prev_log_term: 1,
                entries: vec![entry("x", 1)],
                leader_commit: NIL_INDEX,
            })
            .await;

        assert!(!reply.success);
    }

    // Property 7 / S5: a follower with a diverging suffix truncates to match
    // the leader once the leader's entries arrive.
    #[tokio::test]
    async fn truncates_diverging_suffix() {
        let raft = new_test_raft(vec![2, 3]).await;
        set_state(&raft, |state| {
            state.current_term = 2;
            state.log = vec![entry("x", 1), entry("bogus", 1)];
        })
        .await;

        let reply = raft
            .handle_append_entries(AppendEntriesArgs {
                term: 2,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 1,
                entries: vec![entry("z", 2)],
                leader_commit: NIL_INDEX,
            })
            .await;

        assert!(reply.success);
        set_state(&raft, |state| {
            assert_eq!(state.log, vec![entry("x", 1), entry("z", 2)]);
        })
        .await;
    }

    // Property 7: replaying an identical AppendEntries leaves the log unchanged.
    #[tokio::test]
    async fn replayed_append_is_idempotent() {
        let raft = new_test_raft(vec![2, 3]).await;
        set_state(&raft, |state| state.current_term = 1).await;

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: NIL_INDEX,
            prev_log_term: 0,
            entries: vec![entry("x", 1), entry("y", 1)],
            leader_commit: NIL_INDEX,
        };

        raft.handle_append_entries(args.clone()).await;
        raft.handle_append_entries(args.clone()).await;
        raft.handle_append_entries(args).await;

        set_state(&raft, |state| {
            assert_eq!(state.log, vec![entry("x", 1), entry("y", 1)]);
        })
        .await;
    }

    #[tokio::test]
    async fn leader_commit_advances_follower_commit_index() {
        let raft = new_test_raft(vec![2, 3]).await;
        set_state(&raft, |state| state.current_term = 1).await;

        raft.handle_append_entries(AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: NIL_INDEX,
            prev_log_term: 0,
            entries: vec![entry("x", 1), entry("y", 1)],
            leader_commit: 0,
        })
        .await;

        set_state(&raft, |state| {
            assert_eq!(state.commit_index, 0);
        })
        .await;
    }

    #[tokio::test]
    async fn candidate_steps_down_on_append_entries_from_current_term_leader() {
        let raft = new_test_raft(vec![2, 3]).await;
        set_state(&raft, |state| {
            state.role = Role::Candidate;
            state.current_term = 2;
        })
        .await;

        raft.handle_append_entries(AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: NIL_INDEX,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: NIL_INDEX,
        })
        .await;

        let (_, _, is_leader) = raft.report().await;
        assert!(!is_leader);
        set_state(&raft, |state| {
            assert_eq!(state.role, Role::Follower);
        })
        .await;
    }

    #[tokio::test]
    async fn dead_replica_ignores_append_entries() {
        let raft = new_test_raft(vec![2, 3]).await;
        raft.stop().await;

        let reply = raft
            .handle_append_entries(AppendEntriesArgs {
                term: 9,
                leader_id: 2,
                prev_log_index: NIL_INDEX,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: NIL_INDEX,
            })
            .await;

        assert_eq!(reply.term, 0);
        assert!(!reply.success);
    }
}
