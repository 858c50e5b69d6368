//! Election timer, vote solicitation, and inbound `RequestVote` handling.
//!
//! Grounded on the teacher's `generate_election_timeout`, `ServerState::
//! has_election_timeout_occured`, `Server::start_election`, and
//! `RequestVoteHandler`, generalised from the teacher's polling thread (`Server::
//! start_server`'s timeout-check loop) into a per-epoch spawned task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;
use tokio::time;

use super::{Raft, Role};
use crate::transport::{RequestVoteArgs, RequestVoteReply};
use crate::types::Command;

impl<C: Command> Raft<C> {
    /// Spawns a fresh election timer for the current Follower/Candidate epoch.
    ///
    /// Each call draws its own randomized timeout and only acts if, once it
    /// fires, the replica's term and role haven't moved on in the meantime —
    /// this is what lets stale timers from a previous epoch self-retire
    /// instead of needing to be cancelled explicitly.
    pub(crate) fn spawn_election_timer(&self) {
        let raft = self.clone();
        let timeout = raft.new_election_timeout();
        tokio::spawn(async move {
            raft.run_election_timer(timeout).await;
        });
    }

    fn new_election_timeout(&self) -> Duration {
        let (min, max) = self.inner.options.election_timeout_range;
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        let mut rng = rand::thread_rng();

        let ms = if self.inner.options.force_more_reelection && rng.gen_range(0..3) == 0 {
            min_ms
        } else if max_ms > min_ms {
            rng.gen_range(min_ms..max_ms)
        } else {
            min_ms
        };
        Duration::from_millis(ms)
    }

    async fn run_election_timer(&self, timeout: Duration) {
        let started_term = {
            let state = self.inner.state.lock().await;
            state.current_term
        };
        debug!(
            "{}: election timer started ({:?}), term {}",
            self.inner.id, timeout, started_term
        );

        let mut ticker = time::interval(self.inner.options.election_poll_interval);
        loop {
            ticker.tick().await;
            let mut state = self.inner.state.lock().await;

            if state.role != Role::Candidate && state.role != Role::Follower {
                debug!(
                    "{}: election timer bailing out, role is {:?}",
                    self.inner.id, state.role
                );
                return;
            }
            if state.current_term != started_term {
                debug!(
                    "{}: election timer bailing out, term changed {} -> {}",
                    self.inner.id, started_term, state.current_term
                );
                return;
            }
            if state.election_reset_deadline.elapsed() >= timeout {
                drop(state);
                self.start_election().await;
                return;
            }
        }
    }

    /// Becomes a Candidate for the next term and fans out `RequestVote` to
    /// every peer in its own spawned task, counting replies against a shared
    /// atomic as they arrive (SPEC_FULL §5's one exemption from the state
    /// mutex).
    async fn start_election(&self) {
        let (term, last_log_index, last_log_term, peer_ids) = {
            let mut state = self.inner.state.lock().await;
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.inner.id);
            state.election_reset_deadline = Instant::now();

            let term = state.current_term;
            if let Err(err) = self.persist(&state) {
                self.fail_fatally(&mut state, &err);
                return;
            }
            let (last_log_index, last_log_term) = state.last_log_index_term();
            info!("{}: becomes Candidate, term={}", self.inner.id, term);
            (term, last_log_index, last_log_term, self.inner.peer_ids.clone())
        };

        let votes = Arc::new(AtomicUsize::new(1));
        let total_replicas = self.total_replicas();

        for peer in peer_ids {
            let raft = self.clone();
            let votes = votes.clone();
            tokio::spawn(async move {
                let args = RequestVoteArgs {
                    term,
                    candidate_id: raft.inner.id,
                    last_log_index,
                    last_log_term,
                };
                if let Ok(reply) = raft.inner.transport.request_vote(peer, args).await {
                    raft.handle_request_vote_reply(term, reply, &votes, total_replicas)
                        .await;
                }
            });
        }

        self.spawn_election_timer();
    }

    async fn handle_request_vote_reply(
        &self,
        term: u64,
        reply: RequestVoteReply,
        votes: &AtomicUsize,
        total_replicas: usize,
    ) {
        let mut state = self.inner.state.lock().await;

        if state.role != Role::Candidate {
            return;
        }
        if reply.term > term {
            let _ = self.become_follower(&mut state, reply.term);
            return;
        }
        if reply.term != term || !reply.vote_granted {
            return;
        }

        let count = votes.fetch_add(1, Ordering::SeqCst) + 1;
        if 2 * count > total_replicas {
            info!("{}: wins election for term {}", self.inner.id, term);
            drop(state);
            self.start_leader().await;
        }
    }

    /// Handles an inbound `RequestVote` RPC.
    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.inner.state.lock().await;
        if state.role == Role::Dead {
            return RequestVoteReply::default();
        }

        if args.term > state.current_term {
            info!(
                "{}: observes higher term {} in RequestVote, becoming Follower",
                self.inner.id, args.term
            );
            if let Err(err) = self.become_follower(&mut state, args.term) {
                self.fail_fatally(&mut state, &err);
                return RequestVoteReply::default();
            }
        }

        let (our_last_index, our_last_term) = state.last_log_index_term();
        let log_ok = args.last_log_term > our_last_term
            || (args.last_log_term == our_last_term && args.last_log_index >= our_last_index);

        let already_voted_elsewhere = matches!(state.voted_for, Some(id) if id != args.candidate_id);
        let granted = state.current_term == args.term && !already_voted_elsewhere && log_ok;

        if granted {
            state.voted_for = Some(args.candidate_id);
            state.election_reset_deadline = Instant::now();
            info!(
                "{}: grants vote to {} in term {}",
                self.inner.id, args.candidate_id, args.term
            );
        }

        let reply = RequestVoteReply {
            term: state.current_term,
            vote_granted: granted,
        };

        if let Err(err) = self.persist(&state) {
            self.fail_fatally(&mut state, &err);
            return RequestVoteReply::default();
        }

        reply
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{new_test_raft, set_state};
    use super::*;

    #[tokio::test]
    async fn grants_vote_to_first_candidate_in_a_new_term() {
        let raft = new_test_raft(vec![2, 3]).await;

        let reply = raft
            .handle_request_vote(RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: -1,
                last_log_term: 0,
            })
            .await;

        assert_eq!(reply.term, 1);
        assert!(reply.vote_granted);
    }

    // Invariant 2: at most one distinct votedFor per term.
    #[tokio::test]
    async fn refuses_second_candidate_in_same_term() {
        let raft = new_test_raft(vec![2, 3]).await;

        let first = raft
            .handle_request_vote(RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: -1,
                last_log_term: 0,
            })
            .await;
        assert!(first.vote_granted);

        let second = raft
            .handle_request_vote(RequestVoteArgs {
                term: 1,
                candidate_id: 3,
                last_log_index: -1,
                last_log_term: 0,
            })
            .await;
        assert!(!second.vote_granted);
    }

    #[tokio::test]
    async fn regrants_vote_to_same_candidate_on_replayed_request() {
        let raft = new_test_raft(vec![2, 3]).await;
        for _ in 0..2 {
            let reply = raft
                .handle_request_vote(RequestVoteArgs {
                    term: 1,
                    candidate_id: 2,
                    last_log_index: -1,
                    last_log_term: 0,
                })
                .await;
            assert!(reply.vote_granted);
        }
    }

    #[tokio::test]
    async fn rejects_candidate_with_stale_log() {
        let raft = new_test_raft(vec![2, 3]).await;
        set_state(&raft, |state| {
            state.current_term = 5;
            state.log = vec![crate::types::LogEntry {
                command: "x".to_string(),
                term: 5,
            }];
        })
        .await;

        let reply = raft
            .handle_request_vote(RequestVoteArgs {
                term: 5,
                candidate_id: 2,
                last_log_index: -1,
                last_log_term: 0,
            })
            .await;

        assert!(!reply.vote_granted);
    }

    #[tokio::test]
    async fn grants_vote_and_steps_down_on_higher_term() {
        let raft = new_test_raft(vec![2, 3]).await;
        set_state(&raft, |state| {
            state.role = Role::Candidate;
            state.current_term = 3;
            state.voted_for = Some(1);
        })
        .await;

        let reply = raft
            .handle_request_vote(RequestVoteArgs {
                term: 4,
                candidate_id: 2,
                last_log_index: -1,
                last_log_term: 0,
            })
            .await;

        assert_eq!(reply.term, 4);
        assert!(reply.vote_granted);
        let (_, term, is_leader) = raft.report().await;
        assert_eq!(term, 4);
        assert!(!is_leader);
    }

    // §7: a persist failure on an RPC handler is fatal, not merely logged —
    // the replica becomes Dead rather than returning a reply implying an
    // effect it could not durably record.
    #[tokio::test]
    async fn persist_failure_on_request_vote_is_fatal() {
        use super::super::test_support::{new_test_raft_with_storage, FailingStorage};

        let raft = new_test_raft_with_storage(vec![2, 3], std::sync::Arc::new(FailingStorage)).await;

        let reply = raft
            .handle_request_vote(RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: -1,
                last_log_term: 0,
            })
            .await;

        assert!(!reply.vote_granted);
        let (_, _, is_leader) = raft.report().await;
        assert!(!is_leader);
        set_state(&raft, |state| {
            assert_eq!(state.role, Role::Dead);
        })
        .await;
    }

    #[tokio::test]
    async fn dead_replica_ignores_request_vote() {
        let raft = new_test_raft(vec![2, 3]).await;
        raft.stop().await;

        let reply = raft
            .handle_request_vote(RequestVoteArgs {
                term: 9,
                candidate_id: 2,
                last_log_index: -1,
                last_log_term: 0,
            })
            .await;

        assert_eq!(reply.term, 0);
        assert!(!reply.vote_granted);
    }
}
