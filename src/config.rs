//! Tunable timing knobs for a `Raft` replica.
//!
//! Generalises the teacher's `server::Config`, which bundled the cluster map, the
//! initial leader hint, this server's own id/address, and a heartbeat timeout into
//! one struct. The cluster membership and transport addressing now belong to the
//! embedder's `Transport` implementation, so `RaftOptions` only keeps the timing
//! knobs the consensus module itself needs.

use std::time::Duration;

/// Construction-time options for a `Raft` replica.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Election timeouts are drawn uniformly from this range.
    pub election_timeout_range: (Duration, Duration),

    /// How often a leader sends heartbeats/append RPCs in the absence of a
    /// `submit`-triggered wakeup.
    pub heartbeat_interval: Duration,

    /// How often the election timer wakes to check whether the deadline has
    /// passed.
    pub election_poll_interval: Duration,

    /// Test/diagnostic knob: when set, one third of drawn election timeouts are
    /// pinned to the minimum of the range instead of sampled uniformly, biasing
    /// the cluster toward more frequent re-elections.
    pub force_more_reelection: bool,

    /// Buffer capacity of the internal "new commit ready" channel.
    pub new_commit_ready_capacity: usize,
}

impl Default for RaftOptions {
    fn default() -> Self {
        RaftOptions {
            election_timeout_range: (Duration::from_millis(150), Duration::from_millis(300)),
            heartbeat_interval: Duration::from_millis(50),
            election_poll_interval: Duration::from_millis(10),
            force_more_reelection: false,
            new_commit_ready_capacity: 16,
        }
    }
}
