//! In-memory vote state machine and per-follower replication progress.

use crate::ids::{LogOffset, NodeId, Term};
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

/// Leader-only bookkeeping about how caught up one follower is.
///
/// Invariants: `match_offset <= next_offset - 1`;
/// `match_offset <= leader's prev_log_offset`.
#[derive(Debug, Clone)]
pub struct FollowerProgress {
	pub match_offset: LogOffset,
	pub next_offset: LogOffset,
	pub in_flight: bool,
	pub last_contact: Option<Instant>,
	pub last_sent: Option<Instant>,
}

impl FollowerProgress {
	pub fn new(leader_last_offset: LogOffset) -> Self {
		FollowerProgress {
			match_offset: 0,
			next_offset: leader_last_offset + 1,
			in_flight: false,
			last_contact: None,
			last_sent: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct FollowerState {
	pub election_deadline: Instant,
	pub current_leader: Option<NodeId>,
	pub last_heartbeat: Instant,
}

#[derive(Debug, Clone)]
pub struct CandidateState {
	pub election_started_at: Instant,
	pub election_deadline: Instant,
	pub votes_received: HashSet<NodeId>,
	pub some_rejected: bool,
}

#[derive(Debug, Clone)]
pub struct LeaderState {
	pub followers: HashMap<NodeId, FollowerProgress>,
}

/// The three-state core of the Raft role machine.
#[derive(Debug, Clone)]
pub enum VoteState {
	Follower(FollowerState),
	Candidate(CandidateState),
	Leader(LeaderState),
}

impl VoteState {
	pub fn new_follower(now: Instant, election_deadline: Instant) -> Self {
		VoteState::Follower(FollowerState {
			election_deadline,
			current_leader: None,
			last_heartbeat: now,
		})
	}

	pub fn is_leader(&self) -> bool {
		matches!(self, VoteState::Leader(_))
	}

	pub fn label(&self) -> &'static str {
		match self {
			VoteState::Follower(_) => "follower",
			VoteState::Candidate(_) => "candidate",
			VoteState::Leader(_) => "leader",
		}
	}
}

/// The full, in-memory protocol metadata snapshot a reader may take without
/// contending on the operation lock.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolMetadata {
	pub current_term: Term,
	pub prev_log_offset: LogOffset,
	pub prev_log_term: Term,
	pub commit_offset: LogOffset,
}
