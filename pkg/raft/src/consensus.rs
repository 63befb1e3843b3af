//! The Consensus Instance: one per replication group. Owns the group's durable
//! state, vote state machine, per-follower replication state, and commit-index
//! advancement.
//!
//! The state machine is driven by native `async fn`s over `tokio::select!`
//! timers and channels, with every mutating operation serialized under a
//! single-permit `tokio::sync::Mutex`.

use crate::clock::{jittered_election_timeout, Clock};
use crate::config::RaftConfig;
use crate::connection::ConnectionCache;
use crate::errors::{RaftError, Result};
use crate::hooks::CommitHook;
use crate::ids::{GroupId, LogOffset, NodeId, Term};
use crate::log::LogHandle;
use crate::proto::{
	AppendEntriesMeta, AppendEntriesReply, AppendEntriesRequest, EntryKind, GroupConfiguration,
	LogEntry, VoteReply, VoteRequest, VotedForRecord,
};
use crate::state::{CandidateState, FollowerProgress, LeaderState, ProtocolMetadata, VoteState};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Broadcast whenever this instance's leadership status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadershipStatus {
	pub group: GroupId,
	pub term: Term,
	pub current_leader: Option<NodeId>,
}

/// Invoked by the instance on every leadership transition; normally supplied
/// by the `GroupManager` so it can fan the event out to its subscribers.
pub type LeadershipCallback = Arc<dyn Fn(LeadershipStatus) + Send + Sync>;

/// Result of a successful `propose_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposeOutcome {
	pub term: Term,
	pub offset: LogOffset,
}

struct Snapshot {
	meta: ProtocolMetadata,
	is_leader: bool,
	current_leader: Option<NodeId>,
}

/// What was actually sent to a follower, kept around so the reply handler
/// knows whether to treat it as a pure heartbeat or as a real replication
/// batch.
struct PendingSend {
	was_empty: bool,
	last_offset: LogOffset,
}

struct Inner {
	current_term: Term,
	voted_for: Option<NodeId>,
	state: VoteState,
	hooks: Vec<Arc<dyn CommitHook>>,
	commit_offset: LogOffset,
	pending: HashMap<NodeId, PendingSend>,
}

/// One Raft replication group's consensus core.
pub struct ConsensusInstance {
	id: NodeId,
	group: GroupId,
	config: GroupConfiguration,
	raft_config: RaftConfig,
	log: Arc<dyn LogHandle>,
	connections: Arc<dyn ConnectionCache>,
	clock: Arc<dyn Clock>,
	leadership_callback: LeadershipCallback,

	/// The single-permit operation lock serializing every mutating operation.
	inner: Mutex<Inner>,
	snapshot: StdRwLock<Snapshot>,

	gate: CancellationToken,
	started: AtomicBool,
	election_reset: Notify,
}

impl ConsensusInstance {
	pub fn new(
		id: NodeId,
		group: GroupId,
		config: GroupConfiguration,
		raft_config: RaftConfig,
		log: Arc<dyn LogHandle>,
		connections: Arc<dyn ConnectionCache>,
		clock: Arc<dyn Clock>,
		leadership_callback: LeadershipCallback,
	) -> Arc<Self> {
		let now = clock.now();
		Arc::new(ConsensusInstance {
			id,
			group,
			config,
			raft_config,
			log,
			connections,
			clock,
			leadership_callback,
			inner: Mutex::new(Inner {
				current_term: 0,
				voted_for: None,
				state: VoteState::new_follower(now, now),
				hooks: Vec::new(),
				commit_offset: 0,
				pending: HashMap::new(),
			}),
			snapshot: StdRwLock::new(Snapshot {
				meta: ProtocolMetadata {
					current_term: 0,
					prev_log_offset: 0,
					prev_log_term: 0,
					commit_offset: 0,
				},
				is_leader: false,
				current_leader: None,
			}),
			gate: CancellationToken::new(),
			started: AtomicBool::new(false),
			election_reset: Notify::new(),
		})
	}

	// ---- pure accessors, safe concurrent with the operation lock ----

	pub fn group_id(&self) -> GroupId {
		self.group
	}

	pub fn node_id(&self) -> NodeId {
		self.id
	}

	pub fn config(&self) -> &GroupConfiguration {
		&self.config
	}

	pub fn is_leader(&self) -> bool {
		self.snapshot.read().unwrap().is_leader
	}

	pub fn meta(&self) -> ProtocolMetadata {
		self.snapshot.read().unwrap().meta
	}

	pub fn current_leader(&self) -> Option<NodeId> {
		self.snapshot.read().unwrap().current_leader
	}

	// ---- lifecycle ----

	/// Recovers durable state, installs the jittered election timer, enters
	/// Follower. Fails with `RecoveryError` if `voted_for` is corrupt or the
	/// log's tail term disagrees with recovered metadata.
	#[instrument(skip(self), fields(group = %self.group, node = %self.id))]
	pub async fn start(self: &Arc<Self>) -> Result<()> {
		if self.started.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		let voted = read_voted_for(self.log.base_directory()).await?;

		let last_offset = self.log.last_offset();
		let last_term = if last_offset == 0 {
			0
		} else {
			self.log.term_at(last_offset).ok_or_else(|| {
				RaftError::RecoveryError(format!(
					"log tail at offset {} has no recoverable term",
					last_offset
				))
			})?
		};

		if last_term > voted.term {
			return Err(RaftError::RecoveryError(format!(
				"log tail term {} exceeds persisted current_term {}",
				last_term, voted.term
			)));
		}

		let now = self.clock.now();
		let deadline = now + jittered_election_timeout(self.raft_config.election_timeout_jitter_ms());

		{
			let mut inner = self.inner.lock().await;
			inner.current_term = voted.term;
			inner.voted_for = voted.voted_for;
			inner.state = VoteState::new_follower(now, deadline);
			inner.commit_offset = 0;
			self.publish_snapshot(&inner);
		}

		info!("consensus instance started as follower");
		self.spawn_election_timer();

		Ok(())
	}

	/// Cancels timers, drains the background gate, awaits the operation lock,
	/// releases resources. Idempotent.
	#[instrument(skip(self), fields(group = %self.group, node = %self.id))]
	pub async fn stop(self: &Arc<Self>) {
		if self.gate.is_cancelled() {
			return;
		}
		self.gate.cancel();
		// An uncontended acquire proves no mutating operation is still in flight.
		let _ = self.inner.lock().await;
		info!("consensus instance stopped");
	}

	fn spawn_election_timer(self: &Arc<Self>) {
		let this = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				let deadline = {
					let inner = this.inner.lock().await;
					match &inner.state {
						VoteState::Follower(s) => s.election_deadline,
						VoteState::Candidate(s) => s.election_deadline,
						VoteState::Leader(_) => {
							// Leaders don't run an election timer; park until
							// stepped down, woken by `election_reset`.
							this.clock.now() + std::time::Duration::from_secs(3600)
						}
					}
				};

				tokio::select! {
					_ = tokio::time::sleep_until(deadline) => {
						this.dispatch_election().await;
					}
					_ = this.election_reset.notified() => {
						continue;
					}
					_ = this.gate.cancelled() => {
						break;
					}
				}
			}
		});
	}

	fn reset_election_timer(&self) {
		self.election_reset.notify_one();
	}

	fn publish_snapshot(&self, inner: &Inner) {
		let prev_log_offset = self.log.last_offset();
		let prev_log_term = if prev_log_offset == 0 {
			0
		} else {
			self.log.term_at(prev_log_offset).unwrap_or(0)
		};

		let (is_leader, current_leader) = match &inner.state {
			VoteState::Follower(s) => (false, s.current_leader),
			VoteState::Candidate(_) => (false, None),
			VoteState::Leader(_) => (true, Some(self.id)),
		};

		let mut snap = self.snapshot.write().unwrap();
		snap.meta = ProtocolMetadata {
			current_term: inner.current_term,
			prev_log_offset,
			prev_log_term,
			commit_offset: inner.commit_offset,
		};
		snap.is_leader = is_leader;
		snap.current_leader = current_leader;
	}

	/// Registers a commit hook; invoked synchronously, under the operation
	/// lock, in registration order.
	pub async fn register_hook(&self, hook: Arc<dyn CommitHook>) {
		let mut inner = self.inner.lock().await;
		inner.hooks.push(hook);
	}

	// ---- election: recipient side ----

	#[instrument(skip(self, req), fields(group = %self.group, node = %self.id))]
	pub async fn vote(&self, req: VoteRequest) -> Result<VoteReply> {
		if self.gate.is_cancelled() {
			return Err(RaftError::Stopped);
		}
		let mut inner = self.inner.lock().await;

		if req.term < inner.current_term {
			return Ok(VoteReply {
				group: self.group,
				term: inner.current_term,
				granted: false,
				log_ok: false,
			});
		}

		if req.term > inner.current_term {
			self.step_down(&mut inner, req.term);
		}

		let last_offset = self.log.last_offset();
		let last_term = if last_offset == 0 {
			0
		} else {
			self.log.term_at(last_offset).unwrap_or(0)
		};

		let log_ok = req.prev_log_term > last_term
			|| (req.prev_log_term == last_term && req.prev_log_offset >= last_offset);

		let already_voted_other = matches!(inner.voted_for, Some(id) if id != req.node_id);
		let granted = log_ok && !already_voted_other;

		if granted {
			inner.voted_for = Some(req.node_id);
			let record = VotedForRecord {
				term: inner.current_term,
				voted_for: Some(req.node_id),
			};
			write_voted_for(self.log.base_directory(), &record).await?;

			if let VoteState::Follower(ref mut s) = inner.state {
				s.election_deadline = self.clock.now()
					+ jittered_election_timeout(self.raft_config.election_timeout_jitter_ms());
			}
			self.reset_election_timer();
			debug!(candidate = %req.node_id, term = inner.current_term, "granted vote");
		}

		self.publish_snapshot(&inner);

		Ok(VoteReply {
			group: self.group,
			term: inner.current_term,
			granted,
			log_ok,
		})
	}

	// ---- election: candidate side ----

	async fn dispatch_election(self: &Arc<Self>) {
		let (peers, voted_record) = {
			let mut inner = self.inner.lock().await;
			if inner.state.is_leader() {
				return;
			}

			inner.current_term += 1;
			inner.voted_for = Some(self.id);
			let term = inner.current_term;

			let now = self.clock.now();
			let deadline =
				now + jittered_election_timeout(self.raft_config.election_timeout_jitter_ms());
			inner.state = VoteState::Candidate(CandidateState {
				election_started_at: now,
				election_deadline: deadline,
				votes_received: std::iter::once(self.id).collect(),
				some_rejected: false,
			});

			info!(term, "starting election");
			self.publish_snapshot(&inner);

			let record = VotedForRecord {
				term,
				voted_for: Some(self.id),
			};

			(
				self.config.peers_excluding(self.id).collect::<Vec<_>>(),
				record,
			)
		};

		if write_voted_for(self.log.base_directory(), &voted_record)
			.await
			.is_err()
		{
			warn!("failed to persist vote-for-self, abandoning election attempt");
			return;
		}

		self.maybe_become_leader().await;

		let last_offset = self.log.last_offset();
		let last_term = if last_offset == 0 {
			0
		} else {
			self.log.term_at(last_offset).unwrap_or(0)
		};

		let req = VoteRequest {
			group: self.group,
			node_id: self.id,
			term: voted_record.term,
			prev_log_offset: last_offset,
			prev_log_term: last_term,
		};

		for peer in peers {
			let this = Arc::clone(self);
			let req = req.clone();
			tokio::spawn(async move {
				if let Ok(reply) = this.connections.vote(peer, req).await {
					this.handle_vote_reply(peer, reply).await;
				}
			});
		}
	}

	async fn handle_vote_reply(self: &Arc<Self>, from: NodeId, reply: VoteReply) {
		let should_check_majority = {
			let mut inner = self.inner.lock().await;

			if reply.term > inner.current_term {
				self.step_down(&mut inner, reply.term);
				self.publish_snapshot(&inner);
				return;
			}

			if reply.term != inner.current_term {
				return;
			}

			match &mut inner.state {
				VoteState::Candidate(s) => {
					if reply.granted {
						s.votes_received.insert(from);
					} else {
						s.some_rejected = true;
					}
					true
				}
				_ => false,
			}
		};

		if should_check_majority {
			self.maybe_become_leader().await;
		}
	}

	async fn maybe_become_leader(self: &Arc<Self>) {
		let outcome = {
			let mut inner = self.inner.lock().await;
			let votes = match &inner.state {
				VoteState::Candidate(s) => s.votes_received.len(),
				_ => return,
			};

			if votes < self.config.majority_size() {
				return;
			}

			let last_offset = self.log.last_offset();
			let followers = self
				.config
				.peers_excluding(self.id)
				.map(|p| (p, FollowerProgress::new(last_offset)))
				.collect();

			inner.state = VoteState::Leader(LeaderState { followers });
			inner.pending.clear();
			info!(term = inner.current_term, "became leader");

			self.publish_snapshot(&inner);
			inner.current_term
		};

		let term = outcome;

		(self.leadership_callback)(LeadershipStatus {
			group: self.group,
			term,
			current_leader: Some(self.id),
		});

		// Force commit-index advancement in the new term with a no-op entry.
		let _ = self
			.propose_entry(EntryKind::Data, Bytes::new(), true)
			.await;

		self.reset_election_timer();
		self.replicate_tick().await;
	}

	/// Adopts a higher term: clears `voted_for`, then demotes to Follower.
	/// Callers must only invoke this when `term > inner.current_term`; a
	/// term that hasn't actually changed must go through `demote_to_follower`
	/// instead, which leaves `voted_for` untouched.
	fn step_down(&self, inner: &mut Inner, term: Term) {
		inner.current_term = term;
		inner.voted_for = None;
		self.demote_to_follower(inner);
	}

	/// Converts the current state to Follower without touching `current_term`
	/// or `voted_for`. Used when a Candidate or Leader observes a valid
	/// AppendEntries at its own current term: the term hasn't changed, so who
	/// it voted for this term must not change either.
	fn demote_to_follower(&self, inner: &mut Inner) {
		let now = self.clock.now();
		let deadline = now + jittered_election_timeout(self.raft_config.election_timeout_jitter_ms());
		let was_leader = inner.state.is_leader();
		inner.state = VoteState::new_follower(now, deadline);
		inner.pending.clear();
		if was_leader {
			(self.leadership_callback)(LeadershipStatus {
				group: self.group,
				term: inner.current_term,
				current_leader: None,
			});
		}
		self.reset_election_timer();
	}

	// ---- replication: follower side ----

	#[instrument(skip(self, req), fields(group = %self.group, node = %self.id))]
	pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesReply> {
		if self.gate.is_cancelled() {
			return Err(RaftError::Stopped);
		}
		let mut inner = self.inner.lock().await;

		let current_term = inner.current_term;
		if req.meta.term < current_term {
			return Ok(AppendEntriesReply {
				group: self.group,
				node_id: self.id,
				term: current_term,
				success: false,
				last_log_offset: None,
			});
		}

		// A strictly higher term means we must adopt it, which also clears
		// `voted_for`. An equal term just demotes a Candidate (or confirms a
		// Follower) without touching the term or vote we already recorded
		// for it, otherwise a reordered `VoteRequest` for the same term
		// could be granted a second time (see `demote_to_follower`).
		if req.meta.term > current_term {
			self.step_down(&mut inner, req.meta.term);
		} else {
			self.demote_to_follower(&mut inner);
		}
		if let VoteState::Follower(ref mut s) = inner.state {
			s.current_leader = Some(req.node_id);
			s.last_heartbeat = self.clock.now();
			s.election_deadline = self.clock.now()
				+ jittered_election_timeout(self.raft_config.election_timeout_jitter_ms());
		}
		let current_term = inner.current_term;

		match self.log.term_at(req.meta.prev_log_offset) {
			Some(term) if term == req.meta.prev_log_term => {}
			Some(_) => {
				return Ok(AppendEntriesReply {
					group: self.group,
					node_id: self.id,
					term: current_term,
					success: false,
					last_log_offset: Some(self.log.last_offset()),
				});
			}
			None if req.meta.prev_log_offset == 0 => {}
			None => {
				return Ok(AppendEntriesReply {
					group: self.group,
					node_id: self.id,
					term: current_term,
					success: false,
					last_log_offset: Some(self.log.last_offset()),
				});
			}
		}

		let mut first_new = 0;
		for e in req.entries.iter() {
			match self.log.term_at(e.offset) {
				Some(t) if t == e.term => first_new += 1,
				Some(_) => {
					self.log.truncate_suffix(e.offset).await?;
					break;
				}
				None => break,
			}
		}

		let new_entries = &req.entries[first_new..];
		if !new_entries.is_empty() {
			let begin_offset = new_entries[0].offset;
			for hook in inner.hooks.iter() {
				if let Err(e) = hook.pre_commit(begin_offset, new_entries).await {
					return Err(RaftError::HookFailed(e.to_string()));
				}
			}

			let append_result = self
				.log
				.append(
					new_entries.to_vec(),
					self.raft_config.raft_fsync_mode,
					std::time::Duration::from_millis(self.raft_config.raft_disk_timeout_ms),
				)
				.await;

			if let Err(e) = append_result {
				for hook in inner.hooks.iter() {
					let _ = hook.abort(begin_offset).await;
				}
				return Err(e);
			}
		}

		let new_prev_log_offset = self.log.last_offset();

		if req.meta.commit_offset > inner.commit_offset {
			let new_commit = req.meta.commit_offset.min(new_prev_log_offset);
			if new_commit > inner.commit_offset {
				self.advance_commit(&mut inner, new_commit).await?;
			}
		}

		self.publish_snapshot(&inner);

		Ok(AppendEntriesReply {
			group: self.group,
			node_id: self.id,
			term: current_term,
			success: true,
			last_log_offset: Some(new_prev_log_offset),
		})
	}

	/// Shared commit-advancement path: advances `commit_offset` and invokes
	/// `commit` hooks for the newly-crossed range, in offset order.
	/// `pre_commit`/`abort` are not this function's concern: they bracket the
	/// disk append itself, at the two call sites that append entries
	/// (`propose_entry` for the leader's own proposals, the consistency-check
	/// branch above for a follower's); an entry has already been through that
	/// bracket by the time it is eligible to commit.
	async fn advance_commit(&self, inner: &mut Inner, new_commit: LogOffset) -> Result<()> {
		let old_commit = inner.commit_offset;
		debug_assert!(new_commit > old_commit);

		inner.commit_offset = new_commit;

		for hook in inner.hooks.iter() {
			if let Err(e) = hook.commit(old_commit + 1, new_commit).await {
				warn!(error = %e, "commit hook commit failed");
				return Err(RaftError::HookFailed(e.to_string()));
			}
		}

		Ok(())
	}

	// ---- client-facing proposal ----

	/// Appends a new command entry if this instance is currently the leader.
	/// Not one of the peer-facing RPCs or pure accessors, but what actually
	/// drives "new local appends" through the replication loop; the
	/// wire-protocol front end is the intended caller.
	pub async fn propose_command(&self, payload: Bytes) -> Result<ProposeOutcome> {
		self.propose_entry(EntryKind::Data, payload, false).await
	}

	async fn propose_entry(
		&self,
		kind: EntryKind,
		payload: Bytes,
		is_noop_on_new_leader: bool,
	) -> Result<ProposeOutcome> {
		let mut inner = self.inner.lock().await;

		if !inner.state.is_leader() && !is_noop_on_new_leader {
			let leader_hint = match &inner.state {
				VoteState::Follower(s) => s.current_leader,
				_ => None,
			};
			return Err(RaftError::NotLeader { leader_hint });
		}

		let term = inner.current_term;
		let offset = self.log.last_offset() + 1;
		let entry = LogEntry {
			term,
			offset,
			kind,
			payload,
		};

		for hook in inner.hooks.iter() {
			if let Err(e) = hook.pre_commit(offset, std::slice::from_ref(&entry)).await {
				return Err(RaftError::HookFailed(e.to_string()));
			}
		}

		let append_result = self
			.log
			.append(
				vec![entry],
				self.raft_config.raft_fsync_mode,
				std::time::Duration::from_millis(self.raft_config.raft_disk_timeout_ms),
			)
			.await;

		if let Err(e) = append_result {
			for hook in inner.hooks.iter() {
				let _ = hook.abort(offset).await;
			}
			return Err(e);
		}

		// A quorum-of-one group (or one where every follower already matched
		// this far) commits as soon as the leader's own log reflects the
		// entry; don't wait on a round trip through `process_heartbeat` that
		// may never come if there are no peers at all. A majority of
		// match_offset counting self is still a majority.
		let commit_advance = match &inner.state {
			VoteState::Leader(leader_state) => {
				self.find_next_commit_index(leader_state, term, inner.commit_offset)
			}
			_ => None,
		};
		if let Some(new_commit) = commit_advance {
			if let Err(e) = self.advance_commit(&mut inner, new_commit).await {
				warn!(error = %e, "commit hook failed advancing commit after local append");
			}
		}

		self.publish_snapshot(&inner);
		drop(inner);

		Ok(ProposeOutcome { term, offset })
	}

	// ---- replication: leader side, and the Heartbeat Manager entry point ----

	/// Drives one pass of the per-follower replication loop for every peer
	/// that is due: not already in flight, and either behind the leader's
	/// tail or past the heartbeat-suppression window. Called both by the
	/// `HeartbeatManager`'s tick and immediately after a new local append or
	/// a fresh election win, so client-driven replication and heartbeats
	/// share one code path.
	pub async fn replicate_tick(self: &Arc<Self>) {
		let (sends, term, commit_offset) = {
			let mut inner = self.inner.lock().await;
			let leader_state = match &mut inner.state {
				VoteState::Leader(s) => s,
				_ => return,
			};

			let leader_last_offset = self.log.last_offset();
			let heartbeat_interval =
				std::time::Duration::from_millis(self.raft_config.raft_heartbeat_interval_ms);
			let now = self.clock.now();

			let mut sends = Vec::new();
			for peer in self.config.peers_excluding(self.id) {
				let progress = leader_state
					.followers
					.entry(peer)
					.or_insert_with(|| FollowerProgress::new(leader_last_offset));

				if progress.in_flight {
					continue;
				}

				let caught_up = progress.match_offset >= leader_last_offset;
				if caught_up {
					let due = progress
						.last_sent
						.map(|t| now.duration_since(t) >= heartbeat_interval)
						.unwrap_or(true);
					if !due {
						continue;
					}
				}

				let prev_offset = progress.next_offset.saturating_sub(1);
				sends.push((peer, prev_offset));
				progress.in_flight = true;
				progress.last_sent = Some(now);
			}

			(sends, inner.current_term, inner.commit_offset)
		};

		for (peer, prev_offset) in sends {
			let this = Arc::clone(self);
			tokio::spawn(async move {
				let prev_term = if prev_offset == 0 {
					0
				} else {
					this.log.term_at(prev_offset).unwrap_or(0)
				};
				let entries = this
					.log
					.read(
						prev_offset + 1,
						this.raft_config.raft_replicate_batch_max_bytes,
					)
					.await
					.unwrap_or_default();
				let was_empty = entries.is_empty();
				let last_offset = entries.last().map(|e| e.offset).unwrap_or(prev_offset);

				{
					let mut inner = this.inner.lock().await;
					inner.pending.insert(
						peer,
						PendingSend {
							was_empty,
							last_offset,
						},
					);
				}

				let req = AppendEntriesRequest {
					group: this.group,
					node_id: this.id,
					meta: AppendEntriesMeta {
						term,
						prev_log_offset: prev_offset,
						prev_log_term: prev_term,
						commit_offset,
					},
					entries,
				};

				match this.connections.append_entries(peer, req).await {
					Ok(reply) => this.process_heartbeat(reply).await,
					Err(_) => this.clear_in_flight(peer).await,
				}
			});
		}
	}

	async fn clear_in_flight(&self, peer: NodeId) {
		let mut inner = self.inner.lock().await;
		if let VoteState::Leader(ref mut s) = inner.state {
			if let Some(progress) = s.followers.get_mut(&peer) {
				progress.in_flight = false;
			}
		}
		inner.pending.remove(&peer);
	}

	/// Called with the reply to any `append_entries` this instance sent as
	/// leader, whether issued by the `HeartbeatManager`'s tick or by
	/// `replicate_tick` in response to a new local append. A reply to an
	/// empty (pure heartbeat) batch only updates `last_contact`; `match_offset`
	/// advances only from non-empty batches.
	#[instrument(skip(self, reply), fields(group = %self.group, node = %self.id))]
	pub async fn process_heartbeat(self: &Arc<Self>, reply: AppendEntriesReply) {
		let mut inner = self.inner.lock().await;

		if reply.term > inner.current_term {
			self.step_down(&mut inner, reply.term);
			self.publish_snapshot(&inner);
			return;
		}

		let pending = inner.pending.remove(&reply.node_id);
		let current_term = inner.current_term;
		let current_commit = inner.commit_offset;

		let mut should_propose_noop = false;
		let mut commit_advance: Option<LogOffset> = None;

		if let VoteState::Leader(ref mut leader_state) = inner.state {
			if let Some(progress) = leader_state.followers.get_mut(&reply.node_id) {
				progress.in_flight = false;
				progress.last_contact = Some(self.clock.now());

				let Some(pending) = pending else {
					return;
				};

				if pending.was_empty {
					// Informational only; match_offset never advances off a
					// reply to an empty batch.
					return;
				}

				if reply.success {
					if pending.last_offset > progress.match_offset {
						progress.match_offset = pending.last_offset;
						progress.next_offset = pending.last_offset + 1;
					}
					if let Some(follower_last) = reply.last_log_offset {
						let leader_last = self.log.last_offset();
						if follower_last > leader_last {
							should_propose_noop = true;
						}
					}
				} else if let Some(hint) = reply.last_log_offset {
					progress.next_offset = (progress.next_offset.saturating_sub(1))
						.min(hint + 1)
						.max(1);
				} else {
					progress.next_offset = progress.next_offset.saturating_sub(1).max(1);
				}

				commit_advance =
					self.find_next_commit_index(leader_state, current_term, current_commit);
			}
		}

		if let Some(new_commit) = commit_advance {
			if let Err(e) = self.advance_commit(&mut inner, new_commit).await {
				warn!(error = %e, "commit advance failed after replication reply");
			}
		}

		self.publish_snapshot(&inner);
		drop(inner);

		if should_propose_noop {
			let _ = self
				.propose_entry(EntryKind::Data, Bytes::new(), true)
				.await;
		}

		self.replicate_tick().await;
	}

	/// Finds the highest offset `N > commit_offset` with `term_at(N) ==
	/// current_term` that a majority of `match_offset` (counting self) has
	/// reached. Leaders only ever commit their own term's entries directly;
	/// prior-term entries ride along transitively.
	fn find_next_commit_index(
		&self,
		leader_state: &LeaderState,
		current_term: Term,
		commit_offset: LogOffset,
	) -> Option<LogOffset> {
		let majority = self.config.majority_size();
		let mut candidate = self.log.last_offset();

		while candidate > commit_offset {
			let term = self.log.term_at(candidate)?;
			if term < current_term {
				break;
			}
			if term == current_term {
				let mut count = 1; // ourselves
				for (peer, progress) in leader_state.followers.iter() {
					if !self.config.contains(*peer) {
						continue;
					}
					if progress.match_offset >= candidate {
						count += 1;
					}
				}
				if count >= majority {
					return Some(candidate);
				}
			}
			candidate -= 1;
		}

		None
	}
}

const VOTED_FOR_FILE_NAME: &str = "voted_for";

async fn read_voted_for(base_directory: &Path) -> Result<VotedForRecord> {
	let path = base_directory.join(VOTED_FOR_FILE_NAME);
	match tokio::fs::read(&path).await {
		Ok(bytes) => VotedForRecord::decode(&bytes).ok_or_else(|| {
			RaftError::RecoveryError(format!("corrupt voted_for file at {}", path.display()))
		}),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VotedForRecord::default()),
		Err(e) => Err(RaftError::DiskIoError(e)),
	}
}

/// Atomic write-to-temp + rename so a crash mid-write never leaves a
/// truncated `voted_for` file behind.
async fn write_voted_for(base_directory: &Path, record: &VotedForRecord) -> Result<()> {
	tokio::fs::create_dir_all(base_directory).await?;
	let final_path = base_directory.join(VOTED_FOR_FILE_NAME);
	let tmp_path: PathBuf = base_directory.join(format!("{}.tmp", VOTED_FOR_FILE_NAME));

	let bytes = record.encode();
	{
		use tokio::io::AsyncWriteExt;
		let mut file = tokio::fs::File::create(&tmp_path).await?;
		file.write_all(&bytes).await?;
		file.sync_all().await?;
	}
	tokio::fs::rename(&tmp_path, &final_path).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::MockClock;
	use crate::config::RaftConfig;
	use crate::connection::MockConnectionCache;
	use crate::ids::{GroupId, NodeId};
	use crate::log::MemoryLog;

	fn make_instance(
		id: NodeId,
		members: Vec<NodeId>,
		clock: Arc<MockClock>,
	) -> Arc<ConsensusInstance> {
		let config = GroupConfiguration::new(members);
		let log = Arc::new(MemoryLog::new(format!("/tmp/raft-test-{}", id.0)));
		let connections = Arc::new(MockConnectionCache::new(id));
		ConsensusInstance::new(
			id,
			GroupId(1),
			config,
			RaftConfig::default(),
			log,
			connections,
			clock,
			Arc::new(|_status| {}),
		)
	}

	#[tokio::test(start_paused = true)]
	async fn single_node_cluster_becomes_leader_on_start() {
		let clock = Arc::new(MockClock::new());
		let instance = make_instance(NodeId(1), vec![NodeId(1)], clock.clone());
		instance.start().await.unwrap();
		clock.advance(std::time::Duration::from_millis(900)).await;
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		assert!(instance.is_leader());
	}

	#[tokio::test]
	async fn vote_rejects_stale_term() {
		let clock = Arc::new(MockClock::new());
		let instance = make_instance(NodeId(1), vec![NodeId(1), NodeId(2)], clock);
		instance.start().await.unwrap();

		let _ = instance
			.vote(VoteRequest {
				group: GroupId(1),
				node_id: NodeId(2),
				term: 5,
				prev_log_offset: 0,
				prev_log_term: 0,
			})
			.await
			.unwrap();

		let reply = instance
			.vote(VoteRequest {
				group: GroupId(1),
				node_id: NodeId(2),
				term: 1,
				prev_log_offset: 0,
				prev_log_term: 0,
			})
			.await
			.unwrap();
		assert!(!reply.granted);
		assert_eq!(reply.term, 5);
	}

	#[tokio::test]
	async fn append_entries_truncates_conflicting_suffix() {
		let clock = Arc::new(MockClock::new());
		let instance = make_instance(NodeId(2), vec![NodeId(1), NodeId(2)], clock);
		instance.start().await.unwrap();

		instance
			.append_entries(AppendEntriesRequest {
				group: GroupId(1),
				node_id: NodeId(1),
				meta: AppendEntriesMeta {
					term: 1,
					prev_log_offset: 0,
					prev_log_term: 0,
					commit_offset: 0,
				},
				entries: vec![LogEntry {
					term: 1,
					offset: 1,
					kind: EntryKind::Data,
					payload: Bytes::from_static(b"a"),
				}],
			})
			.await
			.unwrap();
		assert_eq!(instance.meta().prev_log_offset, 1);

		// A higher-term leader overwrites offset 1 with a conflicting entry.
		let reply = instance
			.append_entries(AppendEntriesRequest {
				group: GroupId(1),
				node_id: NodeId(1),
				meta: AppendEntriesMeta {
					term: 2,
					prev_log_offset: 0,
					prev_log_term: 0,
					commit_offset: 0,
				},
				entries: vec![LogEntry {
					term: 2,
					offset: 1,
					kind: EntryKind::Data,
					payload: Bytes::from_static(b"b"),
				}],
			})
			.await
			.unwrap();
		assert!(reply.success);
		assert_eq!(instance.meta().prev_log_term, 2);
	}

	struct RecordingHook {
		events: std::sync::Mutex<Vec<String>>,
	}

	impl RecordingHook {
		fn new() -> Self {
			RecordingHook {
				events: std::sync::Mutex::new(Vec::new()),
			}
		}
	}

	#[async_trait::async_trait]
	impl CommitHook for RecordingHook {
		async fn pre_commit(&self, begin_offset: LogOffset, _entries: &[LogEntry]) -> Result<()> {
			self.events
				.lock()
				.unwrap()
				.push(format!("pre_commit({})", begin_offset));
			Ok(())
		}

		async fn abort(&self, begin_offset: LogOffset) -> Result<()> {
			self.events
				.lock()
				.unwrap()
				.push(format!("abort({})", begin_offset));
			Ok(())
		}

		async fn commit(&self, begin_offset: LogOffset, committed_offset: LogOffset) -> Result<()> {
			self.events
				.lock()
				.unwrap()
				.push(format!("commit({},{})", begin_offset, committed_offset));
			Ok(())
		}
	}

	#[tokio::test(start_paused = true)]
	async fn single_node_cluster_commits_proposed_entries_without_peers() {
		let clock = Arc::new(MockClock::new());
		let instance = make_instance(NodeId(1), vec![NodeId(1)], clock.clone());
		let hook = Arc::new(RecordingHook::new());
		instance.register_hook(hook.clone()).await;

		instance.start().await.unwrap();
		clock.advance(std::time::Duration::from_millis(900)).await;
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		assert!(instance.is_leader());

		// The no-op entry the new leader appends to force commit-index
		// advancement in its own term should already be committed: a
		// single-node group's "majority counting self" is satisfied the
		// instant the local append lands, with no follower replies to wait on.
		assert_eq!(instance.meta().commit_offset, 1);

		let outcome = instance.propose_command(Bytes::from_static(b"x")).await.unwrap();
		assert_eq!(outcome.offset, 2);
		assert_eq!(instance.meta().commit_offset, 2);

		let events = hook.events.lock().unwrap().clone();
		// pre_commit always precedes the commit for the same offset, in order.
		let pre_idx = events.iter().position(|e| e == "pre_commit(2)").unwrap();
		let commit_idx = events.iter().position(|e| e.starts_with("commit(2,")).unwrap();
		assert!(pre_idx < commit_idx);
	}
}
