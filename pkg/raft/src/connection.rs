//! The connection cache: a pool of RPC channels to peer nodes, providing
//! `vote` and `append_entries` calls. This module defines the capability
//! trait plus a mock, fault-injecting implementation used by tests to
//! simulate network partitions and reorderings.

use crate::errors::{RaftError, Result};
use crate::group_manager::GroupManager;
use crate::ids::NodeId;
use crate::proto::{AppendEntriesReply, AppendEntriesRequest, VoteReply, VoteRequest};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, Weak};

/// A capability for issuing the two peer RPCs a `ConsensusInstance` needs.
/// Injected as a parameter, never a singleton, so tests can swap in a mock.
#[async_trait]
pub trait ConnectionCache: Send + Sync {
	async fn vote(&self, to: NodeId, req: VoteRequest) -> Result<VoteReply>;

	async fn append_entries(
		&self,
		to: NodeId,
		req: AppendEntriesRequest,
	) -> Result<AppendEntriesReply>;
}

/// Error used for mock-cache link failures; maps onto the same transient-RPC
/// handling path real network errors take (swallowed and retried by the
/// replication loop).
fn unreachable_error() -> RaftError {
	RaftError::DiskIoError(std::io::Error::new(
		std::io::ErrorKind::NotConnected,
		"mock connection cache: peer unreachable",
	))
}

/// A fault-injecting `ConnectionCache` for tests: routes RPCs to in-process
/// `ConsensusInstance`-shaped handlers registered by the test harness, and can
/// simulate a network partition by cutting a directed edge between two nodes.
pub struct MockConnectionCache {
	self_id: NodeId,
	partitioned: Mutex<HashSet<(NodeId, NodeId)>>,
	vote_handlers: Mutex<HashMap<NodeId, Box<dyn Fn(VoteRequest) -> VoteReply + Send + Sync>>>,
	append_handlers:
		Mutex<HashMap<NodeId, Box<dyn Fn(AppendEntriesRequest) -> AppendEntriesReply + Send + Sync>>>,
}

impl MockConnectionCache {
	pub fn new(self_id: NodeId) -> Self {
		MockConnectionCache {
			self_id,
			partitioned: Mutex::new(HashSet::new()),
			vote_handlers: Mutex::new(HashMap::new()),
			append_handlers: Mutex::new(HashMap::new()),
		}
	}

	pub fn register_vote_handler(
		&self,
		peer: NodeId,
		handler: impl Fn(VoteRequest) -> VoteReply + Send + Sync + 'static,
	) {
		self.vote_handlers
			.lock()
			.unwrap()
			.insert(peer, Box::new(handler));
	}

	pub fn register_append_handler(
		&self,
		peer: NodeId,
		handler: impl Fn(AppendEntriesRequest) -> AppendEntriesReply + Send + Sync + 'static,
	) {
		self.append_handlers
			.lock()
			.unwrap()
			.insert(peer, Box::new(handler));
	}

	/// Cuts the directed link `self -> peer`; RPCs to `peer` start failing.
	pub fn partition(&self, peer: NodeId) {
		self.partitioned.lock().unwrap().insert((self.self_id, peer));
	}

	/// Restores a previously cut link.
	pub fn heal(&self, peer: NodeId) {
		self.partitioned
			.lock()
			.unwrap()
			.remove(&(self.self_id, peer));
	}

	fn is_reachable(&self, peer: NodeId) -> bool {
		!self
			.partitioned
			.lock()
			.unwrap()
			.contains(&(self.self_id, peer))
	}
}

/// An in-process `ConnectionCache` that routes RPCs directly to peer
/// `GroupManager`s' `ConsensusInstance`s, used by the demo binary to
/// simulate a multi-node cluster inside one process. Real network transport
/// between distinct processes is out of scope for this crate; this is only a
/// loopback stand-in for the demo.
pub struct LoopbackConnectionCache {
	peers: Mutex<HashMap<NodeId, Weak<GroupManager>>>,
}

impl LoopbackConnectionCache {
	pub fn new() -> Self {
		LoopbackConnectionCache {
			peers: Mutex::new(HashMap::new()),
		}
	}

	pub fn register_peer(&self, id: NodeId, manager: Weak<GroupManager>) {
		self.peers.lock().unwrap().insert(id, manager);
	}
}

impl Default for LoopbackConnectionCache {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ConnectionCache for LoopbackConnectionCache {
	async fn vote(&self, to: NodeId, req: VoteRequest) -> Result<VoteReply> {
		let manager = self
			.peers
			.lock()
			.unwrap()
			.get(&to)
			.and_then(Weak::upgrade)
			.ok_or_else(unreachable_error)?;
		let instance = manager.group(req.group).await.ok_or_else(unreachable_error)?;
		instance.vote(req).await
	}

	async fn append_entries(
		&self,
		to: NodeId,
		req: AppendEntriesRequest,
	) -> Result<AppendEntriesReply> {
		let manager = self
			.peers
			.lock()
			.unwrap()
			.get(&to)
			.and_then(Weak::upgrade)
			.ok_or_else(unreachable_error)?;
		let instance = manager.group(req.group).await.ok_or_else(unreachable_error)?;
		instance.append_entries(req).await
	}
}

#[async_trait]
impl ConnectionCache for MockConnectionCache {
	async fn vote(&self, to: NodeId, req: VoteRequest) -> Result<VoteReply> {
		if !self.is_reachable(to) {
			return Err(unreachable_error());
		}
		let handlers = self.vote_handlers.lock().unwrap();
		match handlers.get(&to) {
			Some(handler) => Ok(handler(req)),
			None => Err(unreachable_error()),
		}
	}

	async fn append_entries(
		&self,
		to: NodeId,
		req: AppendEntriesRequest,
	) -> Result<AppendEntriesReply> {
		if !self.is_reachable(to) {
			return Err(unreachable_error());
		}
		let handlers = self.append_handlers.lock().unwrap();
		match handlers.get(&to) {
			Some(handler) => Ok(handler(req)),
			None => Err(unreachable_error()),
		}
	}
}
