//! The Group Manager: the lifecycle owner for every `ConsensusInstance` on a
//! shard, and the fan-out point for leadership-change notifications to
//! whatever external component cares.
//!
//! An `Arc`-shared registry with async methods that hold the relevant lock
//! only as long as bookkeeping requires, capable of owning many groups at
//! once.

use crate::clock::Clock;
use crate::config::GroupManagerConfig;
use crate::connection::ConnectionCache;
use crate::consensus::{ConsensusInstance, LeadershipStatus};
use crate::errors::Result;
use crate::heartbeat::HeartbeatManager;
use crate::hooks::CommitHook;
use crate::ids::{GroupId, NodeId};
use crate::log::LogHandle;
use crate::proto::GroupConfiguration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::info;

/// The handle `start_group` hands back to its caller: the `ConsensusInstance`
/// itself, shared so the `GroupManager` and the caller both hold it.
pub type GroupHandle = Arc<ConsensusInstance>;

/// A callback registered via `register_leadership_notification`.
pub type LeadershipSubscriber = Arc<dyn Fn(LeadershipStatus) + Send + Sync>;

/// Token returned by `register_leadership_notification`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Owns every `ConsensusInstance` on this shard and the single
/// `HeartbeatManager` multiplexing their replication ticks.
pub struct GroupManager {
	node_id: NodeId,
	config: GroupManagerConfig,
	clock: Arc<dyn Clock>,
	heartbeats: Arc<HeartbeatManager>,
	groups: Mutex<HashMap<GroupId, Arc<ConsensusInstance>>>,
	subscribers: Mutex<Vec<(u64, LeadershipSubscriber)>>,
	next_subscription_id: AtomicU64,
}

impl GroupManager {
	pub fn new(node_id: NodeId, config: GroupManagerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
		let heartbeats = HeartbeatManager::new(std::time::Duration::from_millis(
			config.raft.raft_heartbeat_interval_ms,
		));
		heartbeats.start();

		Arc::new(GroupManager {
			node_id,
			config,
			clock,
			heartbeats,
			groups: Mutex::new(HashMap::new()),
			subscribers: Mutex::new(Vec::new()),
			next_subscription_id: AtomicU64::new(1),
		})
	}

	pub fn node_id(&self) -> NodeId {
		self.node_id
	}

	/// Constructs, starts, and registers a new `ConsensusInstance` for
	/// `group`, optionally wiring `commit_hook` before it takes its first
	/// operation so the hook never misses an early commit. A no-op error if
	/// the group is already running would be surprising here;
	/// callers are expected to `stop_group` first.
	pub async fn start_group(
		self: &Arc<Self>,
		group: GroupId,
		members: Vec<NodeId>,
		log: Arc<dyn LogHandle>,
		connections: Arc<dyn ConnectionCache>,
		commit_hook: Option<Arc<dyn CommitHook>>,
	) -> Result<GroupHandle> {
		let weak_self: Weak<GroupManager> = Arc::downgrade(self);
		let callback = Arc::new(move |status: LeadershipStatus| {
			if let Some(manager) = weak_self.upgrade() {
				manager.fan_out(status);
			}
		});

		let instance = ConsensusInstance::new(
			self.node_id,
			group,
			GroupConfiguration::new(members),
			self.config.raft.clone(),
			log,
			connections,
			self.clock.clone(),
			callback,
		);

		if let Some(hook) = commit_hook {
			instance.register_hook(hook).await;
		}

		instance.start().await?;

		self.heartbeats.register_group(instance.clone()).await;
		self.groups.lock().await.insert(group, instance.clone());
		info!(%group, "started group");

		Ok(instance)
	}

	/// Stops, deregisters from the heartbeat manager, then unconditionally
	/// erases the group from the registry: stop, then deregister, then erase,
	/// with the erase unconditional even if deregister failed.
	pub async fn stop_group(&self, group: GroupId) {
		let instance = self.groups.lock().await.get(&group).cloned();
		if let Some(instance) = instance {
			instance.stop().await;
		}
		self.heartbeats.deregister_group(group).await;
		self.groups.lock().await.remove(&group);
		info!(%group, "stopped group");
	}

	pub async fn group(&self, group: GroupId) -> Option<GroupHandle> {
		self.groups.lock().await.get(&group).cloned()
	}

	pub async fn list_groups(&self) -> Vec<GroupId> {
		self.groups.lock().await.keys().copied().collect()
	}

	/// Registers a leadership-change subscriber; invoked in registration
	/// order, never from inside a `ConsensusInstance`'s operation lock.
	pub async fn register_leadership_notification(
		&self,
		subscriber: LeadershipSubscriber,
	) -> SubscriptionId {
		let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
		self.subscribers.lock().await.push((id, subscriber));
		SubscriptionId(id)
	}

	pub async fn unregister_leadership_notification(&self, id: SubscriptionId) {
		self.subscribers.lock().await.retain(|(sid, _)| *sid != id.0);
	}

	/// Fans a leadership event out to every subscriber. Spawned so the
	/// `ConsensusInstance` that raised the event never blocks on a slow
	/// subscriber.
	fn fan_out(self: &Arc<Self>, status: LeadershipStatus) {
		let this = Arc::clone(self);
		tokio::spawn(async move {
			let subscribers: Vec<_> = this.subscribers.lock().await.iter().cloned().collect();
			for (_, subscriber) in subscribers {
				subscriber(status);
			}
		});
	}

	/// Stops every running group. Intended for process shutdown.
	pub async fn stop_all(&self) {
		let groups: Vec<_> = self.groups.lock().await.keys().copied().collect();
		for group in groups {
			self.stop_group(group).await;
		}
		self.heartbeats.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::MockClock;
	use crate::connection::MockConnectionCache;
	use crate::log::MemoryLog;
	use std::sync::atomic::AtomicUsize;

	#[tokio::test]
	async fn start_stop_group_round_trip() {
		let clock = Arc::new(MockClock::new());
		let manager = GroupManager::new(NodeId(1), GroupManagerConfig::default(), clock);

		let log = Arc::new(MemoryLog::new("/tmp/raft-group-manager-test"));
		let connections = Arc::new(MockConnectionCache::new(NodeId(1)));
		let instance = manager
			.start_group(GroupId(1), vec![NodeId(1)], log, connections, None)
			.await
			.unwrap();
		assert_eq!(instance.group_id(), GroupId(1));
		assert_eq!(manager.list_groups().await, vec![GroupId(1)]);

		manager.stop_group(GroupId(1)).await;
		assert!(manager.list_groups().await.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn leadership_notifications_fan_out_to_subscribers() {
		let clock = Arc::new(MockClock::new());
		let manager = GroupManager::new(NodeId(1), GroupManagerConfig::default(), clock.clone());

		let seen = Arc::new(AtomicUsize::new(0));
		let seen_clone = seen.clone();
		manager
			.register_leadership_notification(Arc::new(move |_status| {
				seen_clone.fetch_add(1, Ordering::SeqCst);
			}))
			.await;

		let log = Arc::new(MemoryLog::new("/tmp/raft-group-manager-test-2"));
		let connections = Arc::new(MockConnectionCache::new(NodeId(1)));
		manager
			.start_group(GroupId(2), vec![NodeId(1)], log, connections, None)
			.await
			.unwrap();

		clock.advance(std::time::Duration::from_millis(900)).await;
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		assert!(seen.load(Ordering::SeqCst) >= 1);

		manager.stop_all().await;
	}
}
