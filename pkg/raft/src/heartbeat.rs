//! The Heartbeat Manager: one process-wide periodic driver multiplexing
//! heartbeat/replication ticks across every registered group on a shard,
//! instead of one timer per group.
//!
//! A single ticker bounds wake-ups to the number of registered groups rather
//! than growing per-group timer tasks, by driving each
//! `ConsensusInstance::replicate_tick` from one loop.

use crate::consensus::ConsensusInstance;
use crate::ids::GroupId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Drives `replicate_tick` for every registered Leader instance on a fixed
/// interval. Registration and deregistration are independent of group
/// start/stop: the `GroupManager` is expected to register a group right
/// after `ConsensusInstance::start` and deregister it before `stop`.
pub struct HeartbeatManager {
	interval: std::time::Duration,
	groups: Mutex<HashMap<GroupId, Arc<ConsensusInstance>>>,
	gate: CancellationToken,
	started: AtomicBool,
}

impl HeartbeatManager {
	pub fn new(interval: std::time::Duration) -> Arc<Self> {
		Arc::new(HeartbeatManager {
			interval,
			groups: Mutex::new(HashMap::new()),
			gate: CancellationToken::new(),
			started: AtomicBool::new(false),
		})
	}

	/// Starts the background ticker. Idempotent.
	pub fn start(self: &Arc<Self>) {
		if self.started.swap(true, Ordering::SeqCst) {
			return;
		}
		let this = Arc::clone(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(this.interval);
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						this.tick_all().await;
					}
					_ = this.gate.cancelled() => {
						break;
					}
				}
			}
		});
	}

	pub fn stop(&self) {
		self.gate.cancel();
	}

	async fn tick_all(&self) {
		// Heartbeats do not hold the group's operation lock beyond the
		// bookkeeping `replicate_tick` itself performs; snapshot the
		// registered set first so this loop never blocks on a slow group.
		let instances: Vec<_> = self.groups.lock().await.values().cloned().collect();
		debug!(groups = instances.len(), "heartbeat tick");
		for instance in instances {
			instance.replicate_tick().await;
		}
	}

	/// Registers `instance` so its Leader-side replication is driven by this
	/// manager's tick. A no-op if the group is already registered.
	pub async fn register_group(&self, instance: Arc<ConsensusInstance>) {
		let mut groups = self.groups.lock().await;
		groups.entry(instance.group_id()).or_insert(instance);
	}

	/// Removes a group from the tick set. Unconditional: removing a group
	/// that was never registered is not an error.
	pub async fn deregister_group(&self, group: GroupId) {
		let mut groups = self.groups.lock().await;
		if groups.remove(&group).is_some() {
			info!(%group, "deregistered group from heartbeat manager");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::MockClock;
	use crate::config::RaftConfig;
	use crate::connection::MockConnectionCache;
	use crate::ids::NodeId;
	use crate::log::MemoryLog;
	use crate::proto::GroupConfiguration;

	#[tokio::test]
	async fn register_and_deregister_round_trip() {
		let manager = HeartbeatManager::new(std::time::Duration::from_millis(50));
		let clock = Arc::new(MockClock::new());
		let log = Arc::new(MemoryLog::new("/tmp/raft-heartbeat-test"));
		let connections = Arc::new(MockConnectionCache::new(NodeId(1)));
		let instance = ConsensusInstance::new(
			NodeId(1),
			GroupId(7),
			GroupConfiguration::new(vec![NodeId(1)]),
			RaftConfig::default(),
			log,
			connections,
			clock,
			Arc::new(|_| {}),
		);

		manager.register_group(instance.clone()).await;
		assert_eq!(manager.groups.lock().await.len(), 1);
		manager.deregister_group(GroupId(7)).await;
		assert_eq!(manager.groups.lock().await.len(), 0);
	}
}
