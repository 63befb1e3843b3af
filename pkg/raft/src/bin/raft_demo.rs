//! Demo binary: runs a multi-node, multi-group Raft cluster in-process using
//! the `LoopbackConnectionCache` and an in-memory log, logging leadership
//! transitions as they happen.

use clap::Parser;
use raft_core::connection::LoopbackConnectionCache;
use raft_core::log::MemoryLog;
use raft_core::{GroupId, GroupManager, GroupManagerConfig, LeadershipStatus, NodeId, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "raft_demo", about = "In-process Raft consensus demo")]
struct Args {
	/// Number of simulated nodes in the cluster.
	#[arg(long, default_value_t = 3)]
	nodes: u64,

	/// Number of independent consensus groups to run across the cluster.
	#[arg(long, default_value_t = 1)]
	groups: u64,

	/// How long to run the demo before exiting.
	#[arg(long, default_value_t = 5)]
	run_secs: u64,

	/// Optional TOML file overriding `raft_election_timeout_ms` and friends;
	/// falls back to `GroupManagerConfig::default()` when absent.
	#[arg(long)]
	config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> GroupManagerConfig {
	let Some(path) = path else {
		return GroupManagerConfig::default();
	};
	let text = std::fs::read_to_string(path)
		.unwrap_or_else(|e| panic!("failed to read config file {}: {}", path.display(), e));
	toml::from_str(&text)
		.unwrap_or_else(|e| panic!("failed to parse config file {}: {}", path.display(), e))
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive("raft_core=info".parse().unwrap()))
		.init();

	let args = Args::parse();
	let node_ids: Vec<NodeId> = (1..=args.nodes).map(NodeId).collect();
	let config = load_config(args.config.as_ref());

	let clock = Arc::new(SystemClock);
	let managers: Vec<Arc<GroupManager>> = node_ids
		.iter()
		.map(|id| GroupManager::new(*id, config.clone(), clock.clone()))
		.collect();

	for manager in &managers {
		manager
			.register_leadership_notification(Arc::new(|status: LeadershipStatus| {
				tracing::info!(
					group = %status.group,
					term = status.term,
					leader = ?status.current_leader,
					"leadership changed"
				);
			}))
			.await;
	}

	for group_idx in 0..args.groups {
		let group = GroupId(group_idx + 1);

		let caches: Vec<Arc<LoopbackConnectionCache>> = node_ids
			.iter()
			.map(|_| Arc::new(LoopbackConnectionCache::new()))
			.collect();
		for cache in &caches {
			for (peer_manager, peer_id) in managers.iter().zip(node_ids.iter()) {
				cache.register_peer(*peer_id, Arc::downgrade(peer_manager));
			}
		}

		for (manager, cache) in managers.iter().zip(caches.iter()) {
			let log = Arc::new(MemoryLog::new(format!(
				"/tmp/raft-demo/group-{}/node-{}",
				group.0,
				manager.node_id().0
			)));
			manager
				.start_group(group, node_ids.clone(), log, cache.clone(), None)
				.await
				.expect("failed to start group");
		}
	}

	tokio::time::sleep(Duration::from_secs(args.run_secs)).await;

	for manager in &managers {
		manager.stop_all().await;
	}
}
