//! Configuration options controlling election timing, heartbeat cadence, disk
//! durability, and batching, loadable from a TOML file.

use serde::{Deserialize, Serialize};

/// When the log should fsync an append before acknowledging it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FsyncMode {
	/// fsync every append before acknowledging.
	Always,
	/// fsync only as entries cross the commit index.
	OnCommit,
	/// never fsync (durability delegated to the underlying storage device).
	Never,
}

impl Default for FsyncMode {
	fn default() -> Self {
		FsyncMode::OnCommit
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
	/// Base election timeout; the actual timeout is this plus a uniform
	/// random jitter fraction (see `clock::jittered_election_timeout`).
	pub raft_election_timeout_ms: u64,

	/// Interval between heartbeat ticks issued by the `HeartbeatManager`.
	pub raft_heartbeat_interval_ms: u64,

	/// Deadline for a single disk append before it is considered a `DiskTimeout`.
	pub raft_disk_timeout_ms: u64,

	/// Maximum number of payload bytes batched into one `AppendEntriesRequest`.
	pub raft_replicate_batch_max_bytes: usize,

	/// fsync policy applied to every disk append.
	pub raft_fsync_mode: FsyncMode,
}

impl Default for RaftConfig {
	fn default() -> Self {
		RaftConfig {
			raft_election_timeout_ms: 400,
			raft_heartbeat_interval_ms: 150,
			raft_disk_timeout_ms: 5_000,
			raft_replicate_batch_max_bytes: 512 * 1024,
			raft_fsync_mode: FsyncMode::OnCommit,
		}
	}
}

impl RaftConfig {
	/// Upper bound of the jittered election timeout range: `[base, 2*base)`.
	pub fn election_timeout_jitter_ms(&self) -> u64 {
		self.raft_election_timeout_ms
	}
}

/// Process-wide configuration: one `RaftConfig` shared by every group on a
/// shard, plus the heartbeat tick interval the `HeartbeatManager` runs at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupManagerConfig {
	pub raft: RaftConfig,
}

impl Default for GroupManagerConfig {
	fn default() -> Self {
		GroupManagerConfig {
			raft: RaftConfig::default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn raft_config_deserializes_from_toml_with_partial_overrides() {
		let parsed: GroupManagerConfig = toml::from_str(
			r#"
			[raft]
			raft_election_timeout_ms = 1000
			raft_fsync_mode = "always"
			"#,
		)
		.unwrap();

		assert_eq!(parsed.raft.raft_election_timeout_ms, 1000);
		assert_eq!(parsed.raft.raft_fsync_mode, FsyncMode::Always);
		// Fields absent from the TOML fall back to `RaftConfig::default()`.
		assert_eq!(
			parsed.raft.raft_heartbeat_interval_ms,
			RaftConfig::default().raft_heartbeat_interval_ms
		);
	}

	#[test]
	fn empty_toml_yields_defaults() {
		let parsed: GroupManagerConfig = toml::from_str("").unwrap();
		assert_eq!(
			parsed.raft.raft_election_timeout_ms,
			RaftConfig::default().raft_election_timeout_ms
		);
	}
}
