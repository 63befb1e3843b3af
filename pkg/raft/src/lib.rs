//! Per-group replicated consensus core for a partitioned-log streaming
//! platform: a Raft-style `ConsensusInstance` per replica group, a
//! `HeartbeatManager` multiplexing their replication ticks, and a
//! `GroupManager` owning their lifecycle and leadership notifications.
//!
//! This crate is deliberately scoped to the consensus algorithm itself. The
//! wire-protocol front end, cluster metadata controller, membership
//! reconfiguration, snapshotting, and storage segment layout are external
//! collaborators consumed through the `log` and `connection` traits.

pub mod clock;
pub mod config;
pub mod connection;
pub mod consensus;
pub mod errors;
pub mod group_manager;
pub mod heartbeat;
pub mod hooks;
pub mod ids;
pub mod log;
pub mod proto;
pub mod state;

pub use clock::{Clock, SystemClock};
pub use config::{FsyncMode, GroupManagerConfig, RaftConfig};
pub use connection::ConnectionCache;
pub use consensus::{ConsensusInstance, LeadershipCallback, LeadershipStatus, ProposeOutcome};
pub use errors::{RaftError, Result};
pub use group_manager::{GroupHandle, GroupManager, LeadershipSubscriber, SubscriptionId};
pub use heartbeat::HeartbeatManager;
pub use hooks::CommitHook;
pub use ids::{GroupId, LogOffset, NodeId, Term};
pub use log::{AppendResult, LogHandle};
pub use proto::{
	AppendEntriesMeta, AppendEntriesReply, AppendEntriesRequest, EntryKind, GroupConfiguration,
	LogEntry, VoteReply, VoteRequest, VotedForRecord,
};
pub use state::ProtocolMetadata;
