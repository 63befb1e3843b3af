//! The commit-hook observer capability: external subsystems (state-machine
//! replicators and the like) register as a capability with three methods
//! rather than as a base class, so they can react to pre-commit, abort, and
//! commit transitions on a consensus instance.

use crate::errors::Result;
use crate::ids::LogOffset;
use crate::proto::LogEntry;
use async_trait::async_trait;

/// Registered on a `ConsensusInstance`; invoked synchronously, under the
/// operation lock, in registration order. A hook must never call back into
/// the instance it is registered on: doing so deadlocks on the operation
/// lock it is already executing under.
#[async_trait]
pub trait CommitHook: Send + Sync {
	/// Called before the disk append that will carry `entries` acknowledges.
	async fn pre_commit(&self, begin_offset: LogOffset, entries: &[LogEntry]) -> Result<()>;

	/// Called if the append starting at `begin_offset` failed.
	async fn abort(&self, begin_offset: LogOffset) -> Result<()>;

	/// Called once the commit index crosses `committed_offset`, for the range
	/// beginning at `begin_offset`.
	async fn commit(&self, begin_offset: LogOffset, committed_offset: LogOffset) -> Result<()>;
}
