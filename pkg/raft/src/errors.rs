//! Error taxonomy for the consensus core: a small, closed set of error kinds
//! expressed with `thiserror` so `?` composes naturally through the disk and
//! RPC paths.

use crate::ids::{LogOffset, NodeId};

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
	/// The request's term is below ours; not fatal, just rejected.
	#[error("stale term in request")]
	TermStale,

	/// `prev_offset`/`prev_term` did not match our log; the leader should retry
	/// with an earlier offset. Not fatal.
	#[error("log inconsistent at offset, hint={hint}")]
	LogInconsistent { hint: LogOffset },

	/// The configured disk append deadline elapsed before the log acknowledged.
	#[error("disk append exceeded {disk_timeout_ms}ms deadline")]
	DiskTimeout { disk_timeout_ms: u64 },

	/// The log rejected or failed an append/read/truncate.
	#[error("disk io error: {0}")]
	DiskIoError(#[from] std::io::Error),

	/// `voted_for` was corrupt, or the log's tail term disagreed with recovered
	/// metadata. Fatal: the instance does not start.
	#[error("recovery failed: {0}")]
	RecoveryError(String),

	/// A client-initiated operation (e.g. a proposal) was issued against a
	/// non-leader instance.
	#[error("not the leader, hint={leader_hint:?}")]
	NotLeader { leader_hint: Option<NodeId> },

	/// The operation was attempted after `stop()` closed the instance's gate.
	#[error("instance is stopped")]
	Stopped,

	/// A registered `CommitHook` returned an error; the enclosing operation is
	/// aborted and the instance is left in its prior state.
	#[error("commit hook failed: {0}")]
	HookFailed(String),
}
