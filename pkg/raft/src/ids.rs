//! Opaque identifiers and monotonic counters shared across the consensus core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one Raft replication group (one partition's replica set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "group-{}", self.0)
	}
}

/// Identifies one participating peer node, unique process-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "node-{}", self.0)
	}
}

/// A monotonically non-decreasing election epoch.
///
/// Once a node has observed term T it never participates in any term < T.
pub type Term = u64;

/// A monotonically non-decreasing index into a group's replicated log.
///
/// Offset 0 is reserved as the sentinel "nothing has ever been appended" value.
pub type LogOffset = u64;
