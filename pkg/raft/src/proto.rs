//! Peer RPC payloads and the durable `voted_for` record, with bit-exact wire
//! encodings for everything that crosses a process boundary or hits disk.
//!
//! `GroupConfiguration` is immutable for the lifetime of a group; there is no
//! config-change entry kind or learner/non-voting member support here.

use crate::ids::{GroupId, LogOffset, NodeId, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The ordered set of voting members of a group. Immutable for the lifetime
/// of a `ConsensusInstance` in this spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfiguration {
	members: Vec<NodeId>,
}

impl GroupConfiguration {
	pub fn new(members: Vec<NodeId>) -> Self {
		GroupConfiguration { members }
	}

	pub fn members(&self) -> &[NodeId] {
		&self.members
	}

	pub fn contains(&self, id: NodeId) -> bool {
		self.members.iter().any(|m| *m == id)
	}

	pub fn len(&self) -> usize {
		self.members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.members.is_empty()
	}

	/// Strict majority of the configuration; at least 1 even for an empty or
	/// single-member configuration so a degenerate cluster never trivially
	/// "wins" without a vote.
	pub fn majority_size(&self) -> usize {
		(self.members.len() / 2) + 1
	}

	pub fn peers_excluding(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
		self.members.iter().copied().filter(move |m| *m != id)
	}

	pub fn as_set(&self) -> HashSet<NodeId> {
		self.members.iter().copied().collect()
	}
}

/// What kind of payload a `LogEntry` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
	Data = 0,
	Configuration = 1,
	Checkpoint = 2,
}

impl EntryKind {
	fn from_u8(v: u8) -> Option<Self> {
		match v {
			0 => Some(EntryKind::Data),
			1 => Some(EntryKind::Configuration),
			2 => Some(EntryKind::Checkpoint),
			_ => None,
		}
	}
}

/// One entry in a group's replicated log.
///
/// Never mutated in place once appended; truncated only by a follower when a
/// leader proves divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
	pub term: Term,
	pub offset: LogOffset,
	pub kind: EntryKind,
	pub payload: Bytes,
}

impl LogEntry {
	/// Wire format: `{ term (u64), offset (u64), kind (u8), payload_len (u32), payload_bytes }`.
	pub fn encode(&self) -> Bytes {
		let mut buf = BytesMut::with_capacity(8 + 8 + 1 + 4 + self.payload.len());
		buf.put_u64_le(self.term);
		buf.put_u64_le(self.offset);
		buf.put_u8(self.kind as u8);
		buf.put_u32_le(self.payload.len() as u32);
		buf.put_slice(&self.payload);
		buf.freeze()
	}

	pub fn decode(mut buf: impl Buf) -> Option<Self> {
		if buf.remaining() < 8 + 8 + 1 + 4 {
			return None;
		}
		let term = buf.get_u64_le();
		let offset = buf.get_u64_le();
		let kind = EntryKind::from_u8(buf.get_u8())?;
		let payload_len = buf.get_u32_le() as usize;
		if buf.remaining() < payload_len {
			return None;
		}
		let payload = buf.copy_to_bytes(payload_len);
		Some(LogEntry {
			term,
			offset,
			kind,
			payload,
		})
	}
}

/// The persistent `{ term, voted_for }` record, one file per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VotedForRecord {
	pub term: Term,
	pub voted_for: Option<NodeId>,
}

impl VotedForRecord {
	/// `{ term (u64 LE), voted_for_present (u8), voted_for_id (u64 LE) }`.
	pub fn encode(&self) -> [u8; 17] {
		let mut out = [0u8; 17];
		out[0..8].copy_from_slice(&self.term.to_le_bytes());
		out[8] = self.voted_for.is_some() as u8;
		out[9..17].copy_from_slice(&self.voted_for.unwrap_or(NodeId(0)).0.to_le_bytes());
		out
	}

	pub fn decode(bytes: &[u8]) -> Option<Self> {
		if bytes.len() != 17 {
			return None;
		}
		let term = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
		let present = match bytes[8] {
			0 => false,
			1 => true,
			_ => return None,
		};
		let id = u64::from_le_bytes(bytes[9..17].try_into().ok()?);
		Some(VotedForRecord {
			term,
			voted_for: if present { Some(NodeId(id)) } else { None },
		})
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
	pub group: GroupId,
	pub node_id: NodeId,
	pub term: Term,
	pub prev_log_offset: LogOffset,
	pub prev_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReply {
	pub group: GroupId,
	pub term: Term,
	pub granted: bool,
	pub log_ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesMeta {
	pub term: Term,
	pub prev_log_offset: LogOffset,
	pub prev_log_term: Term,
	pub commit_offset: LogOffset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
	pub group: GroupId,
	pub node_id: NodeId,
	pub meta: AppendEntriesMeta,
	pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
	pub group: GroupId,
	pub node_id: NodeId,
	pub term: Term,
	pub success: bool,
	pub last_log_offset: Option<LogOffset>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn log_entry_round_trips() {
		let e = LogEntry {
			term: 7,
			offset: 42,
			kind: EntryKind::Data,
			payload: Bytes::from_static(b"hello world"),
		};
		let encoded = e.encode();
		let decoded = LogEntry::decode(encoded.as_ref()).unwrap();
		assert_eq!(e, decoded);
	}

	#[test]
	fn log_entry_rejects_truncated_buffer() {
		let e = LogEntry {
			term: 1,
			offset: 1,
			kind: EntryKind::Checkpoint,
			payload: Bytes::from_static(b"xyz"),
		};
		let mut encoded = e.encode();
		encoded.truncate(encoded.len() - 1);
		assert!(LogEntry::decode(encoded.as_ref()).is_none());
	}

	#[test]
	fn voted_for_record_round_trips_with_vote() {
		let rec = VotedForRecord {
			term: 9,
			voted_for: Some(NodeId(3)),
		};
		let encoded = rec.encode();
		assert_eq!(VotedForRecord::decode(&encoded), Some(rec));
	}

	#[test]
	fn voted_for_record_round_trips_without_vote() {
		let rec = VotedForRecord {
			term: 0,
			voted_for: None,
		};
		let encoded = rec.encode();
		assert_eq!(VotedForRecord::decode(&encoded), Some(rec));
	}

	#[test]
	fn majority_size_is_never_zero_for_empty_configuration() {
		let config = GroupConfiguration::new(vec![]);
		assert_eq!(config.majority_size(), 1);
	}
}
