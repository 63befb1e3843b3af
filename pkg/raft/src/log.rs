//! The consumed Log Interface: an append-only, fsync-capable, offset-addressable
//! record log. This module defines the contract only; the real segment-layout
//! implementation lives outside this crate.
//!
//! An `async_trait` rather than a synchronous trait object, since a disk
//! append is an explicit suspension point a consensus instance's callers need
//! to be able to await.

use crate::config::FsyncMode;
use crate::errors::Result;
use crate::ids::{LogOffset, Term};
use crate::proto::LogEntry;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Result of appending a single entry: the offset and term it was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
	pub offset: LogOffset,
	pub term: Term,
}

/// The append-only log contract a `ConsensusInstance` is built against.
///
/// Implementations own exactly one group's log; the consensus core never
/// shares a `LogHandle` between instances.
#[async_trait]
pub trait LogHandle: Send + Sync {
	/// Appends `entries` at the current tail, honoring `fsync_mode`, bounded by
	/// `timeout`. Returns per-entry assigned offsets/terms in order.
	async fn append(
		&self,
		entries: Vec<LogEntry>,
		fsync_mode: FsyncMode,
		timeout: Duration,
	) -> Result<Vec<AppendResult>>;

	/// Reads entries starting at `from_offset`, bounded by `max_bytes` of
	/// payload.
	async fn read(&self, from_offset: LogOffset, max_bytes: usize) -> Result<Vec<LogEntry>>;

	/// Discards every entry at or after `from_offset`. Only ever called by a
	/// follower when a leader proves log divergence.
	async fn truncate_suffix(&self, from_offset: LogOffset) -> Result<()>;

	/// The greatest offset currently present in the log, or 0 if empty.
	fn last_offset(&self) -> LogOffset;

	/// The smallest offset currently present in the log, or 1 if empty (i.e.
	/// nothing has ever been compacted away).
	fn first_offset(&self) -> LogOffset;

	/// The term of the entry at `offset`, or `None` if no such entry exists
	/// locally (either beyond the tail, or before `first_offset` due to
	/// compaction).
	fn term_at(&self, offset: LogOffset) -> Option<Term>;

	/// The directory this log's files (including `voted_for`) live under.
	fn base_directory(&self) -> &Path;
}

/// A simple in-memory `LogHandle` used by tests and the demo binary. Not a
/// substitute for the real segment-backed storage engine this crate consumes
/// as an external collaborator.
pub struct MemoryLog {
	base_directory: PathBuf,
	entries: Mutex<VecDeque<LogEntry>>,
}

impl MemoryLog {
	pub fn new(base_directory: impl Into<PathBuf>) -> Self {
		MemoryLog {
			base_directory: base_directory.into(),
			entries: Mutex::new(VecDeque::new()),
		}
	}
}

#[async_trait]
impl LogHandle for MemoryLog {
	async fn append(
		&self,
		entries: Vec<LogEntry>,
		_fsync_mode: FsyncMode,
		_timeout: Duration,
	) -> Result<Vec<AppendResult>> {
		let mut guard = self.entries.lock().unwrap();
		let mut results = Vec::with_capacity(entries.len());
		for e in entries {
			results.push(AppendResult {
				offset: e.offset,
				term: e.term,
			});
			guard.push_back(e);
		}
		Ok(results)
	}

	async fn read(&self, from_offset: LogOffset, max_bytes: usize) -> Result<Vec<LogEntry>> {
		let guard = self.entries.lock().unwrap();
		let mut out = Vec::new();
		let mut used = 0usize;
		for e in guard.iter() {
			if e.offset < from_offset {
				continue;
			}
			if used + e.payload.len() > max_bytes && !out.is_empty() {
				break;
			}
			used += e.payload.len();
			out.push(e.clone());
		}
		Ok(out)
	}

	async fn truncate_suffix(&self, from_offset: LogOffset) -> Result<()> {
		let mut guard = self.entries.lock().unwrap();
		guard.retain(|e| e.offset < from_offset);
		Ok(())
	}

	fn last_offset(&self) -> LogOffset {
		self.entries
			.lock()
			.unwrap()
			.back()
			.map(|e| e.offset)
			.unwrap_or(0)
	}

	fn first_offset(&self) -> LogOffset {
		self.entries
			.lock()
			.unwrap()
			.front()
			.map(|e| e.offset)
			.unwrap_or(1)
	}

	fn term_at(&self, offset: LogOffset) -> Option<Term> {
		if offset == 0 {
			return Some(0);
		}
		self.entries
			.lock()
			.unwrap()
			.iter()
			.find(|e| e.offset == offset)
			.map(|e| e.term)
	}

	fn base_directory(&self) -> &Path {
		&self.base_directory
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proto::EntryKind;
	use bytes::Bytes;

	fn entry(offset: LogOffset, term: Term) -> LogEntry {
		LogEntry {
			term,
			offset,
			kind: EntryKind::Data,
			payload: Bytes::from_static(b"x"),
		}
	}

	#[tokio::test]
	async fn append_and_read_round_trip() {
		let log = MemoryLog::new("/tmp/does-not-matter");
		log.append(
			vec![entry(1, 1), entry(2, 1)],
			FsyncMode::Never,
			Duration::from_secs(1),
		)
		.await
		.unwrap();
		assert_eq!(log.last_offset(), 2);
		assert_eq!(log.term_at(1), Some(1));
		assert_eq!(log.term_at(2), Some(1));
		assert_eq!(log.term_at(3), None);

		let read = log.read(1, 1024).await.unwrap();
		assert_eq!(read.len(), 2);
	}

	#[tokio::test]
	async fn truncate_suffix_drops_conflicting_tail() {
		let log = MemoryLog::new("/tmp/does-not-matter");
		log.append(
			vec![entry(1, 1), entry(2, 1), entry(3, 2)],
			FsyncMode::Never,
			Duration::from_secs(1),
		)
		.await
		.unwrap();
		log.truncate_suffix(3).await.unwrap();
		assert_eq!(log.last_offset(), 2);
		assert_eq!(log.term_at(3), None);
	}
}
