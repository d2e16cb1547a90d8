//! Durable Raft log and hard state, layered over a [`Kv`] store.
//!
//! Each replica group keeps its log in a dedicated store, separate from the
//! state machine's store. Log entries live under a shared prefix with
//! big-endian indices so key order matches log order. Hard state (term, vote,
//! commit index) is one record, so persisting it is a single atomic put.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::kvstore::Kv;
use crate::types::{CoreError, LogEntry, LogIndex, NodeId, Term};

/// Key holding the serialized [`HardState`] record.
const KEY_HARD_STATE: &[u8] = b"raft/hard_state";
/// Key holding the serialized [`SnapshotMeta`] record.
const KEY_SNAPSHOT_META: &[u8] = b"raft/snapshot_meta";
/// Prefix for log entry keys. The entry index follows in big-endian.
const PREFIX_LOG: &[u8] = b"raft/log/";

/// Raft state that must survive restarts: current term, the vote cast in that
/// term, and the highest known committed index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// Current term.
    pub term: Term,
    /// Candidate voted for in the current term, if any.
    pub voted_for: Option<NodeId>,
    /// Highest log index known to be committed.
    pub commit_index: LogIndex,
}

/// Metadata for the most recent state machine snapshot, recorded when the log
/// prefix it covers is compacted away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Index of the last log entry covered by the snapshot.
    pub last_index: LogIndex,
    /// Term of that entry.
    pub last_term: Term,
}

/// Persistent Raft log for one replica group.
pub struct RaftLogStore {
    kv: Arc<dyn Kv>,
}

impl RaftLogStore {
    /// Creates a log store over the given KV engine.
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        RaftLogStore { kv }
    }

    fn entry_key(index: LogIndex) -> Vec<u8> {
        let mut key = Vec::with_capacity(PREFIX_LOG.len() + 8);
        key.extend_from_slice(PREFIX_LOG);
        key.extend_from_slice(&index.as_u64().to_be_bytes());
        key
    }

    fn decode_entry(value: &[u8]) -> Result<LogEntry, CoreError> {
        bincode::deserialize(value)
            .map_err(|e| CoreError::Corrupt(format!("log entry decode failed: {}", e)))
    }

    /// Persists the hard state record.
    pub fn save_hard_state(&self, state: &HardState) -> Result<(), CoreError> {
        let encoded = bincode::serialize(state)?;
        self.kv.put(KEY_HARD_STATE.to_vec(), encoded)
    }

    /// Loads the hard state record, or the zero state when none was saved.
    pub fn load_hard_state(&self) -> Result<HardState, CoreError> {
        match self.kv.lookup(KEY_HARD_STATE)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| CoreError::Corrupt(format!("hard state decode failed: {}", e))),
            None => Ok(HardState::default()),
        }
    }

    /// Appends a single entry. An existing entry at the same index is
    /// overwritten, which is how conflicting suffixes get replaced.
    pub fn append(&self, entry: &LogEntry) -> Result<(), CoreError> {
        let encoded = bincode::serialize(entry)?;
        self.kv.put(Self::entry_key(entry.index), encoded)
    }

    /// Appends a run of entries in order.
    pub fn append_many(&self, entries: &[LogEntry]) -> Result<(), CoreError> {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    /// Entry at the given index, or None.
    pub fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, CoreError> {
        match self.kv.lookup(&Self::entry_key(index))? {
            Some(bytes) => Ok(Some(Self::decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All entries with index >= `from`, ascending.
    pub fn entries_from(&self, from: LogIndex) -> Result<Vec<LogEntry>, CoreError> {
        let pairs = self.kv.scan_prefix(PREFIX_LOG)?;
        let mut entries = Vec::with_capacity(pairs.len());
        for (_, value) in &pairs {
            let entry = Self::decode_entry(value)?;
            if entry.index >= from {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }

    /// Index of the last entry in the log, or zero when empty.
    pub fn last_index(&self) -> Result<LogIndex, CoreError> {
        let pairs = self.kv.scan_prefix(PREFIX_LOG)?;
        let mut last = LogIndex::ZERO;
        for (_, value) in &pairs {
            let entry = Self::decode_entry(value)?;
            if entry.index > last {
                last = entry.index;
            }
        }
        Ok(last)
    }

    /// Deletes every entry with index >= `from`. Used when a follower's
    /// suffix conflicts with the leader's.
    pub fn truncate_from(&self, from: LogIndex) -> Result<(), CoreError> {
        let pairs = self.kv.scan_prefix(PREFIX_LOG)?;
        for (key, value) in &pairs {
            let entry = Self::decode_entry(value)?;
            if entry.index >= from {
                self.kv.remove(key)?;
            }
        }
        Ok(())
    }

    /// Deletes every entry with index <= `through`. Used after a snapshot
    /// makes the prefix redundant.
    pub fn compact_through(&self, through: LogIndex) -> Result<(), CoreError> {
        let pairs = self.kv.scan_prefix(PREFIX_LOG)?;
        for (key, value) in &pairs {
            let entry = Self::decode_entry(value)?;
            if entry.index <= through {
                self.kv.remove(key)?;
            }
        }
        Ok(())
    }

    /// Number of entries currently stored.
    pub fn entry_count(&self) -> Result<usize, CoreError> {
        Ok(self.kv.scan_prefix(PREFIX_LOG)?.len())
    }

    /// Records the snapshot metadata alongside the log.
    pub fn save_snapshot_meta(&self, meta: &SnapshotMeta) -> Result<(), CoreError> {
        let encoded = bincode::serialize(meta)?;
        self.kv.put(KEY_SNAPSHOT_META.to_vec(), encoded)
    }

    /// Loads the snapshot metadata, or None when no snapshot was taken.
    pub fn load_snapshot_meta(&self) -> Result<Option<SnapshotMeta>, CoreError> {
        match self.kv.lookup(KEY_SNAPSHOT_META)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| CoreError::Corrupt(format!("snapshot meta decode failed: {}", e))),
            None => Ok(None),
        }
    }

    /// Durably flushes the underlying store.
    pub fn sync(&self) -> Result<(), CoreError> {
        self.kv.sync()
    }
}
