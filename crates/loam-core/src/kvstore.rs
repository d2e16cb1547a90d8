//! Ordered key/value engine contract backing every on-disk state machine.
//!
//! Every store persists the highest applied Raft log index under a reserved
//! key. Indexed writes at or below that index are no-ops, which gives
//! exactly-once application across restarts: the apply loop can safely replay
//! committed entries after recovery.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::{CoreError, SortOrder};

/// Reserved key holding the highest applied Raft log index.
pub const APPLIED_INDEX_KEY: &[u8] = b"applied_index";

/// Key type used by the KV engine.
pub type Key = Vec<u8>;
/// Value type used by the KV engine.
pub type Value = Vec<u8>;
/// A key/value pair returned from iteration.
pub type KvPair = (Key, Value);

/// A single operation in a write batch, tagged with the Raft log index that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put {
        /// Raft log index of the proposal.
        index: u64,
        /// Key to write.
        key: Key,
        /// Value to write.
        value: Value,
    },
    /// Remove a key.
    Delete {
        /// Raft log index of the proposal.
        index: u64,
        /// Key to remove.
        key: Key,
    },
}

impl BatchOp {
    /// Raft log index this operation was proposed at.
    pub fn index(&self) -> u64 {
        match self {
            BatchOp::Put { index, .. } => *index,
            BatchOp::Delete { index, .. } => *index,
        }
    }
}

/// An atomic group of indexed writes. The maximum index in the batch is
/// persisted to the reserved key in the same atomic group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        WriteBatch { ops: Vec::new() }
    }

    /// Adds a put operation.
    pub fn put(&mut self, index: u64, key: Key, value: Value) {
        self.ops.push(BatchOp::Put { index, key, value });
    }

    /// Adds a delete operation.
    pub fn delete(&mut self, index: u64, key: Key) {
        self.ops.push(BatchOp::Delete { index, key });
    }

    /// Operations in insertion order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Highest Raft log index in the batch, or 0 when empty.
    pub fn max_index(&self) -> u64 {
        self.ops.iter().map(BatchOp::index).max().unwrap_or(0)
    }

    /// True when the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of operations in the batch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Frame streamed by save_snapshot and consumed by recover_from_snapshot.
/// Entries include the reserved applied-index key, so recovery restores the
/// exactly-once cursor along with the data.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SnapshotFrame {
    pub(crate) entries: Vec<KvPair>,
}

/// Contract of the ordered key/value store used by every on-disk state
/// machine.
///
/// Indexed operations (`apply_batch`, `delete`) participate in the
/// applied-index protocol. Raw operations (`put`, `remove`) bypass it and are
/// reserved for bookkeeping that is not driven by the Raft apply loop, such
/// as the raft log store's hard state.
pub trait Kv: Send + Sync {
    /// Highest applied Raft log index persisted in this store, or 0 when
    /// fresh.
    fn applied_index(&self) -> Result<u64, CoreError>;

    /// Raw value bytes for a key, or None when absent.
    fn lookup(&self, key: &[u8]) -> Result<Option<Value>, CoreError>;

    /// Raw write outside the applied-index protocol.
    fn put(&self, key: Key, value: Value) -> Result<(), CoreError>;

    /// Raw removal outside the applied-index protocol.
    fn remove(&self, key: &[u8]) -> Result<(), CoreError>;

    /// Applies a batch atomically. Operations at or below the persisted
    /// applied index are skipped; the batch maximum is persisted to the
    /// reserved key in the same atomic group.
    fn apply_batch(&self, batch: &WriteBatch) -> Result<(), CoreError>;

    /// Removes a key atomically with applied-index advance. Same no-op rule
    /// as `apply_batch`.
    fn delete(&self, key: &[u8], index: u64) -> Result<(), CoreError>;

    /// Every pair in key order, ascending or descending, from a snapshot
    /// view. The reserved applied-index key is skipped.
    fn iterate(&self, order: SortOrder) -> Result<Vec<KvPair>, CoreError>;

    /// Pairs whose key starts with the prefix, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, CoreError>;

    /// Captures a consistent view of the store and returns its identifier.
    fn prepare_snapshot(&self) -> Result<u64, CoreError>;

    /// Streams a previously prepared view. The view is consumed.
    fn save_snapshot(&self, view: u64, w: &mut dyn Write) -> Result<(), CoreError>;

    /// Replaces the store contents from a snapshot stream. On corruption the
    /// store is left untouched and the error surfaces.
    fn recover_from_snapshot(&self, r: &mut dyn Read) -> Result<(), CoreError>;

    /// Durably flushes buffered writes.
    fn sync(&self) -> Result<(), CoreError>;

    /// Releases resources. Further calls are undefined.
    fn close(&self) -> Result<(), CoreError>;
}

fn poisoned<T>(err: T) -> CoreError
where
    T: std::fmt::Display,
{
    CoreError::Corrupt(format!("lock poisoned: {}", err))
}

pub(crate) fn decode_index(value: &[u8]) -> Result<u64, CoreError> {
    let arr: [u8; 8] = value
        .try_into()
        .map_err(|_| CoreError::Corrupt("applied index is not 8 bytes".to_string()))?;
    Ok(u64::from_be_bytes(arr))
}

/// In-memory implementation of [`Kv`] used by tests and volatile groups.
pub struct MemoryKv {
    data: RwLock<BTreeMap<Key, Value>>,
    views: Mutex<HashMap<u64, Vec<KvPair>>>,
    next_view: AtomicU64,
}

impl MemoryKv {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        MemoryKv {
            data: RwLock::new(BTreeMap::new()),
            views: Mutex::new(HashMap::new()),
            next_view: AtomicU64::new(1),
        }
    }

    fn applied_of(data: &BTreeMap<Key, Value>) -> Result<u64, CoreError> {
        match data.get(APPLIED_INDEX_KEY) {
            Some(v) => decode_index(v),
            None => Ok(0),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl Kv for MemoryKv {
    fn applied_index(&self) -> Result<u64, CoreError> {
        let data = self.data.read().map_err(poisoned)?;
        Self::applied_of(&data)
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Value>, CoreError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), CoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), CoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.remove(key);
        Ok(())
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<(), CoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write().map_err(poisoned)?;
        let applied = Self::applied_of(&data)?;
        if batch.max_index() <= applied {
            return Ok(());
        }
        for op in batch.ops() {
            if op.index() <= applied {
                continue;
            }
            match op {
                BatchOp::Put { key, value, .. } => {
                    data.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key, .. } => {
                    data.remove(key);
                }
            }
        }
        data.insert(
            APPLIED_INDEX_KEY.to_vec(),
            batch.max_index().to_be_bytes().to_vec(),
        );
        Ok(())
    }

    fn delete(&self, key: &[u8], index: u64) -> Result<(), CoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(index, key.to_vec());
        self.apply_batch(&batch)
    }

    fn iterate(&self, order: SortOrder) -> Result<Vec<KvPair>, CoreError> {
        let data = self.data.read().map_err(poisoned)?;
        let pairs = data
            .iter()
            .filter(|(k, _)| k.as_slice() != APPLIED_INDEX_KEY)
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(match order {
            SortOrder::Asc => pairs.collect(),
            SortOrder::Desc => {
                let mut all: Vec<KvPair> = pairs.collect();
                all.reverse();
                all
            }
        })
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, CoreError> {
        let data = self.data.read().map_err(poisoned)?;
        let mut result = Vec::new();
        for (k, v) in data.range::<Vec<u8>, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn prepare_snapshot(&self) -> Result<u64, CoreError> {
        let data = self.data.read().map_err(poisoned)?;
        let entries: Vec<KvPair> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let view = self.next_view.fetch_add(1, Ordering::SeqCst);
        self.views.lock().map_err(poisoned)?.insert(view, entries);
        Ok(view)
    }

    fn save_snapshot(&self, view: u64, w: &mut dyn Write) -> Result<(), CoreError> {
        let entries = self
            .views
            .lock()
            .map_err(poisoned)?
            .remove(&view)
            .ok_or_else(|| CoreError::Corrupt(format!("unknown snapshot view {}", view)))?;
        let frame = SnapshotFrame { entries };
        let encoded = bincode::serialize(&frame)?;
        w.write_all(&encoded)?;
        Ok(())
    }

    fn recover_from_snapshot(&self, r: &mut dyn Read) -> Result<(), CoreError> {
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        let frame: SnapshotFrame = bincode::deserialize(&buf)
            .map_err(|e| CoreError::Corrupt(format!("snapshot decode failed: {}", e)))?;
        let mut data = self.data.write().map_err(poisoned)?;
        *data = frame.entries.into_iter().collect();
        Ok(())
    }

    fn sync(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
