//! File-backed implementation of the KV engine.
//!
//! An in-memory BTreeMap serves reads; durability comes from a write-ahead
//! log replayed on open, compacted into a checkpoint file. Recovery loads
//! the checkpoint first and then replays whatever the WAL still holds.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kvstore::{decode_index, BatchOp, Key, Kv, KvPair, SnapshotFrame, Value, WriteBatch};
use crate::kvstore::APPLIED_INDEX_KEY;
use crate::types::{CoreError, SortOrder};

const WAL_FILENAME: &str = "wal.bin";
const CHECKPOINT_FILENAME: &str = "checkpoint.bin";

#[derive(Debug, Serialize, Deserialize, Clone)]
enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    seq: u64,
    op: WalOp,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug)]
struct WalWriter {
    file: File,
}

impl WalWriter {
    fn new(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(WalWriter { file })
    }

    fn append(&mut self, entry: &WalEntry) -> std::io::Result<()> {
        let encoded = bincode::serialize(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let len_bytes = (encoded.len() as u32).to_le_bytes();
        self.file.write_all(&len_bytes)?;
        self.file.write_all(&encoded)?;
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// File-backed [`Kv`] store. One instance owns one directory.
#[derive(Debug)]
pub struct DiskKv {
    data: RwLock<BTreeMap<Key, Value>>,
    wal: Mutex<WalWriter>,
    dir: PathBuf,
    seq: AtomicU64,
    views: Mutex<HashMap<u64, Vec<KvPair>>>,
    next_view: AtomicU64,
}

impl DiskKv {
    /// Opens or creates a store in the given directory. Loads the checkpoint
    /// if present, then replays remaining WAL entries.
    pub fn open(dir: &Path) -> Result<Self, CoreError> {
        fs::create_dir_all(dir)?;

        let wal_path = dir.join(WAL_FILENAME);
        let checkpoint_path = dir.join(CHECKPOINT_FILENAME);
        let wal = WalWriter::new(&wal_path)?;

        let store = DiskKv {
            data: RwLock::new(BTreeMap::new()),
            wal: Mutex::new(wal),
            dir: dir.to_path_buf(),
            seq: AtomicU64::new(0),
            views: Mutex::new(HashMap::new()),
            next_view: AtomicU64::new(1),
        };

        store.load_checkpoint(&checkpoint_path)?;
        store.replay_wal(&wal_path)?;

        debug!(
            dir = %dir.display(),
            entries = store.data.read().map_err(poisoned)?.len(),
            applied = store.applied_index()?,
            "opened disk store"
        );
        Ok(store)
    }

    fn load_checkpoint(&self, path: &Path) -> Result<(), CoreError> {
        if !path.exists() {
            return Ok(());
        }

        let mut file = File::open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        if contents.is_empty() {
            return Ok(());
        }

        let checkpoint: Checkpoint = bincode::deserialize(&contents)
            .map_err(|e| CoreError::Corrupt(format!("checkpoint decode failed: {}", e)))?;

        let mut data = self.data.write().map_err(poisoned)?;
        for (k, v) in checkpoint.entries {
            data.insert(k, v);
        }
        self.seq.store(checkpoint.seq, Ordering::SeqCst);
        Ok(())
    }

    fn replay_wal(&self, path: &Path) -> Result<(), CoreError> {
        if !path.exists() {
            return Ok(());
        }

        let mut file = File::open(path)?;
        let mut data = self.data.write().map_err(poisoned)?;
        let mut max_seq = self.seq.load(Ordering::SeqCst);

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            let mut op_buf = vec![0u8; len];
            match file.read_exact(&mut op_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Torn tail from a crash mid-append; everything before it
                    // is intact.
                    warn!(dir = %self.dir.display(), "discarding torn WAL tail");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let entry: WalEntry = bincode::deserialize(&op_buf)
                .map_err(|e| CoreError::Corrupt(format!("WAL entry decode failed: {}", e)))?;

            if entry.seq > max_seq {
                max_seq = entry.seq;
            }

            match entry.op {
                WalOp::Put { key, value } => {
                    data.insert(key, value);
                }
                WalOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }

        self.seq.store(max_seq, Ordering::SeqCst);
        Ok(())
    }

    /// Compacts the current state into the checkpoint file and truncates the
    /// WAL.
    pub fn checkpoint(&self) -> Result<(), CoreError> {
        let data = self.data.read().map_err(poisoned)?;
        let entries: Vec<(Vec<u8>, Vec<u8>)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let checkpoint = Checkpoint {
            seq: self.seq.load(Ordering::SeqCst),
            entries,
        };
        drop(data);

        self.write_checkpoint_file(&checkpoint)?;

        let mut wal = self.wal.lock().map_err(poisoned)?;
        wal.truncate()?;
        Ok(())
    }

    fn write_checkpoint_file(&self, checkpoint: &Checkpoint) -> Result<(), CoreError> {
        let encoded = bincode::serialize(checkpoint)?;
        let checkpoint_path = self.dir.join(CHECKPOINT_FILENAME);
        let mut tmp_path = checkpoint_path.clone();
        tmp_path.set_extension("tmp");

        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &checkpoint_path)?;
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn applied_of(data: &BTreeMap<Key, Value>) -> Result<u64, CoreError> {
        match data.get(APPLIED_INDEX_KEY) {
            Some(v) => decode_index(v),
            None => Ok(0),
        }
    }
}

fn poisoned<T>(err: T) -> CoreError
where
    T: std::fmt::Display,
{
    CoreError::Corrupt(format!("lock poisoned: {}", err))
}

impl Kv for DiskKv {
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
        {
            let mut wal = self.wal.lock().map_err(poisoned)?;
            wal.append(&WalEntry {
                seq: self.next_seq(),
                op: WalOp::Put {
                    key: key.clone(),
                    value: value.clone(),
                },
            })?;
            wal.flush()?;
        }
        data.insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), CoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        {
            let mut wal = self.wal.lock().map_err(poisoned)?;
            wal.append(&WalEntry {
                seq: self.next_seq(),
                op: WalOp::Delete { key: key.to_vec() },
            })?;
            wal.flush()?;
        }
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

        let effective: Vec<&BatchOp> = batch
            .ops()
            .iter()
            .filter(|op| op.index() > applied)
            .collect();
        let new_applied = batch.max_index().to_be_bytes().to_vec();

        {
            let mut wal = self.wal.lock().map_err(poisoned)?;
            for op in &effective {
                let wal_op = match op {
                    BatchOp::Put { key, value, .. } => WalOp::Put {
                        key: key.clone(),
                        value: value.clone(),
                    },
                    BatchOp::Delete { key, .. } => WalOp::Delete { key: key.clone() },
                };
                wal.append(&WalEntry {
                    seq: self.next_seq(),
                    op: wal_op,
                })?;
            }
            // The applied-index record goes last: a torn tail then replays
            // with the old index and the group re-applies the whole batch.
            wal.append(&WalEntry {
                seq: self.next_seq(),
                op: WalOp::Put {
                    key: APPLIED_INDEX_KEY.to_vec(),
                    value: new_applied.clone(),
                },
            })?;
            wal.flush()?;
        }

        for op in effective {
            match op {
                BatchOp::Put { key, value, .. } => {
                    data.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key, .. } => {
                    data.remove(key);
                }
            }
        }
        data.insert(APPLIED_INDEX_KEY.to_vec(), new_applied);
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
        let restored: BTreeMap<Key, Value> = frame.entries.into_iter().collect();

        // Persist the replacement before exposing it. A crash in between
        // recovers to the previous checkpoint, never to a half-replaced
        // store.
        let mut data = self.data.write().map_err(poisoned)?;
        self.write_checkpoint_file(&Checkpoint {
            seq: self.seq.load(Ordering::SeqCst),
            entries: restored.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })?;
        {
            let mut wal = self.wal.lock().map_err(poisoned)?;
            wal.truncate()?;
        }
        *data = restored;
        Ok(())
    }

    fn sync(&self) -> Result<(), CoreError> {
        let mut wal = self.wal.lock().map_err(poisoned)?;
        wal.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<(), CoreError> {
        self.checkpoint()?;
        debug!(dir = %self.dir.display(), "closed disk store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put_batch(store: &DiskKv, index: u64, key: &[u8], value: &[u8]) {
        let mut batch = WriteBatch::new();
        batch.put(index, key.to_vec(), value.to_vec());
        store.apply_batch(&batch).unwrap();
    }

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let store = DiskKv::open(dir.path()).unwrap();
        put_batch(&store, 1, b"key1", b"value1");
        assert_eq!(store.lookup(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.lookup(b"key2").unwrap(), None);
    }

    #[test]
    fn test_crash_recovery_wal_replay() {
        let dir = tempdir().unwrap();
        {
            let store = DiskKv::open(dir.path()).unwrap();
            put_batch(&store, 1, b"key1", b"value1");
            put_batch(&store, 2, b"key2", b"value2");
            store.delete(b"key1", 3).unwrap();
            // No checkpoint: recovery must come entirely from the WAL.
        }

        let store = DiskKv::open(dir.path()).unwrap();
        assert_eq!(store.lookup(b"key1").unwrap(), None);
        assert_eq!(store.lookup(b"key2").unwrap(), Some(b"value2".to_vec()));
        assert_eq!(store.applied_index().unwrap(), 3);
    }

    #[test]
    fn test_applied_index_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = DiskKv::open(dir.path()).unwrap();
            put_batch(&store, 7, b"a", b"1");
            store.close().unwrap();
        }
        let store = DiskKv::open(dir.path()).unwrap();
        assert_eq!(store.applied_index().unwrap(), 7);

        // Replay of an already applied index is a no-op after reopen.
        put_batch(&store, 7, b"a", b"stale");
        assert_eq!(store.lookup(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_checkpoint_and_reload() {
        let dir = tempdir().unwrap();
        {
            let store = DiskKv::open(dir.path()).unwrap();
            put_batch(&store, 1, b"a", b"1");
            put_batch(&store, 2, b"b", b"2");
            store.checkpoint().unwrap();
        }

        let wal_path = dir.path().join(WAL_FILENAME);
        assert_eq!(fs::metadata(&wal_path).unwrap().len(), 0);

        let store = DiskKv::open(dir.path()).unwrap();
        assert_eq!(store.lookup(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.lookup(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.applied_index().unwrap(), 2);
    }

    #[test]
    fn test_writes_after_checkpoint_survive() {
        let dir = tempdir().unwrap();
        {
            let store = DiskKv::open(dir.path()).unwrap();
            put_batch(&store, 1, b"a", b"1");
            store.checkpoint().unwrap();
            put_batch(&store, 2, b"b", b"2");
        }
        let store = DiskKv::open(dir.path()).unwrap();
        assert_eq!(store.lookup(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.lookup(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_iterate_skips_reserved_and_orders() {
        let dir = tempdir().unwrap();
        let store = DiskKv::open(dir.path()).unwrap();
        put_batch(&store, 1, b"b", b"2");
        put_batch(&store, 2, b"a", b"1");
        let asc = store.iterate(SortOrder::Asc).unwrap();
        let keys: Vec<&[u8]> = asc.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a" as &[u8], b"b"]);
        let desc = store.iterate(SortOrder::Desc).unwrap();
        let keys: Vec<&[u8]> = desc.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"b" as &[u8], b"a"]);
    }

    #[test]
    fn test_snapshot_round_trip_between_stores() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let src = DiskKv::open(src_dir.path()).unwrap();
        put_batch(&src, 1, b"a", b"1");
        put_batch(&src, 2, b"b", b"2");

        let view = src.prepare_snapshot().unwrap();
        let mut buf = Vec::new();
        src.save_snapshot(view, &mut buf).unwrap();

        let dst = DiskKv::open(dst_dir.path()).unwrap();
        put_batch(&dst, 1, b"stale", b"x");
        dst.recover_from_snapshot(&mut buf.as_slice()).unwrap();
        assert_eq!(dst.lookup(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(dst.lookup(b"stale").unwrap(), None);
        assert_eq!(dst.applied_index().unwrap(), 2);

        // The replacement is durable without further writes.
        drop(dst);
        let reopened = DiskKv::open(dst_dir.path()).unwrap();
        assert_eq!(reopened.lookup(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reopened.applied_index().unwrap(), 2);
    }

    #[test]
    fn test_recover_from_garbage_leaves_store_untouched() {
        let dir = tempdir().unwrap();
        let store = DiskKv::open(dir.path()).unwrap();
        put_batch(&store, 1, b"a", b"1");
        let err = store
            .recover_from_snapshot(&mut b"garbage".as_slice())
            .unwrap_err();
        assert!(matches!(err, CoreError::Corrupt(_)));
        assert_eq!(store.lookup(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_torn_wal_tail_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let store = DiskKv::open(dir.path()).unwrap();
            put_batch(&store, 1, b"a", b"1");
        }

        // Simulate a crash mid-append: a length prefix with no payload.
        let wal_path = dir.path().join(WAL_FILENAME);
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        file.sync_all().unwrap();

        let store = DiskKv::open(dir.path()).unwrap();
        assert_eq!(store.lookup(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_corrupt_checkpoint_fails_loudly() {
        let dir = tempdir().unwrap();
        {
            let store = DiskKv::open(dir.path()).unwrap();
            put_batch(&store, 1, b"a", b"1");
            store.checkpoint().unwrap();
        }
        let checkpoint_path = dir.path().join(CHECKPOINT_FILENAME);
        fs::write(&checkpoint_path, b"\xff\xfe\xfd").unwrap();

        let err = DiskKv::open(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::Corrupt(_)));
    }

    #[test]
    fn test_raw_writes_survive_reopen_without_applied_change() {
        let dir = tempdir().unwrap();
        {
            let store = DiskKv::open(dir.path()).unwrap();
            store.put(b"raft/term".to_vec(), b"7".to_vec()).unwrap();
        }
        let store = DiskKv::open(dir.path()).unwrap();
        assert_eq!(store.lookup(b"raft/term").unwrap(), Some(b"7".to_vec()));
        assert_eq!(store.applied_index().unwrap(), 0);
    }
}
