//! Log compaction through state-machine snapshots.
//!
//! Once applied state is captured in a snapshot, the covered log prefix is
//! dropped from both the durable log store and the consensus core. On a
//! leader the compaction point is additionally clamped to the slowest peer's
//! replicated index so every follower can still be served from the log.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use tracing::info;

use crate::consensus::RaftNode;
use crate::machine::StateMachine;
use crate::raft_log::{RaftLogStore, SnapshotMeta};
use crate::types::{CoreError, LogIndex};

const SNAPSHOT_FILE: &str = "state.snap";
const SNAPSHOT_TMP: &str = "state.snap.tmp";

/// Decides when to compact and carries out the snapshot + truncate sequence.
pub struct SnapshotManager {
    dir: Option<PathBuf>,
    threshold: u64,
}

impl SnapshotManager {
    /// `dir` is the group's raft directory; `None` for volatile groups,
    /// which compact without writing a snapshot file. A `threshold` of 0
    /// disables compaction.
    pub fn new(dir: Option<PathBuf>, threshold: u64) -> Self {
        SnapshotManager { dir, threshold }
    }

    /// True when the durable log has grown past the threshold.
    pub fn due(&self, log: &RaftLogStore) -> Result<bool, CoreError> {
        Ok(self.threshold > 0 && log.entry_count()? as u64 > self.threshold)
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(SNAPSHOT_FILE))
    }

    /// Captures machine state and drops the covered log prefix. Returns the
    /// compaction point, or `None` when there is nothing new to compact.
    pub fn take(
        &self,
        node: &mut RaftNode,
        log: &RaftLogStore,
        machine: &dyn StateMachine,
    ) -> Result<Option<LogIndex>, CoreError> {
        let mut through = LogIndex::new(machine.applied_index()?);
        if let Some(floor) = node.min_peer_match() {
            through = through.min(floor);
        }
        if through == LogIndex::ZERO {
            return Ok(None);
        }
        let Some(term) = node.term_at(through) else {
            return Ok(None);
        };
        if let Some(meta) = log.load_snapshot_meta()? {
            if through <= meta.last_index {
                return Ok(None);
            }
        }

        if let Some(dir) = &self.dir {
            let view = machine.prepare_snapshot()?;
            let tmp = dir.join(SNAPSHOT_TMP);
            let mut writer = BufWriter::new(File::create(&tmp)?);
            machine.save_snapshot(view, &mut writer)?;
            let file = writer
                .into_inner()
                .map_err(|e| CoreError::Io(e.into_error()))?;
            file.sync_all()?;
            fs::rename(&tmp, dir.join(SNAPSHOT_FILE))?;
        }

        let meta = SnapshotMeta {
            last_index: through,
            last_term: term,
        };
        log.compact_through(through)?;
        log.save_snapshot_meta(&meta)?;
        log.sync()?;
        node.compact_through(through, term);
        info!(through = %through, "compacted raft log");
        Ok(Some(through))
    }

    /// Restores machine state from the snapshot file when the durable log no
    /// longer reaches back to the machine's applied index. Returns the
    /// snapshot metadata the consensus core should restore from.
    pub fn recover(
        &self,
        log: &RaftLogStore,
        machine: &dyn StateMachine,
    ) -> Result<Option<SnapshotMeta>, CoreError> {
        let Some(meta) = log.load_snapshot_meta()? else {
            return Ok(None);
        };
        if machine.applied_index()? >= meta.last_index.as_u64() {
            return Ok(Some(meta));
        }
        let path = self.snapshot_path().ok_or_else(|| {
            CoreError::Corrupt("log compacted but group has no snapshot directory".to_string())
        })?;
        let file = File::open(&path)?;
        machine.recover_from_snapshot(&mut BufReader::new(file))?;
        info!(last_index = %meta.last_index, "recovered state machine from snapshot");
        Ok(Some(meta))
    }
}
