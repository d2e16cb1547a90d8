//! Append-only state machine for farm event logs.
//!
//! Entries are keyed by their append id, which is the proposing node's
//! timestamp in nanoseconds bumped past the previous id on ties. Assignment
//! happens here at apply time as a pure function of log order and store
//! state, so every replica assigns the same ids. Deletes are refused.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use loam_model::codec;
use loam_model::events::EventLogEntry;
use loam_model::idgen::{key_to_u64, uint64_key};

use crate::kvstore::{Kv, WriteBatch};
use crate::machine::{paginate, Proposal, ProposalOp, Query, QueryOutput, StateMachine};
use crate::types::{CoreError, LogEntry, SortOrder};

/// Append-only event log over a [`Kv`] store.
pub struct EventLogMachine {
    kv: Arc<dyn Kv>,
    // Highest assigned id, lazily loaded from the store.
    last_id: Mutex<Option<u64>>,
}

impl EventLogMachine {
    /// Creates a machine over the given store.
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        EventLogMachine {
            kv,
            last_id: Mutex::new(None),
        }
    }

    fn highest_id(&self) -> Result<u64, CoreError> {
        let mut cached = self
            .last_id
            .lock()
            .map_err(|e| CoreError::Corrupt(format!("lock poisoned: {}", e)))?;
        if let Some(id) = *cached {
            return Ok(id);
        }
        let id = self
            .kv
            .iterate(SortOrder::Desc)?
            .first()
            .and_then(|(k, _)| key_to_u64(k))
            .unwrap_or(0);
        *cached = Some(id);
        Ok(id)
    }

    fn set_highest(&self, id: u64) -> Result<(), CoreError> {
        let mut cached = self
            .last_id
            .lock()
            .map_err(|e| CoreError::Corrupt(format!("lock poisoned: {}", e)))?;
        *cached = Some(id);
        Ok(())
    }

    fn clear_highest(&self) {
        if let Ok(mut cached) = self.last_id.lock() {
            *cached = None;
        }
    }
}

impl StateMachine for EventLogMachine {
    fn update(&self, entries: &[LogEntry]) -> Result<(), CoreError> {
        // Already-applied entries must not move the id floor, or replicas
        // that replay after a restart would assign different ids than ones
        // that never crashed.
        let applied = self.kv.applied_index()?;

        let mut batch = WriteBatch::new();
        for entry in entries {
            if entry.index.as_u64() <= applied {
                continue;
            }
            let proposal = Proposal::decode(&entry.data)?;
            match proposal.op {
                ProposalOp::Update => {
                    let mut event: EventLogEntry = codec::from_bytes(&proposal.data)?;
                    let candidate = if event.id != 0 {
                        event.id
                    } else {
                        event.timestamp
                    };
                    let id = candidate.max(self.highest_id()? + 1);
                    event.id = id;
                    self.set_highest(id)?;
                    batch.put(
                        entry.index.as_u64(),
                        uint64_key(id).to_vec(),
                        codec::to_bytes(&event)?,
                    );
                }
                ProposalOp::Delete => return Err(CoreError::Immutable),
            }
        }
        self.kv.apply_batch(&batch)
    }

    fn lookup(&self, query: &Query) -> Result<QueryOutput, CoreError> {
        match query {
            Query::Point(id) => Ok(QueryOutput::Value(self.kv.lookup(&uint64_key(*id))?)),
            Query::Wildcard => {
                let values = self
                    .kv
                    .iterate(SortOrder::Asc)?
                    .into_iter()
                    .map(|(_, v)| v)
                    .collect();
                Ok(QueryOutput::Values(values))
            }
            Query::Page(page) => {
                let values = self
                    .kv
                    .iterate(page.sort_order)?
                    .into_iter()
                    .map(|(_, v)| v)
                    .collect();
                Ok(QueryOutput::Page(paginate(values, page)))
            }
        }
    }

    fn applied_index(&self) -> Result<u64, CoreError> {
        self.kv.applied_index()
    }

    fn sync(&self) -> Result<(), CoreError> {
        self.kv.sync()
    }

    fn prepare_snapshot(&self) -> Result<u64, CoreError> {
        self.kv.prepare_snapshot()
    }

    fn save_snapshot(&self, view: u64, w: &mut dyn Write) -> Result<(), CoreError> {
        self.kv.save_snapshot(view, w)
    }

    fn recover_from_snapshot(&self, r: &mut dyn Read) -> Result<(), CoreError> {
        self.clear_highest();
        self.kv.recover_from_snapshot(r)
    }

    fn close(&self) -> Result<(), CoreError> {
        self.kv.close()
    }
}
