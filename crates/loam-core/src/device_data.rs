//! Telemetry history state machine, one group per device.
//!
//! Records are [`DeviceStateMap`] snapshots keyed by their capture timestamp
//! in nanoseconds. Retention is applied at write time against the timestamp
//! of the record being stored, never against wall clock, so every replica
//! prunes the same keys.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::Arc;

use loam_model::codec;
use loam_model::idgen::{key_to_u64, uint64_key};
use loam_model::state::DeviceStateMap;

use crate::kvstore::{Kv, WriteBatch};
use crate::machine::{paginate, Proposal, ProposalOp, Query, QueryOutput, StateMachine};
use crate::types::{CoreError, LogEntry, SortOrder};

/// Records older than this relative to the newest write are dropped.
pub const RETENTION_WINDOW_NANOS: u64 = 30 * 24 * 60 * 60 * 1_000_000_000;

/// Hard cap on retained records per device. 30 days at one snapshot per
/// minute.
pub const MAX_RECORDS: usize = 43_200;

/// Time-bounded snapshot history over a [`Kv`] store.
pub struct DeviceDataMachine {
    kv: Arc<dyn Kv>,
}

impl DeviceDataMachine {
    /// Creates a machine over the given store.
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        DeviceDataMachine { kv }
    }

    fn stored_keys(&self) -> Result<BTreeSet<u64>, CoreError> {
        Ok(self
            .kv
            .iterate(SortOrder::Asc)?
            .iter()
            .filter_map(|(k, _)| key_to_u64(k))
            .collect())
    }
}

impl StateMachine for DeviceDataMachine {
    fn update(&self, entries: &[LogEntry]) -> Result<(), CoreError> {
        let mut batch = WriteBatch::new();
        // Tracks the key set as the batch would leave it, so retention for
        // later entries sees earlier puts and prunes in the same batch.
        let mut keys = self.stored_keys()?;

        for entry in entries {
            let index = entry.index.as_u64();
            let proposal = Proposal::decode(&entry.data)?;
            match proposal.op {
                ProposalOp::Update => {
                    let record: DeviceStateMap = codec::from_bytes(&proposal.data)?;
                    batch.put(index, uint64_key(record.timestamp).to_vec(), proposal.data);
                    keys.insert(record.timestamp);

                    let cutoff = record.timestamp.saturating_sub(RETENTION_WINDOW_NANOS);
                    let expired: Vec<u64> = keys.range(..cutoff).copied().collect();
                    for ts in expired {
                        batch.delete(index, uint64_key(ts).to_vec());
                        keys.remove(&ts);
                    }
                    while keys.len() > MAX_RECORDS {
                        match keys.iter().next().copied() {
                            Some(oldest) => {
                                batch.delete(index, uint64_key(oldest).to_vec());
                                keys.remove(&oldest);
                            }
                            None => break,
                        }
                    }
                }
                ProposalOp::Delete => {
                    let ts = proposal.delete_target()?;
                    batch.delete(index, uint64_key(ts).to_vec());
                    keys.remove(&ts);
                }
            }
        }
        self.kv.apply_batch(&batch)
    }

    fn lookup(&self, query: &Query) -> Result<QueryOutput, CoreError> {
        match query {
            Query::Point(ts) => Ok(QueryOutput::Value(self.kv.lookup(&uint64_key(*ts))?)),
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
        self.kv.recover_from_snapshot(r)
    }

    fn close(&self) -> Result<(), CoreError> {
        self.kv.close()
    }
}

/// Values of one metric across records, oldest first. Every record must
/// carry the key; a gap is an error, not a skip.
pub fn metric_series(records: &[DeviceStateMap], key: &str) -> Result<Vec<f64>, CoreError> {
    records
        .iter()
        .map(|r| {
            r.metric(key).ok_or_else(|| CoreError::MetricKeyNotFound {
                key: key.to_string(),
            })
        })
        .collect()
}
