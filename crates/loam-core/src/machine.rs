//! Contract between replication groups and the typed state machines they
//! drive.
//!
//! Committed log entries carry a bincode [`Proposal`] envelope; reads go
//! through the [`Query`] sum type so a caller states the shape it wants
//! instead of overloading one lookup call.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::types::{CoreError, LogEntry, SortOrder};

/// A paginated read request. Pages are 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    /// Page number, starting at 1.
    pub page: u64,
    /// Records per page.
    pub page_size: u64,
    /// Traversal direction over the key space.
    pub sort_order: SortOrder,
}

impl PageQuery {
    /// First page of `page_size` records in ascending order.
    pub fn first(page_size: u64) -> Self {
        PageQuery {
            page: 1,
            page_size,
            sort_order: SortOrder::Asc,
        }
    }
}

/// Read request shapes a state machine can serve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Query {
    /// Single record by identifier.
    Point(u64),
    /// Every record.
    Wildcard,
    /// One page of records.
    Page(PageQuery),
}

/// One page of encoded records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// Encoded records in requested order.
    pub items: Vec<Vec<u8>>,
    /// True when at least one record exists past this page.
    pub has_more: bool,
}

/// Result shapes matching [`Query`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueryOutput {
    /// Point lookup result.
    Value(Option<Vec<u8>>),
    /// Wildcard result.
    Values(Vec<Vec<u8>>),
    /// Page result.
    Page(PageResult),
}

/// Mutation kind carried by a proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalOp {
    /// Insert or replace a record.
    Update,
    /// Remove a record by identifier.
    Delete,
}

/// The envelope replicated through the Raft log. For `Update` the payload is
/// the encoded record; for `Delete` it is the 8-byte big-endian identifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Mutation kind.
    pub op: ProposalOp,
    /// Encoded payload.
    pub data: Vec<u8>,
}

impl Proposal {
    /// Builds an update proposal around already-encoded record bytes.
    pub fn update(data: Vec<u8>) -> Self {
        Proposal {
            op: ProposalOp::Update,
            data,
        }
    }

    /// Builds a delete proposal for a record identifier.
    pub fn delete(id: u64) -> Self {
        Proposal {
            op: ProposalOp::Delete,
            data: id.to_be_bytes().to_vec(),
        }
    }

    /// Serializes the envelope for the Raft log.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes an envelope from a committed log entry.
    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Identifier payload of a delete proposal.
    pub fn delete_target(&self) -> Result<u64, CoreError> {
        let arr: [u8; 8] = self
            .data
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::Encoding("delete payload is not 8 bytes".to_string()))?;
        Ok(u64::from_be_bytes(arr))
    }
}

/// A typed store driven by one replication group.
///
/// `update` is called with committed entries in log order, exactly once per
/// entry across restarts (the underlying store skips indexes at or below its
/// persisted applied index). Lookups never go through the log.
pub trait StateMachine: Send + Sync {
    /// Applies committed entries in order.
    fn update(&self, entries: &[LogEntry]) -> Result<(), CoreError>;

    /// Serves a read against current local state.
    fn lookup(&self, query: &Query) -> Result<QueryOutput, CoreError>;

    /// Highest applied Raft log index, used to resume the apply cursor.
    fn applied_index(&self) -> Result<u64, CoreError>;

    /// Durably flushes buffered writes.
    fn sync(&self) -> Result<(), CoreError>;

    /// Captures a consistent view for streaming; returns its identifier.
    fn prepare_snapshot(&self) -> Result<u64, CoreError>;

    /// Streams a prepared view. The view is consumed.
    fn save_snapshot(&self, view: u64, w: &mut dyn Write) -> Result<(), CoreError>;

    /// Replaces state from a snapshot stream.
    fn recover_from_snapshot(&self, r: &mut dyn Read) -> Result<(), CoreError>;

    /// Releases resources.
    fn close(&self) -> Result<(), CoreError>;
}

/// Cuts one page out of an ordered value list.
///
/// The peek past the page end only feeds `has_more` and is never part of the
/// returned items. Page 0 is read as page 1.
pub(crate) fn paginate(values: Vec<Vec<u8>>, query: &PageQuery) -> PageResult {
    let page = query.page.max(1);
    let size = query.page_size as usize;
    let offset = ((page - 1) as usize).saturating_mul(size);

    let has_more = values.len() > offset.saturating_add(size);
    let items = values
        .into_iter()
        .skip(offset)
        .take(size)
        .collect::<Vec<_>>();
    PageResult { items, has_more }
}
