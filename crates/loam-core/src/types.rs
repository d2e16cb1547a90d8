//! Shared identifier types, Raft wire messages, and the error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::machine::Query;

/// Identifier of one process in a replication group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an independent replication group. Derived deterministically
/// for per-entity groups, so every node computes the same id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(u64);

impl GroupId {
    /// Creates a new GroupId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        GroupId(id)
    }

    /// Returns the raw u64 value of this group ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Raft term number.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    /// Term zero, never used by an elected leader.
    pub const ZERO: Term = Term(0);

    /// Creates a new Term from a raw u64 value.
    pub fn new(t: u64) -> Self {
        Term(t)
    }

    /// Returns the raw u64 value of this term.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Raft log index. Index 0 means "before the first entry".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    /// A zero log index.
    pub const ZERO: LogIndex = LogIndex(0);

    /// Creates a new LogIndex from a raw u64 value.
    pub fn new(i: u64) -> Self {
        LogIndex(i)
    }

    /// Returns the raw u64 value of this log index.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The index immediately after this one.
    pub fn next(&self) -> LogIndex {
        LogIndex(self.0 + 1)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single entry in the Raft log. The payload is an opaque proposal the
/// state machine decodes on apply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log index.
    pub index: LogIndex,
    /// Term when the entry was created.
    pub term: Term,
    /// Encoded proposal bytes.
    pub data: Vec<u8>,
}

/// Messages exchanged between Raft peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request for vote from a candidate.
    RequestVote {
        /// Candidate's term.
        term: Term,
        /// Candidate node ID.
        candidate_id: NodeId,
        /// Index of candidate's last log entry.
        last_log_index: LogIndex,
        /// Term of candidate's last log entry.
        last_log_term: Term,
    },
    /// Response to RequestVote.
    RequestVoteResponse {
        /// Responder's term.
        term: Term,
        /// Whether the vote was granted.
        vote_granted: bool,
    },
    /// Entries (or a heartbeat, when empty) from leader to follower.
    AppendEntries {
        /// Leader's term.
        term: Term,
        /// Leader node ID.
        leader_id: NodeId,
        /// Index of the log entry preceding the new entries.
        prev_log_index: LogIndex,
        /// Term of the prev_log_index entry.
        prev_log_term: Term,
        /// Log entries to append.
        entries: Vec<LogEntry>,
        /// Leader's commit index.
        leader_commit: LogIndex,
    },
    /// Response to AppendEntries.
    AppendEntriesResponse {
        /// Follower's term.
        term: Term,
        /// Whether the append succeeded.
        success: bool,
        /// Highest log index known to match the leader.
        match_index: LogIndex,
    },
    /// Leadership transfer request: the target starts an election without
    /// waiting for its timeout.
    TimeoutNow {
        /// Leader's term.
        term: Term,
        /// Current leader ID.
        leader_id: NodeId,
    },
}

/// Current state of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Following a leader.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Leading the group.
    Leader,
}

/// Traversal direction for iteration and paginated queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending key order.
    #[default]
    Asc,
    /// Descending key order.
    Desc,
}

/// Errors produced by the replicated store and DAO layers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// No entity exists at the requested identity.
    #[error("not found")]
    NotFound,

    /// A lookup received a query shape the state machine does not handle.
    #[error("unsupported query: {0:?}")]
    UnsupportedQuery(Query),

    /// A telemetry record exists but does not carry the requested metric.
    #[error("metric key '{key}' not found in retained records")]
    MetricKeyNotFound {
        /// The missing metric key.
        key: String,
    },

    /// The state machine rejects mutation of existing records.
    #[error("store is append-only")]
    Immutable,

    /// Operation requires the Raft leader but this node is not the leader.
    #[error("not the Raft leader")]
    NotLeader {
        /// Hint about the current leader.
        leader_hint: Option<NodeId>,
    },

    /// A propose or linearizable read did not reach quorum in time.
    #[error("replication timed out")]
    ReplicationTimeout,

    /// The operation was abandoned because the group is shutting down.
    #[error("operation cancelled")]
    Cancelled,

    /// No replication group is running under the requested id.
    #[error("replication group {0} not found")]
    GroupNotFound(GroupId),

    /// On-disk state failed validation during recovery.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// Invalid node configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// A payload could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        CoreError::Encoding(err.to_string())
    }
}

impl From<loam_model::ModelError> for CoreError {
    fn from(err: loam_model::ModelError) -> Self {
        CoreError::Encoding(err.to_string())
    }
}
