//! Raft consensus core for one replication group.
//!
//! This is a pure state machine: messages come in through [`RaftNode::step`]
//! and outbound messages come back as `(peer, message)` pairs. The owning
//! group loop drives timers, persistence, and the apply path, so this type
//! never touches the disk or the network itself. Entries carry opaque
//! proposal bytes that the state machine decodes on apply.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::raft_log::{HardState, SnapshotMeta};
use crate::types::{CoreError, LogEntry, LogIndex, NodeId, RaftMessage, RaftState, Term};

/// Configuration for a Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's unique identifier.
    pub node_id: NodeId,
    /// Other nodes in the group (excluding this node). Empty for a
    /// single-node group.
    pub peers: Vec<NodeId>,
    /// Minimum election timeout in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Maximum election timeout in milliseconds.
    pub election_timeout_max_ms: u64,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(0),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

/// A Raft node implementing the consensus state machine.
///
/// The in-memory log may start past index 1 after snapshot compaction;
/// `log_start` is the index of the first retained entry and `snapshot_term`
/// the term of the entry just below it.
pub struct RaftNode {
    config: RaftConfig,
    state: RaftState,
    current_term: Term,
    voted_for: Option<NodeId>,
    current_leader: Option<NodeId>,
    log: Vec<LogEntry>,
    log_start: LogIndex,
    snapshot_term: Term,
    commit_index: LogIndex,
    last_applied: LogIndex,
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    votes_received: HashSet<NodeId>,
    unpersisted_from: Option<LogIndex>,
}

impl RaftNode {
    /// Create a new Raft node starting as a Follower with an empty log.
    pub fn new(config: RaftConfig) -> Self {
        debug!(
            node_id = %config.node_id,
            peers = ?config.peers,
            "creating Raft node as Follower"
        );
        Self {
            config,
            state: RaftState::Follower,
            current_term: Term::ZERO,
            voted_for: None,
            current_leader: None,
            log: Vec::new(),
            log_start: LogIndex::new(1),
            snapshot_term: Term::ZERO,
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            unpersisted_from: None,
        }
    }

    /// This node's identifier.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Get the current state.
    pub fn state(&self) -> RaftState {
        self.state
    }

    /// True when this node is the group leader.
    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }

    /// Get the current term.
    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// Get the commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Get the last applied index.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Get the node this node voted for in the current term.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Best known leader: this node when leading, otherwise whoever sent the
    /// last valid AppendEntries.
    pub fn leader_hint(&self) -> Option<NodeId> {
        if self.is_leader() {
            Some(self.config.node_id)
        } else {
            self.current_leader
        }
    }

    /// The state that must be durable before messages go out.
    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
        }
    }

    /// Get the last log index.
    pub fn last_log_index(&self) -> LogIndex {
        LogIndex::new(self.log_start.as_u64() - 1 + self.log.len() as u64)
    }

    /// Get the term of the last log entry.
    pub fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    /// Lowest replicated index across peers while leading a multi-node
    /// group. Compaction must not pass this point, or a lagging peer could
    /// no longer be caught up from the log.
    pub fn min_peer_match(&self) -> Option<LogIndex> {
        if self.state != RaftState::Leader || self.config.peers.is_empty() {
            return None;
        }
        self.match_index.values().min().copied()
    }

    /// Term of the entry at `index`, if this node can still determine it.
    /// Index 0 and the snapshot boundary resolve without a retained entry.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex::ZERO {
            return Some(Term::ZERO);
        }
        if index.next() == self.log_start {
            return Some(self.snapshot_term);
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.log_start {
            return None;
        }
        self.log.get((index.as_u64() - self.log_start.as_u64()) as usize)
    }

    /// Rebuild volatile state after a restart.
    ///
    /// `entries` is the durable log suffix, `snapshot` the compaction
    /// boundary if one was recorded, and `applied` the state machine's
    /// persisted applied index.
    pub fn restore(
        &mut self,
        hard: HardState,
        entries: Vec<LogEntry>,
        snapshot: Option<SnapshotMeta>,
        applied: LogIndex,
    ) {
        self.current_term = hard.term;
        self.voted_for = hard.voted_for;
        let (log_start, snapshot_term) = match snapshot {
            Some(meta) => (meta.last_index.next(), meta.last_term),
            None => (LogIndex::new(1), Term::ZERO),
        };
        self.log_start = log_start;
        self.snapshot_term = snapshot_term;
        self.log = entries;
        let floor = self.log_start.as_u64() - 1;
        self.last_applied = LogIndex::new(applied.as_u64().max(floor));
        self.commit_index =
            LogIndex::new(hard.commit_index.as_u64().max(self.last_applied.as_u64()));
        self.unpersisted_from = None;

        info!(
            node_id = %self.config.node_id,
            term = %self.current_term,
            last_index = %self.last_log_index(),
            commit_index = %self.commit_index,
            last_applied = %self.last_applied,
            "restored Raft state"
        );
    }

    /// Dispatch one inbound message and collect the outbound ones.
    pub fn step(&mut self, from: NodeId, msg: RaftMessage) -> Vec<(NodeId, RaftMessage)> {
        match msg {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let resp =
                    self.handle_request_vote(term, candidate_id, last_log_index, last_log_term);
                vec![(candidate_id, resp)]
            }
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                self.handle_vote_response(from, term, vote_granted)
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let resp = self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );
                vec![(leader_id, resp)]
            }
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => self.handle_append_response(from, term, success, match_index),
            RaftMessage::TimeoutNow { term, leader_id } => {
                self.handle_timeout_now(term, leader_id)
            }
        }
    }

    /// Start an election: transition to Candidate, increment term, vote for
    /// self. A single-node group wins immediately.
    pub fn start_election(&mut self) -> Vec<(NodeId, RaftMessage)> {
        self.state = RaftState::Candidate;
        self.current_term = Term::new(self.current_term.as_u64() + 1);
        self.voted_for = Some(self.config.node_id);
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.config.node_id);

        info!(
            node_id = %self.config.node_id,
            term = %self.current_term,
            "starting election"
        );

        if self.votes_received.len() >= self.majority() {
            return self.become_leader();
        }

        let last_log_index = self.last_log_index();
        let last_log_term = self.last_log_term();
        self.config
            .peers
            .iter()
            .map(|peer| {
                (
                    *peer,
                    RaftMessage::RequestVote {
                        term: self.current_term,
                        candidate_id: self.config.node_id,
                        last_log_index,
                        last_log_term,
                    },
                )
            })
            .collect()
    }

    /// Leader heartbeat tick: replicate to every peer. Empty when not
    /// leading.
    pub fn heartbeat(&mut self) -> Vec<(NodeId, RaftMessage)> {
        if self.state != RaftState::Leader {
            return Vec::new();
        }
        self.config
            .peers
            .iter()
            .map(|peer| (*peer, self.build_append_entries(*peer)))
            .collect()
    }

    /// Propose a new entry. Only valid when Leader. Returns the assigned
    /// index together with the replication messages for the peers.
    pub fn propose(
        &mut self,
        data: Vec<u8>,
    ) -> Result<(LogIndex, Vec<(NodeId, RaftMessage)>), CoreError> {
        if self.state != RaftState::Leader {
            return Err(CoreError::NotLeader {
                leader_hint: self.current_leader,
            });
        }

        let index = self.last_log_index().next();
        debug!(
            node_id = %self.config.node_id,
            term = %self.current_term,
            index = %index,
            "proposing entry"
        );
        self.log.push(LogEntry {
            index,
            term: self.current_term,
            data,
        });
        self.mark_unpersisted(index);

        // A single-node group has its quorum already.
        self.try_advance_commit();

        let messages = self
            .config
            .peers
            .iter()
            .map(|peer| (*peer, self.build_append_entries(*peer)))
            .collect();
        Ok((index, messages))
    }

    /// Hand leadership to a caught-up peer by telling it to campaign now.
    pub fn transfer_leadership(
        &mut self,
        target: NodeId,
    ) -> Result<Vec<(NodeId, RaftMessage)>, CoreError> {
        if self.state != RaftState::Leader {
            return Err(CoreError::NotLeader {
                leader_hint: self.current_leader,
            });
        }
        if target == self.config.node_id {
            return Ok(Vec::new());
        }
        let caught_up = self.config.peers.contains(&target)
            && self.match_index.get(&target).copied() == Some(self.last_log_index());
        if !caught_up {
            return Err(CoreError::Config(format!(
                "transfer target {} is not a caught-up peer",
                target
            )));
        }

        info!(
            node_id = %self.config.node_id,
            target = %target,
            term = %self.current_term,
            "transferring leadership"
        );
        Ok(vec![(
            target,
            RaftMessage::TimeoutNow {
                term: self.current_term,
                leader_id: self.config.node_id,
            },
        )])
    }

    /// Committed entries not yet handed to the apply loop. Advances
    /// `last_applied` past everything returned.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        let start = self
            .last_applied
            .as_u64()
            .max(self.log_start.as_u64() - 1);
        let end = self
            .commit_index
            .as_u64()
            .min(self.last_log_index().as_u64());
        if start >= end {
            return Vec::new();
        }

        let s = (start + 1 - self.log_start.as_u64()) as usize;
        let e = (end + 1 - self.log_start.as_u64()) as usize;
        let entries = self.log[s..e].to_vec();
        self.last_applied = LogIndex::new(end);

        debug!(
            node_id = %self.config.node_id,
            count = entries.len(),
            last_applied = %self.last_applied,
            "taking committed entries to apply"
        );
        entries
    }

    /// Log changes since the last call: the lowest changed index and every
    /// retained entry from there on. The caller truncates its durable copy
    /// at the returned index and re-appends the entries.
    pub fn take_unpersisted(&mut self) -> Option<(LogIndex, Vec<LogEntry>)> {
        let from = self.unpersisted_from.take()?;
        let from = if from < self.log_start {
            self.log_start
        } else {
            from
        };
        if from > self.last_log_index() {
            // Pure truncation: entries from here on were cut and nothing
            // replaced them yet.
            return Some((from, Vec::new()));
        }
        let pos = (from.as_u64() - self.log_start.as_u64()) as usize;
        Some((from, self.log[pos..].to_vec()))
    }

    /// Drop in-memory entries up to and including `index` after they were
    /// captured in a snapshot. `term` is the term of the entry at `index`.
    pub fn compact_through(&mut self, index: LogIndex, term: Term) {
        if index < self.log_start || index > self.last_log_index() {
            return;
        }
        let keep_from = (index.as_u64() - self.log_start.as_u64() + 1) as usize;
        self.log.drain(..keep_from);
        self.log_start = index.next();
        self.snapshot_term = term;
        debug!(
            node_id = %self.config.node_id,
            through = %index,
            retained = self.log.len(),
            "compacted in-memory log"
        );
    }

    fn majority(&self) -> usize {
        (self.config.peers.len() + 2) / 2
    }

    fn mark_unpersisted(&mut self, index: LogIndex) {
        self.unpersisted_from = Some(match self.unpersisted_from {
            Some(existing) if existing <= index => existing,
            _ => index,
        });
    }

    fn handle_request_vote(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> RaftMessage {
        if term > self.current_term {
            info!(
                node_id = %self.config.node_id,
                old_term = %self.current_term,
                new_term = %term,
                "stepping down due to higher term in RequestVote"
            );
            self.step_down(term);
        }

        let vote_granted = if term < self.current_term {
            debug!(
                node_id = %self.config.node_id,
                candidate_id = %candidate_id,
                "rejecting vote: candidate term {} < current term {}",
                term.as_u64(),
                self.current_term.as_u64()
            );
            false
        } else if let Some(voted_for) = self.voted_for {
            voted_for == candidate_id
        } else if !self.is_log_up_to_date(last_log_index, last_log_term) {
            debug!(
                node_id = %self.config.node_id,
                candidate_id = %candidate_id,
                "rejecting vote: candidate log is not up to date"
            );
            false
        } else {
            info!(
                node_id = %self.config.node_id,
                candidate_id = %candidate_id,
                term = %self.current_term,
                "granting vote"
            );
            self.voted_for = Some(candidate_id);
            true
        };

        RaftMessage::RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    fn handle_vote_response(
        &mut self,
        from: NodeId,
        term: Term,
        vote_granted: bool,
    ) -> Vec<(NodeId, RaftMessage)> {
        if self.state != RaftState::Candidate {
            return Vec::new();
        }
        if term > self.current_term {
            info!(
                node_id = %self.config.node_id,
                old_term = %self.current_term,
                new_term = %term,
                "stepping down due to higher term in vote response"
            );
            self.step_down(term);
            return Vec::new();
        }

        if vote_granted {
            self.votes_received.insert(from);
        }
        if self.votes_received.len() >= self.majority() {
            return self.become_leader();
        }
        Vec::new()
    }

    fn become_leader(&mut self) -> Vec<(NodeId, RaftMessage)> {
        info!(
            node_id = %self.config.node_id,
            term = %self.current_term,
            votes = self.votes_received.len(),
            "won election, becoming Leader"
        );

        self.state = RaftState::Leader;
        self.current_leader = Some(self.config.node_id);
        let next = self.last_log_index().next();
        for peer in &self.config.peers {
            self.next_index.insert(*peer, next);
            self.match_index.insert(*peer, LogIndex::ZERO);
        }

        self.config
            .peers
            .iter()
            .map(|peer| (*peer, self.build_append_entries(*peer)))
            .collect()
    }

    fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> RaftMessage {
        if term > self.current_term {
            info!(
                node_id = %self.config.node_id,
                old_term = %self.current_term,
                new_term = %term,
                "stepping down due to higher term in AppendEntries"
            );
            self.step_down(term);
        }

        if term < self.current_term {
            return RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: self.last_log_index(),
            };
        }

        if self.state == RaftState::Candidate {
            debug!(
                node_id = %self.config.node_id,
                leader_id = %leader_id,
                "becoming follower after AppendEntries from elected leader"
            );
            self.state = RaftState::Follower;
        }
        self.current_leader = Some(leader_id);

        // Entries below log_start were compacted after commit and cannot
        // conflict, so only a determinable mismatch rejects.
        let prev_ok = match self.term_at(prev_log_index) {
            Some(t) => t == prev_log_term,
            None if prev_log_index < self.log_start => true,
            None => false,
        };
        if !prev_ok {
            debug!(
                node_id = %self.config.node_id,
                prev_log_index = %prev_log_index,
                expected_term = %prev_log_term,
                "rejecting AppendEntries: prev entry mismatch"
            );
            self.truncate_log_from(prev_log_index);
            return RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: self.last_log_index(),
            };
        }

        for entry in entries {
            if entry.index < self.log_start {
                continue;
            }
            let pos = (entry.index.as_u64() - self.log_start.as_u64()) as usize;
            if pos < self.log.len() {
                if self.log[pos].term != entry.term {
                    self.log.truncate(pos);
                    self.mark_unpersisted(entry.index);
                    self.log.push(entry);
                }
            } else {
                self.mark_unpersisted(entry.index);
                self.log.push(entry);
            }
        }

        if leader_commit > self.commit_index {
            let new_commit = std::cmp::min(leader_commit, self.last_log_index());
            if new_commit > self.commit_index {
                debug!(
                    node_id = %self.config.node_id,
                    old_commit = %self.commit_index,
                    new_commit = %new_commit,
                    "advancing commit index"
                );
                self.commit_index = new_commit;
            }
        }

        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: self.last_log_index(),
        }
    }

    fn handle_append_response(
        &mut self,
        from: NodeId,
        term: Term,
        success: bool,
        match_index: LogIndex,
    ) -> Vec<(NodeId, RaftMessage)> {
        if self.state != RaftState::Leader {
            return Vec::new();
        }
        if term > self.current_term {
            info!(
                node_id = %self.config.node_id,
                old_term = %self.current_term,
                new_term = %term,
                "stepping down due to higher term in AppendEntriesResponse"
            );
            self.step_down(term);
            return Vec::new();
        }

        if success {
            self.next_index.insert(from, match_index.next());
            self.match_index.insert(from, match_index);
            self.try_advance_commit();
            Vec::new()
        } else {
            // Back next_index off by one and retry right away.
            let next = self
                .next_index
                .get(&from)
                .copied()
                .unwrap_or_else(|| self.last_log_index().next());
            let backed = LogIndex::new(next.as_u64().saturating_sub(1).max(1));
            self.next_index.insert(from, backed);
            debug!(
                node_id = %self.config.node_id,
                from = %from,
                next_index = %backed,
                "follower rejected append, backing off"
            );
            vec![(from, self.build_append_entries(from))]
        }
    }

    fn handle_timeout_now(&mut self, term: Term, leader_id: NodeId) -> Vec<(NodeId, RaftMessage)> {
        if term < self.current_term || self.state == RaftState::Leader {
            return Vec::new();
        }
        info!(
            node_id = %self.config.node_id,
            from = %leader_id,
            "leadership handed over, campaigning immediately"
        );
        self.start_election()
    }

    /// Step down to follower for the given term.
    fn step_down(&mut self, term: Term) {
        self.current_term = term;
        self.state = RaftState::Follower;
        self.voted_for = None;
        self.current_leader = None;
    }

    /// Drop in-memory entries at `from` and above after a conflict.
    fn truncate_log_from(&mut self, from: LogIndex) {
        if from < self.log_start {
            return;
        }
        let pos = (from.as_u64() - self.log_start.as_u64()) as usize;
        if pos < self.log.len() {
            self.log.truncate(pos);
            self.mark_unpersisted(from);
        }
    }

    /// Build an AppendEntries message for a specific peer.
    fn build_append_entries(&self, peer: NodeId) -> RaftMessage {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or_else(|| self.last_log_index().next());
        // A peer behind the snapshot horizon re-syncs from the snapshot at
        // restart; send from the start of the retained log meanwhile.
        let next = if next < self.log_start {
            self.log_start
        } else {
            next
        };

        let prev_log_index = LogIndex::new(next.as_u64() - 1);
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(self.snapshot_term);
        let pos = (next.as_u64() - self.log_start.as_u64()) as usize;
        let entries = self.log.get(pos..).map(|s| s.to_vec()).unwrap_or_default();

        RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.config.node_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }
    }

    /// Check if a candidate's log is at least as up-to-date as this node's.
    fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let my_last_term = self.last_log_term();
        if last_log_term > my_last_term {
            true
        } else if last_log_term == my_last_term {
            last_log_index >= self.last_log_index()
        } else {
            false
        }
    }

    /// Advance the commit index to the highest current-term entry a quorum
    /// has replicated.
    fn try_advance_commit(&mut self) {
        if self.state != RaftState::Leader {
            return;
        }

        let last = self.last_log_index().as_u64();
        for n in (self.commit_index.as_u64() + 1)..=last {
            let idx = LogIndex::new(n);
            if self.term_at(idx) != Some(self.current_term) {
                continue;
            }

            let mut replicated = 1;
            for peer in &self.config.peers {
                if let Some(match_idx) = self.match_index.get(peer) {
                    if *match_idx >= idx {
                        replicated += 1;
                    }
                }
            }

            if replicated >= self.majority() {
                debug!(
                    node_id = %self.config.node_id,
                    index = %idx,
                    replicated = replicated,
                    "committing log entry"
                );
                self.commit_index = idx;
            }
        }
    }
}
