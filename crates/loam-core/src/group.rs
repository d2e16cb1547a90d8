//! A replication group: one consensus core, its durable log, and the state
//! machine it drives.
//!
//! All group state lives inside a single command loop task. Callers hold a
//! [`ReplicaGroup`] handle and talk to the loop through channels; local reads
//! bypass the loop entirely and go straight to the shared state machine.
//!
//! Proposals are acked once APPLIED, not merely committed, so a caller that
//! gets an ack can immediately observe its write through a local read on the
//! same node. Linearizable reads use the ReadIndex protocol: the read is
//! pinned at the leader's commit index, leadership is confirmed by a quorum
//! of heartbeat acks, and the reply waits until the apply position passes the
//! pinned index.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::consensus::{RaftConfig, RaftNode};
use crate::kvstore::Kv;
use crate::machine::{Query, QueryOutput, StateMachine};
use crate::raft_log::{HardState, RaftLogStore};
use crate::snapshot::SnapshotManager;
use crate::transport::{PeerMessage, RaftTransport};
use crate::types::{CoreError, GroupId, LogIndex, NodeId, RaftMessage, RaftState, Term};

const COMMAND_QUEUE_DEPTH: usize = 256;

/// Configuration for one replication group member.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Identifier of the group this member belongs to.
    pub group_id: GroupId,
    /// This member's node id.
    pub node_id: NodeId,
    /// The other members. Empty for a single-node group.
    pub peers: Vec<NodeId>,
    /// True when joining an existing cluster: wait for leader contact
    /// instead of self-electing at start.
    pub join: bool,
    /// Directory for the snapshot file; `None` for volatile groups.
    pub raft_dir: Option<PathBuf>,
    /// How long a proposal may wait for its applied ack.
    pub propose_timeout: Duration,
    /// How long a linearizable read may wait for quorum confirmation.
    pub read_timeout: Duration,
    /// Compact the log once it retains more entries than this. 0 disables.
    pub snapshot_threshold: u64,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,
    /// Leader heartbeat period.
    pub heartbeat_interval: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            group_id: GroupId::new(0),
            node_id: NodeId::new(1),
            peers: Vec::new(),
            join: false,
            raft_dir: None,
            propose_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            snapshot_threshold: 10_000,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

/// Point-in-time view of one group member.
#[derive(Debug, Clone)]
pub struct GroupStatus {
    /// Group identifier.
    pub group_id: GroupId,
    /// This member's node id.
    pub node_id: NodeId,
    /// Consensus role.
    pub state: RaftState,
    /// Current term.
    pub term: Term,
    /// Best known leader.
    pub leader: Option<NodeId>,
    /// Highest committed index.
    pub commit_index: LogIndex,
    /// Highest applied index.
    pub applied_index: LogIndex,
    /// Entries retained in the durable log.
    pub retained_entries: usize,
}

enum Command {
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<LogIndex, CoreError>>,
    },
    ReadLinear {
        query: Query,
        reply: oneshot::Sender<Result<QueryOutput, CoreError>>,
    },
    TransferLeader {
        target: NodeId,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Status {
        reply: oneshot::Sender<GroupStatus>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

struct PendingRead {
    at_index: LogIndex,
    acks: HashSet<NodeId>,
    query: Query,
    reply: oneshot::Sender<Result<QueryOutput, CoreError>>,
}

/// Handle to a running replication group.
pub struct ReplicaGroup {
    group_id: GroupId,
    node_id: NodeId,
    cmd_tx: mpsc::Sender<Command>,
    machine: Arc<dyn StateMachine>,
    propose_timeout: Duration,
    read_timeout: Duration,
}

impl ReplicaGroup {
    /// Recovers durable state and starts the group loop.
    ///
    /// Recovery order: hard state, then snapshot (when the log no longer
    /// reaches back to the machine's applied index), then the retained log
    /// tail. Entries committed before the last shutdown are re-applied
    /// before the group serves its first command.
    pub fn spawn(
        config: GroupConfig,
        raft_kv: Arc<dyn Kv>,
        machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<ReplicaGroup, CoreError> {
        let log = RaftLogStore::new(raft_kv);
        let snapshots = SnapshotManager::new(config.raft_dir.clone(), config.snapshot_threshold);

        let hard = log.load_hard_state()?;
        let snap_meta = snapshots.recover(&log, machine.as_ref())?;
        let tail_from = snap_meta
            .map(|m| m.last_index.next())
            .unwrap_or(LogIndex::new(1));
        let entries = log.entries_from(tail_from)?;
        let applied = LogIndex::new(machine.applied_index()?);

        let mut node = RaftNode::new(RaftConfig {
            node_id: config.node_id,
            peers: config.peers.clone(),
            election_timeout_min_ms: config.election_timeout_min.as_millis() as u64,
            election_timeout_max_ms: config.election_timeout_max.as_millis() as u64,
            heartbeat_interval_ms: config.heartbeat_interval.as_millis() as u64,
        });
        node.restore(hard, entries, snap_meta, applied);

        let peer_rx = transport.subscribe(config.group_id, config.node_id);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let handle = ReplicaGroup {
            group_id: config.group_id,
            node_id: config.node_id,
            cmd_tx,
            machine: Arc::clone(&machine),
            propose_timeout: config.propose_timeout,
            read_timeout: config.read_timeout,
        };

        let mut core = GroupCore {
            config,
            node,
            log,
            machine,
            transport,
            snapshots,
            last_persisted_hard: hard,
            term_floor: LogIndex::ZERO,
            was_leader: false,
            pending_acks: HashMap::new(),
            pending_reads: Vec::new(),
        };
        tokio::spawn(async move { core.run(cmd_rx, peer_rx).await });
        Ok(handle)
    }

    /// Group identifier.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// This member's node id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Proposes opaque bytes and waits until they are applied on this node.
    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Propose { data, reply: tx })
            .await
            .map_err(|_| CoreError::Cancelled)?;
        match tokio::time::timeout(self.propose_timeout, rx).await {
            Err(_) => Err(CoreError::ReplicationTimeout),
            Ok(Err(_)) => Err(CoreError::Cancelled),
            Ok(Ok(result)) => result,
        }
    }

    /// Reads from the local state machine without consulting the group.
    pub fn read_local(&self, query: &Query) -> Result<QueryOutput, CoreError> {
        self.machine.lookup(query)
    }

    /// Linearizable read: served by the leader after confirming leadership
    /// with a quorum and waiting for the apply position to pass the read's
    /// pinned commit index.
    pub async fn read_linear(&self, query: Query) -> Result<QueryOutput, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReadLinear { query, reply: tx })
            .await
            .map_err(|_| CoreError::Cancelled)?;
        match tokio::time::timeout(self.read_timeout, rx).await {
            Err(_) => Err(CoreError::ReplicationTimeout),
            Ok(Err(_)) => Err(CoreError::Cancelled),
            Ok(Ok(result)) => result,
        }
    }

    /// Asks the leader to hand leadership to `target`.
    pub async fn transfer_leader(&self, target: NodeId) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::TransferLeader { target, reply: tx })
            .await
            .map_err(|_| CoreError::Cancelled)?;
        rx.await.map_err(|_| CoreError::Cancelled)?
    }

    /// Current consensus status of this member.
    pub async fn status(&self) -> Result<GroupStatus, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { reply: tx })
            .await
            .map_err(|_| CoreError::Cancelled)?;
        rx.await.map_err(|_| CoreError::Cancelled)
    }

    /// Stops the loop after flushing durable state. Pending operations fail
    /// with [`CoreError::Cancelled`].
    pub async fn stop(&self) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop { reply: tx })
            .await
            .map_err(|_| CoreError::Cancelled)?;
        rx.await.map_err(|_| CoreError::Cancelled)
    }
}

struct GroupCore {
    config: GroupConfig,
    node: RaftNode,
    log: RaftLogStore,
    machine: Arc<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,
    snapshots: SnapshotManager,
    last_persisted_hard: HardState,
    // First index of the current leadership term's marker entry. Reads are
    // pinned at or past it so a fresh leader cannot serve a stale commit
    // index inherited from an earlier term.
    term_floor: LogIndex,
    was_leader: bool,
    pending_acks: HashMap<u64, oneshot::Sender<Result<LogIndex, CoreError>>>,
    pending_reads: Vec<PendingRead>,
}

impl GroupCore {
    async fn run(
        &mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut peer_rx: mpsc::Receiver<PeerMessage>,
    ) {
        info!(
            group_id = %self.config.group_id,
            node_id = %self.config.node_id,
            peers = self.config.peers.len(),
            "replication group started"
        );

        // Catch up on entries committed before the last shutdown.
        if let Err(e) = self.apply_committed() {
            self.fatal(e);
            return;
        }

        if self.config.peers.is_empty() && !self.config.join {
            let msgs = self.node.start_election();
            if let Err(e) = self.progress(msgs) {
                self.fatal(e);
                return;
            }
        }

        // Kept alive so a detached receiver never yields and busy-loops.
        let mut detached_tx = None;
        let mut ticker = interval(self.config.heartbeat_interval);
        let mut election_deadline = Instant::now() + self.random_election_timeout();
        let mut stop_reply = None;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => break,
                    Some(Command::Stop { reply }) => {
                        stop_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd) {
                            self.fatal(e);
                            return;
                        }
                    }
                },
                msg = peer_rx.recv() => match msg {
                    Some(pm) => match self.handle_peer(pm) {
                        Ok(true) => {
                            election_deadline = Instant::now() + self.random_election_timeout();
                        }
                        Ok(false) => {}
                        Err(e) => {
                            self.fatal(e);
                            return;
                        }
                    },
                    None => {
                        warn!(
                            group_id = %self.config.group_id,
                            node_id = %self.config.node_id,
                            "peer message stream closed"
                        );
                        let (tx, rx) = mpsc::channel(1);
                        detached_tx = Some(tx);
                        peer_rx = rx;
                    }
                },
                _ = ticker.tick() => {
                    let result = if self.node.is_leader() {
                        let msgs = self.node.heartbeat();
                        self.progress(msgs)
                    } else if !self.config.peers.is_empty()
                        && Instant::now() >= election_deadline
                    {
                        debug!(
                            group_id = %self.config.group_id,
                            node_id = %self.config.node_id,
                            term = %self.node.current_term(),
                            "election timeout"
                        );
                        election_deadline = Instant::now() + self.random_election_timeout();
                        let msgs = self.node.start_election();
                        self.progress(msgs)
                    } else {
                        Ok(())
                    };
                    if let Err(e) = result {
                        self.fatal(e);
                        return;
                    }
                }
            }
        }

        drop(detached_tx);
        self.cleanup();
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
        info!(
            group_id = %self.config.group_id,
            node_id = %self.config.node_id,
            "replication group stopped"
        );
    }

    fn handle_command(&mut self, cmd: Command) -> Result<(), CoreError> {
        match cmd {
            Command::Propose { data, reply } => match self.node.propose(data) {
                Ok((index, msgs)) => {
                    self.pending_acks.insert(index.as_u64(), reply);
                    self.progress(msgs)?;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::ReadLinear { query, reply } => {
                if !self.node.is_leader() {
                    let _ = reply.send(Err(CoreError::NotLeader {
                        leader_hint: self.node.leader_hint(),
                    }));
                    return Ok(());
                }
                let at_index = self.node.commit_index().max(self.term_floor);
                let mut acks = HashSet::new();
                acks.insert(self.config.node_id);
                self.pending_reads.push(PendingRead {
                    at_index,
                    acks,
                    query,
                    reply,
                });
                // Fresh heartbeat round confirms we still lead.
                let msgs = self.node.heartbeat();
                self.send_all(msgs);
                self.release_reads();
            }
            Command::TransferLeader { target, reply } => {
                match self.node.transfer_leadership(target) {
                    Ok(msgs) => {
                        self.send_all(msgs);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Stop { .. } => unreachable!("handled by the run loop"),
        }
        Ok(())
    }

    /// Steps one peer message through consensus. Returns true when the
    /// election timer should reset, which is when we accepted the sender's
    /// authority (successful append or granted vote).
    fn handle_peer(&mut self, pm: PeerMessage) -> Result<bool, CoreError> {
        let from = pm.from;
        // Success acks double as ReadIndex leadership confirmations.
        let read_ack = match &pm.msg {
            RaftMessage::AppendEntriesResponse {
                term,
                success: true,
                match_index,
            } => Some((*term, *match_index)),
            _ => None,
        };

        let outs = self.node.step(from, pm.msg);
        let accepted = outs.iter().any(|(_, m)| {
            matches!(
                m,
                RaftMessage::AppendEntriesResponse { success: true, .. }
                    | RaftMessage::RequestVoteResponse {
                        vote_granted: true,
                        ..
                    }
            )
        });
        self.progress(outs)?;

        if let Some((term, match_index)) = read_ack {
            if self.node.is_leader() && term == self.node.current_term() {
                let mut changed = false;
                for read in &mut self.pending_reads {
                    if match_index >= read.at_index && read.acks.insert(from) {
                        changed = true;
                    }
                }
                if changed {
                    self.release_reads();
                }
            }
        }
        Ok(accepted)
    }

    /// Persists consensus state, sends outbound messages, applies whatever
    /// became committed, and settles acks and reads. Every path that stepped
    /// the node funnels through here.
    fn progress(&mut self, mut msgs: Vec<(NodeId, RaftMessage)>) -> Result<(), CoreError> {
        if self.node.is_leader() && !self.was_leader {
            // A marker entry makes everything inherited from earlier terms
            // committable in this term and floors linearizable reads.
            let (index, more) = self.node.propose(Vec::new())?;
            self.term_floor = index;
            msgs.extend(more);
            info!(
                group_id = %self.config.group_id,
                node_id = %self.config.node_id,
                term = %self.node.current_term(),
                "became leader"
            );
        }
        self.was_leader = self.node.is_leader();

        self.persist()?;
        self.send_all(msgs);
        self.apply_committed()?;
        if !self.node.is_leader() {
            self.fail_leader_dependent();
        }
        self.release_reads();
        self.maybe_compact()?;
        Ok(())
    }

    /// Durable state goes down before any message goes out.
    fn persist(&mut self) -> Result<(), CoreError> {
        if let Some((from, entries)) = self.node.take_unpersisted() {
            self.log.truncate_from(from)?;
            self.log.append_many(&entries)?;
        }
        let hard = self.node.hard_state();
        if hard != self.last_persisted_hard {
            self.log.save_hard_state(&hard)?;
            self.last_persisted_hard = hard;
        }
        Ok(())
    }

    fn send_all(&self, msgs: Vec<(NodeId, RaftMessage)>) {
        for (to, msg) in msgs {
            self.transport.send(
                self.config.group_id,
                to,
                PeerMessage {
                    from: self.config.node_id,
                    msg,
                },
            );
        }
    }

    /// Applies committed entries one at a time so each waiter receives its
    /// own proposal's outcome. Storage errors are fatal for the group;
    /// anything else is a deterministic per-proposal rejection.
    fn apply_committed(&mut self) -> Result<(), CoreError> {
        for entry in self.node.take_committed() {
            // Leadership markers carry no proposal.
            if entry.data.is_empty() {
                continue;
            }
            let index = entry.index;
            match self.machine.update(std::slice::from_ref(&entry)) {
                Ok(()) => {
                    if let Some(reply) = self.pending_acks.remove(&index.as_u64()) {
                        let _ = reply.send(Ok(index));
                    }
                }
                Err(e @ (CoreError::Io(_) | CoreError::Corrupt(_))) => return Err(e),
                Err(e) => {
                    warn!(
                        group_id = %self.config.group_id,
                        index = %index,
                        error = %e,
                        "proposal rejected by state machine"
                    );
                    if let Some(reply) = self.pending_acks.remove(&index.as_u64()) {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
        Ok(())
    }

    fn release_reads(&mut self) {
        if self.pending_reads.is_empty() || !self.node.is_leader() {
            return;
        }
        let majority = self.majority();
        let applied = self.node.last_applied();
        let mut remaining = Vec::new();
        for read in std::mem::take(&mut self.pending_reads) {
            if read.acks.len() >= majority && applied >= read.at_index {
                let result = self.machine.lookup(&read.query);
                let _ = read.reply.send(result);
            } else {
                remaining.push(read);
            }
        }
        self.pending_reads = remaining;
    }

    fn fail_leader_dependent(&mut self) {
        if self.pending_acks.is_empty() && self.pending_reads.is_empty() {
            return;
        }
        let hint = self.node.leader_hint();
        warn!(
            group_id = %self.config.group_id,
            proposals = self.pending_acks.len(),
            reads = self.pending_reads.len(),
            "failing pending operations after leadership loss"
        );
        for (_, reply) in self.pending_acks.drain() {
            let _ = reply.send(Err(CoreError::NotLeader { leader_hint: hint }));
        }
        for read in std::mem::take(&mut self.pending_reads) {
            let _ = read.reply.send(Err(CoreError::NotLeader { leader_hint: hint }));
        }
    }

    fn maybe_compact(&mut self) -> Result<(), CoreError> {
        if !self.snapshots.due(&self.log)? {
            return Ok(());
        }
        self.snapshots
            .take(&mut self.node, &self.log, self.machine.as_ref())?;
        Ok(())
    }

    fn majority(&self) -> usize {
        (self.config.peers.len() + 2) / 2
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    fn status(&self) -> GroupStatus {
        GroupStatus {
            group_id: self.config.group_id,
            node_id: self.config.node_id,
            state: self.node.state(),
            term: self.node.current_term(),
            leader: self.node.leader_hint(),
            commit_index: self.node.commit_index(),
            applied_index: self.node.last_applied(),
            retained_entries: self.log.entry_count().unwrap_or(0),
        }
    }

    fn fatal(&mut self, err: CoreError) {
        error!(
            group_id = %self.config.group_id,
            node_id = %self.config.node_id,
            error = %err,
            "replication group failed"
        );
        for (_, reply) in self.pending_acks.drain() {
            let _ = reply.send(Err(CoreError::Cancelled));
        }
        for read in std::mem::take(&mut self.pending_reads) {
            let _ = read.reply.send(Err(CoreError::Cancelled));
        }
    }

    fn cleanup(&mut self) {
        for (_, reply) in self.pending_acks.drain() {
            let _ = reply.send(Err(CoreError::Cancelled));
        }
        for read in std::mem::take(&mut self.pending_reads) {
            let _ = read.reply.send(Err(CoreError::Cancelled));
        }
        if let Err(e) = self.persist() {
            error!(group_id = %self.config.group_id, error = %e, "final persist failed");
        }
        if let Err(e) = self.machine.sync() {
            error!(group_id = %self.config.group_id, error = %e, "state machine sync failed");
        }
        if let Err(e) = self.log.sync() {
            error!(group_id = %self.config.group_id, error = %e, "log sync failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use loam_model::codec;
    use loam_model::server::Server;

    use crate::entity_machine::EntityMachine;
    use crate::kvstore::MemoryKv;
    use crate::machine::Proposal;
    use crate::transport::LoopbackTransport;

    fn server_proposal(id: u64) -> Vec<u8> {
        let record = Server {
            id,
            ..Server::default()
        };
        Proposal::update(codec::to_bytes(&record).unwrap())
            .encode()
            .unwrap()
    }

    fn decode_server(out: QueryOutput) -> Server {
        match out {
            QueryOutput::Value(Some(bytes)) => codec::from_bytes(&bytes).unwrap(),
            other => panic!("expected a stored record, got {:?}", other),
        }
    }

    fn spawn_single(
        raft_kv: Arc<MemoryKv>,
        sm_kv: Arc<MemoryKv>,
        join: bool,
    ) -> ReplicaGroup {
        let config = GroupConfig {
            group_id: GroupId::new(7),
            propose_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            join,
            ..GroupConfig::default()
        };
        let machine: Arc<dyn StateMachine> = Arc::new(EntityMachine::<Server>::new(sm_kv));
        ReplicaGroup::spawn(
            config,
            raft_kv,
            machine,
            Arc::new(LoopbackTransport::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_node_propose_then_read_local() {
        let group = spawn_single(Arc::new(MemoryKv::new()), Arc::new(MemoryKv::new()), false);

        let index = group.propose(server_proposal(42)).await.unwrap();
        assert!(index.as_u64() > 0);

        let record = decode_server(group.read_local(&Query::Point(42)).unwrap());
        assert_eq!(record.id, 42);
    }

    #[tokio::test]
    async fn test_single_node_linear_read() {
        let group = spawn_single(Arc::new(MemoryKv::new()), Arc::new(MemoryKv::new()), false);
        group.propose(server_proposal(9)).await.unwrap();

        let record = decode_server(group.read_linear(Query::Point(9)).await.unwrap());
        assert_eq!(record.id, 9);
    }

    #[tokio::test]
    async fn test_joining_node_rejects_writes_and_linear_reads() {
        let group = spawn_single(Arc::new(MemoryKv::new()), Arc::new(MemoryKv::new()), true);

        let err = group.propose(server_proposal(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::NotLeader { .. }));
        let err = group.read_linear(Query::Point(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn test_status_reports_leadership() {
        let group = spawn_single(Arc::new(MemoryKv::new()), Arc::new(MemoryKv::new()), false);
        group.propose(server_proposal(1)).await.unwrap();

        let status = group.status().await.unwrap();
        assert_eq!(status.state, RaftState::Leader);
        assert_eq!(status.leader, Some(NodeId::new(1)));
        assert_eq!(status.commit_index, status.applied_index);
        assert!(status.applied_index.as_u64() >= 2);
    }

    #[tokio::test]
    async fn test_restart_recovers_applied_state() {
        let raft_kv = Arc::new(MemoryKv::new());
        let sm_kv = Arc::new(MemoryKv::new());

        let group = spawn_single(Arc::clone(&raft_kv), Arc::clone(&sm_kv), false);
        for id in 1..=3 {
            group.propose(server_proposal(id)).await.unwrap();
        }
        group.stop().await.unwrap();

        let restarted = spawn_single(raft_kv, sm_kv, false);
        for id in 1..=3 {
            let record = decode_server(restarted.read_local(&Query::Point(id)).unwrap());
            assert_eq!(record.id, id);
        }
        // The restarted node accepts new writes.
        restarted.propose(server_proposal(4)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_later_commands() {
        let group = spawn_single(Arc::new(MemoryKv::new()), Arc::new(MemoryKv::new()), false);
        group.stop().await.unwrap();

        let err = group.propose(server_proposal(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_rejected_proposal_reports_machine_error() {
        // An event log refuses deletes; the waiter sees that exact error.
        let config = GroupConfig {
            group_id: GroupId::new(3),
            propose_timeout: Duration::from_secs(2),
            ..GroupConfig::default()
        };
        let machine: Arc<dyn StateMachine> = Arc::new(crate::event_machine::EventLogMachine::new(
            Arc::new(MemoryKv::new()),
        ));
        let group = ReplicaGroup::spawn(
            config,
            Arc::new(MemoryKv::new()),
            machine,
            Arc::new(LoopbackTransport::new()),
        )
        .unwrap();

        let err = group
            .propose(Proposal::delete(5).encode().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Immutable));
    }

    fn cluster_config(node: u64, peers: &[u64]) -> GroupConfig {
        GroupConfig {
            group_id: GroupId::new(11),
            node_id: NodeId::new(node),
            peers: peers.iter().map(|p| NodeId::new(*p)).collect(),
            propose_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            ..GroupConfig::default()
        }
    }

    async fn await_leader(groups: &[ReplicaGroup]) -> usize {
        for _ in 0..250 {
            for (i, g) in groups.iter().enumerate() {
                if let Ok(status) = g.status().await {
                    if status.state == RaftState::Leader {
                        return i;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader elected");
    }

    fn spawn_cluster(
        transport: &Arc<LoopbackTransport>,
        machines: &[Arc<dyn StateMachine>; 3],
    ) -> Vec<ReplicaGroup> {
        let ids = [1u64, 2, 3];
        ids.iter()
            .map(|id| {
                let peers: Vec<u64> = ids.iter().copied().filter(|p| p != id).collect();
                let machine = Arc::clone(&machines[(*id - 1) as usize]);
                ReplicaGroup::spawn(
                    cluster_config(*id, &peers),
                    Arc::new(MemoryKv::new()),
                    machine,
                    Arc::clone(transport) as Arc<dyn RaftTransport>,
                )
                .unwrap()
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_node_cluster_replicates_writes() {
        let transport = Arc::new(LoopbackTransport::new());
        let machines: [Arc<dyn StateMachine>; 3] = [
            Arc::new(EntityMachine::<Server>::new(Arc::new(MemoryKv::new()))),
            Arc::new(EntityMachine::<Server>::new(Arc::new(MemoryKv::new()))),
            Arc::new(EntityMachine::<Server>::new(Arc::new(MemoryKv::new()))),
        ];
        let groups = spawn_cluster(&transport, &machines);

        let leader = await_leader(&groups).await;
        groups[leader].propose(server_proposal(77)).await.unwrap();

        // Followers converge on the applied write.
        let mut replicated = false;
        'outer: for _ in 0..250 {
            for g in &groups {
                if let QueryOutput::Value(None) = g.read_local(&Query::Point(77)).unwrap() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    continue 'outer;
                }
            }
            replicated = true;
            break;
        }
        assert!(replicated, "write did not reach every member");

        let record = decode_server(
            groups[leader]
                .read_linear(Query::Point(77))
                .await
                .unwrap(),
        );
        assert_eq!(record.id, 77);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_leader_transfer_moves_leadership() {
        let transport = Arc::new(LoopbackTransport::new());
        let machines: [Arc<dyn StateMachine>; 3] = [
            Arc::new(EntityMachine::<Server>::new(Arc::new(MemoryKv::new()))),
            Arc::new(EntityMachine::<Server>::new(Arc::new(MemoryKv::new()))),
            Arc::new(EntityMachine::<Server>::new(Arc::new(MemoryKv::new()))),
        ];
        let groups = spawn_cluster(&transport, &machines);

        let leader = await_leader(&groups).await;
        groups[leader].propose(server_proposal(1)).await.unwrap();

        let target = (leader + 1) % 3;
        let target_id = NodeId::new(target as u64 + 1);
        // The target must be caught up before the transfer is accepted.
        for _ in 0..250 {
            if groups[leader].transfer_leader(target_id).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for _ in 0..250 {
            if let Ok(status) = groups[target].status().await {
                if status.state == RaftState::Leader {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("leadership did not move to the transfer target");
    }
}
