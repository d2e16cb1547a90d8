//! Registry of the replication groups hosted on one node.
//!
//! Every group shares the node's id, transport, and timing configuration;
//! what varies per group is its identifier, membership, and the state
//! machine built by the caller's factory. Disk-backed hosts give each group
//! its own directory pair under `data_dir`:
//! `<data_dir>/<group_id>/sm` for the state machine's store and
//! `<data_dir>/<group_id>/raft` for the log, hard state, and snapshot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use loam_model::ConsistencyLevel;

use crate::config::NodeConfig;
use crate::diskstore::DiskKv;
use crate::group::{GroupConfig, GroupStatus, ReplicaGroup};
use crate::kvstore::{Kv, MemoryKv};
use crate::machine::{Query, QueryOutput, StateMachine};
use crate::transport::RaftTransport;
use crate::types::{CoreError, GroupId, LogIndex, NodeId};

const SM_DIR: &str = "sm";
const RAFT_DIR: &str = "raft";

/// Startup parameters for one group on this host.
#[derive(Debug, Clone)]
pub struct GroupParams {
    /// Group identifier, shared by every member.
    pub group_id: GroupId,
    /// The other members. Empty for a single-member group.
    pub peers: Vec<NodeId>,
    /// True when joining an existing cluster rather than bootstrapping.
    pub join: bool,
}

impl GroupParams {
    /// A single-member group bootstrapped by this node.
    pub fn solo(group_id: GroupId) -> Self {
        GroupParams {
            group_id,
            peers: Vec::new(),
            join: false,
        }
    }
}

/// Owns every replication group running in this process.
pub struct GroupHost {
    config: NodeConfig,
    transport: Arc<dyn RaftTransport>,
    groups: DashMap<GroupId, Arc<ReplicaGroup>>,
}

impl GroupHost {
    /// Creates an empty host. Groups are started individually so each gets
    /// the state machine its data calls for.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Arc<GroupHost>, CoreError> {
        config.validate()?;
        Ok(Arc::new(GroupHost {
            config,
            transport,
            groups: DashMap::new(),
        }))
    }

    /// This node's identifier.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// True while the group is running on this host.
    pub fn has_group(&self, group_id: GroupId) -> bool {
        self.groups.contains_key(&group_id)
    }

    /// Consistency applied when a caller does not choose one.
    pub fn default_consistency(&self) -> ConsistencyLevel {
        self.config.default_consistency
    }

    /// Starts a group, building its state machine over the group's own
    /// store. Fails when the group is already running on this host.
    pub fn start_group<F>(&self, params: GroupParams, factory: F) -> Result<(), CoreError>
    where
        F: FnOnce(Arc<dyn Kv>) -> Arc<dyn StateMachine>,
    {
        if self.groups.contains_key(&params.group_id) {
            return Err(CoreError::Config(format!(
                "group {} already started on this host",
                params.group_id
            )));
        }

        let (sm_kv, raft_kv, raft_dir): (Arc<dyn Kv>, Arc<dyn Kv>, Option<PathBuf>) =
            match &self.config.data_dir {
                Some(root) => {
                    let group_dir = root.join(params.group_id.to_string());
                    let raft_dir = group_dir.join(RAFT_DIR);
                    let sm = Arc::new(DiskKv::open(&group_dir.join(SM_DIR))?);
                    let raft = Arc::new(DiskKv::open(&raft_dir)?);
                    (sm, raft, Some(raft_dir))
                }
                None => (Arc::new(MemoryKv::new()), Arc::new(MemoryKv::new()), None),
            };
        let machine = factory(sm_kv);

        let group = ReplicaGroup::spawn(
            GroupConfig {
                group_id: params.group_id,
                node_id: self.config.node_id,
                peers: params.peers,
                join: params.join,
                raft_dir,
                propose_timeout: self.config.propose_timeout(),
                read_timeout: self.config.read_timeout(),
                snapshot_threshold: self.config.snapshot_threshold_entries,
                election_timeout_min: Duration::from_millis(self.config.election_timeout_min_ms),
                election_timeout_max: Duration::from_millis(self.config.election_timeout_max_ms),
                heartbeat_interval: Duration::from_millis(self.config.heartbeat_interval_ms),
            },
            raft_kv,
            machine,
            Arc::clone(&self.transport),
        )?;
        self.groups.insert(params.group_id, Arc::new(group));
        info!(
            group_id = %params.group_id,
            node_id = %self.config.node_id,
            "started replication group"
        );
        Ok(())
    }

    /// Stops a group and removes it from the registry.
    pub async fn stop_group(&self, group_id: GroupId) -> Result<(), CoreError> {
        let (_, group) = self
            .groups
            .remove(&group_id)
            .ok_or(CoreError::GroupNotFound(group_id))?;
        group.stop().await
    }

    /// Stops every group. Used at node shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<GroupId> = self.groups.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Err(e) = self.stop_group(id).await {
                tracing::warn!(group_id = %id, error = %e, "group shutdown failed");
            }
        }
    }

    fn group(&self, group_id: GroupId) -> Result<Arc<ReplicaGroup>, CoreError> {
        self.groups
            .get(&group_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(CoreError::GroupNotFound(group_id))
    }

    /// Replicates opaque bytes through a group and waits for the applied ack.
    pub async fn propose(&self, group_id: GroupId, data: Vec<u8>) -> Result<LogIndex, CoreError> {
        self.group(group_id)?.propose(data).await
    }

    /// Reads from a group at the requested consistency.
    pub async fn read(
        &self,
        group_id: GroupId,
        query: Query,
        level: ConsistencyLevel,
    ) -> Result<QueryOutput, CoreError> {
        let group = self.group(group_id)?;
        match level {
            ConsistencyLevel::Local => group.read_local(&query),
            ConsistencyLevel::Quorum => group.read_linear(query).await,
        }
    }

    /// Asks a group's leader to hand leadership to `target`.
    pub async fn transfer_leader(
        &self,
        group_id: GroupId,
        target: NodeId,
    ) -> Result<(), CoreError> {
        self.group(group_id)?.transfer_leader(target).await
    }

    /// Best known leader of a group, as seen by the local member.
    pub async fn leader_of(&self, group_id: GroupId) -> Result<Option<NodeId>, CoreError> {
        Ok(self.group(group_id)?.status().await?.leader)
    }

    /// Status of one group.
    pub async fn group_status(&self, group_id: GroupId) -> Result<GroupStatus, CoreError> {
        self.group(group_id)?.status().await
    }

    /// Status of every group on this host.
    pub async fn host_status(&self) -> Vec<GroupStatus> {
        let handles: Vec<Arc<ReplicaGroup>> =
            self.groups.iter().map(|e| Arc::clone(e.value())).collect();
        let mut statuses = Vec::with_capacity(handles.len());
        for group in handles {
            if let Ok(status) = group.status().await {
                statuses.push(status);
            }
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use loam_model::codec;
    use loam_model::server::Server;

    use crate::entity_machine::EntityMachine;
    use crate::machine::Proposal;
    use crate::transport::LoopbackTransport;
    use crate::types::RaftState;

    fn memory_host() -> Arc<GroupHost> {
        GroupHost::new(NodeConfig::default(), Arc::new(LoopbackTransport::new())).unwrap()
    }

    fn server_factory(kv: Arc<dyn Kv>) -> Arc<dyn StateMachine> {
        Arc::new(EntityMachine::<Server>::new(kv))
    }

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

    #[tokio::test]
    async fn test_start_propose_and_read() {
        let host = memory_host();
        let gid = GroupId::new(1);
        host.start_group(GroupParams::solo(gid), server_factory)
            .unwrap();

        host.propose(gid, server_proposal(5)).await.unwrap();

        let record = decode_server(
            host.read(gid, Query::Point(5), ConsistencyLevel::Local)
                .await
                .unwrap(),
        );
        assert_eq!(record.id, 5);

        let record = decode_server(
            host.read(gid, Query::Point(5), ConsistencyLevel::Quorum)
                .await
                .unwrap(),
        );
        assert_eq!(record.id, 5);
    }

    #[tokio::test]
    async fn test_unknown_group_is_an_error() {
        let host = memory_host();
        let gid = GroupId::new(99);

        let err = host.propose(gid, server_proposal(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::GroupNotFound(g) if g == gid));
        let err = host
            .read(gid, Query::Wildcard, ConsistencyLevel::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::GroupNotFound(_)));
        let err = host.stop_group(gid).await.unwrap_err();
        assert!(matches!(err, CoreError::GroupNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() {
        let host = memory_host();
        let gid = GroupId::new(4);
        host.start_group(GroupParams::solo(gid), server_factory)
            .unwrap();

        let err = host
            .start_group(GroupParams::solo(gid), server_factory)
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[tokio::test]
    async fn test_stopped_group_is_forgotten() {
        let host = memory_host();
        let gid = GroupId::new(2);
        host.start_group(GroupParams::solo(gid), server_factory)
            .unwrap();
        host.stop_group(gid).await.unwrap();

        let err = host.propose(gid, server_proposal(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::GroupNotFound(_)));
        // The id can be reused afterwards.
        host.start_group(GroupParams::solo(gid), server_factory)
            .unwrap();
    }

    #[tokio::test]
    async fn test_leader_of_solo_group_is_self() {
        let host = memory_host();
        let gid = GroupId::new(3);
        host.start_group(GroupParams::solo(gid), server_factory)
            .unwrap();
        host.propose(gid, server_proposal(1)).await.unwrap();

        assert_eq!(host.leader_of(gid).await.unwrap(), Some(host.node_id()));
        let status = host.group_status(gid).await.unwrap();
        assert_eq!(status.state, RaftState::Leader);
    }

    #[tokio::test]
    async fn test_host_status_covers_every_group() {
        let host = memory_host();
        for id in 1..=3u64 {
            host.start_group(GroupParams::solo(GroupId::new(id)), server_factory)
                .unwrap();
        }

        let statuses = host.host_status().await;
        assert_eq!(statuses.len(), 3);
        let mut ids: Vec<u64> = statuses.iter().map(|s| s.group_id.as_u64()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_disk_backed_group_survives_host_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..NodeConfig::default()
        };
        let gid = GroupId::new(12);

        let host = GroupHost::new(config.clone(), Arc::new(LoopbackTransport::new())).unwrap();
        host.start_group(GroupParams::solo(gid), server_factory)
            .unwrap();
        host.propose(gid, server_proposal(8)).await.unwrap();
        host.shutdown().await;

        assert!(dir.path().join(gid.to_string()).join(SM_DIR).is_dir());
        assert!(dir.path().join(gid.to_string()).join(RAFT_DIR).is_dir());

        let host = GroupHost::new(config, Arc::new(LoopbackTransport::new())).unwrap();
        host.start_group(GroupParams::solo(gid), server_factory)
            .unwrap();
        let record = decode_server(
            host.read(gid, Query::Point(8), ConsistencyLevel::Local)
                .await
                .unwrap(),
        );
        assert_eq!(record.id, 8);
    }
}
