//! Node-level configuration for the replication host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use loam_model::ConsistencyLevel;

use crate::types::{CoreError, NodeId};

/// Settings shared by every replication group hosted on one node.
///
/// Loaded from a `.toml` or `.json` file; every field falls back to its
/// default when absent, so a config file only needs the fields it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's identifier within every group it hosts.
    pub node_id: NodeId,
    /// Root directory for per-group state. `None` keeps all groups in
    /// memory, which only suits tests and throwaway deployments.
    pub data_dir: Option<PathBuf>,
    /// Deadline for a proposal's applied ack, in milliseconds.
    pub propose_timeout_ms: u64,
    /// Deadline for a linearizable read, in milliseconds.
    pub read_timeout_ms: u64,
    /// Log entries retained before compaction. 0 disables compaction.
    pub snapshot_threshold_entries: u64,
    /// Consistency applied when a request does not choose one.
    pub default_consistency: ConsistencyLevel,
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout, in milliseconds.
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat period, in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: NodeId::new(1),
            data_dir: None,
            propose_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
            snapshot_threshold_entries: 10_000,
            default_consistency: ConsistencyLevel::Local,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

impl NodeConfig {
    /// Loads a config file, dispatching on the file extension.
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?,
            other => {
                return Err(CoreError::Config(format!(
                    "unsupported config file extension: {:?}",
                    other
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects timing combinations consensus cannot run on.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_max_ms < self.election_timeout_min_ms
        {
            return Err(CoreError::Config(format!(
                "election timeout range {}..{} ms is invalid",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(CoreError::Config(format!(
                "heartbeat interval {} ms must be positive and below the \
                 election timeout minimum {} ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        Ok(())
    }

    /// Proposal deadline as a [`Duration`].
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    /// Linearizable read deadline as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
