//! Shared fixtures for the end-to-end store scenarios.

use std::path::Path;
use std::sync::Arc;

use loam_core::config::NodeConfig;
use loam_core::dao::{Dao, GroupTopology};
use loam_core::host::GroupHost;
use loam_core::transport::LoopbackTransport;
use loam_model::farm::{
    Channel, Condition, Device, Farm, Metric, Schedule, Setting, Workflow, WorkflowStep,
};

/// Store family over a fresh in-memory host.
pub fn memory_dao() -> Dao {
    let host = GroupHost::new(NodeConfig::default(), Arc::new(LoopbackTransport::new()))
        .expect("in-memory host");
    Dao::open(host, GroupTopology::default()).expect("store family")
}

/// Store family over a disk-backed host rooted at `dir`. The host is
/// returned so a test can shut it down and reopen the same directory.
pub fn disk_dao(dir: &Path) -> (Arc<GroupHost>, Dao) {
    let config = NodeConfig {
        data_dir: Some(dir.to_path_buf()),
        ..NodeConfig::default()
    };
    let host = GroupHost::new(config, Arc::new(LoopbackTransport::new())).expect("disk host");
    let dao = Dao::open(Arc::clone(&host), GroupTopology::default()).expect("store family");
    (host, dao)
}

/// A two-device farm tree with no identifier assigned anywhere, the shape a
/// fresh configuration arrives in.
pub fn farm_fixture(name: &str) -> Farm {
    Farm {
        name: name.to_string(),
        mode: "auto".to_string(),
        interval: 60,
        devices: vec![
            Device {
                device_type: "thermostat".to_string(),
                metrics: vec![Metric {
                    key: "temp".to_string(),
                    unit: "F".to_string(),
                    ..Metric::default()
                }],
                channels: vec![
                    Channel {
                        name: "heater".to_string(),
                        conditions: vec![Condition {
                            metric_key: "temp".to_string(),
                            comparison: "below".to_string(),
                            threshold: 65.0,
                            value: 1,
                            enabled: true,
                            ..Condition::default()
                        }],
                        ..Channel::default()
                    },
                    Channel {
                        name: "fan".to_string(),
                        schedules: vec![Schedule {
                            start: "10:00".to_string(),
                            stop: "18:00".to_string(),
                            value: 1,
                            enabled: true,
                            ..Schedule::default()
                        }],
                        ..Channel::default()
                    },
                ],
                ..Device::default()
            },
            Device {
                device_type: "doser".to_string(),
                interval: 15,
                settings: vec![Setting {
                    key: "pump".to_string(),
                    value: "primary".to_string(),
                    ..Setting::default()
                }],
                metrics: vec![Metric {
                    key: "ph".to_string(),
                    unit: "pH".to_string(),
                    ..Metric::default()
                }],
                channels: vec![Channel {
                    name: "acid".to_string(),
                    ..Channel::default()
                }],
                ..Device::default()
            },
        ],
        workflows: vec![Workflow {
            name: "morning".to_string(),
            steps: vec![
                WorkflowStep {
                    name: "lights".to_string(),
                    sort_order: 20,
                    action: "on".to_string(),
                    ..WorkflowStep::default()
                },
                WorkflowStep {
                    name: "vents".to_string(),
                    sort_order: 10,
                    action: "open".to_string(),
                    ..WorkflowStep::default()
                },
            ],
            ..Workflow::default()
        }],
        ..Farm::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_model::ConsistencyLevel;

    #[test]
    fn test_fixture_tree_is_unkeyed() {
        let farm = farm_fixture("Test Farm");
        assert!(farm.id.is_zero());
        for device in &farm.devices {
            assert!(device.id.is_zero());
            for metric in &device.metrics {
                assert!(metric.id.is_zero());
            }
            for channel in &device.channels {
                assert!(channel.id.is_zero());
            }
        }
        for workflow in &farm.workflows {
            assert_eq!(workflow.id, 0);
        }
    }

    #[tokio::test]
    async fn test_memory_family_opens() {
        let dao = memory_dao();
        let server = dao.servers.get(ConsistencyLevel::Local).await.unwrap();
        assert!(server.farm_refs.is_empty());
    }

    #[tokio::test]
    async fn test_disk_family_opens() {
        let dir = tempfile::tempdir().unwrap();
        let (host, dao) = disk_dao(dir.path());
        let server = dao.servers.get(ConsistencyLevel::Local).await.unwrap();
        assert!(server.farm_refs.is_empty());
        host.shutdown().await;
    }
}
