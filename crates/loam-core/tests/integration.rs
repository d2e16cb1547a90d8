//! End-to-end scenarios over the full store family.
//!
//! Every test drives the public DAO surface only, the way an embedding
//! server would: sign-ups, membership grants, farm configuration, telemetry
//! history, and recovery from disk.

mod common;

use std::collections::HashMap;

use common::{disk_dao, farm_fixture, memory_dao};

use loam_core::permissions::Permission;
use loam_core::CoreError;
use loam_model::events::EventLogEntry;
use loam_model::state::DeviceStateMap;
use loam_model::user::{Registration, Role, User};
use loam_model::ConsistencyLevel;

#[tokio::test]
async fn test_signup_grant_and_revoke_lifecycle() {
    // A sign-up becomes an account, gets farm membership, loses it again.
    let dao = memory_dao();

    let mut registration = Registration::with_email("root@localhost");
    dao.registrations.save(&mut registration).await.unwrap();
    let user = dao.registrations.complete(&registration, "$ecret").await.unwrap();
    assert_eq!(user.id, User::id_for_email("root@localhost"));

    let mut farm = farm_fixture("Test Farm");
    dao.farms.save(&mut farm).await.unwrap();

    let role = Role::admin();
    let permission = Permission {
        farm_id: farm.id,
        user_id: user.id,
        role_id: role.id,
        ..Permission::default()
    };
    dao.permissions.save(&permission).await.unwrap();

    let member = dao
        .users
        .get(user.id.as_u64(), ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert!(member.farm_refs.contains(&farm.id));
    let farm = dao
        .farms
        .get(farm.id, ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert!(farm.has_user(user.id));

    let reachable = dao
        .farms
        .farms_by_user(user.id, ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert_eq!(reachable.len(), 1);
    assert_eq!(reachable[0].id, farm.id);

    dao.permissions.delete(&permission).await.unwrap();
    let member = dao
        .users
        .get(user.id.as_u64(), ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert!(member.farm_refs.is_empty());
    let farm = dao
        .farms
        .get(farm.id, ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert!(farm.users.is_empty());
}

#[tokio::test]
async fn test_farm_save_cascade_keys_and_indexes_tree() {
    // One save keys the whole tree, inherits intervals, indexes the farm.
    let dao = memory_dao();
    let mut farm = farm_fixture("Test Farm");
    dao.farms.save(&mut farm).await.unwrap();

    assert!(!farm.id.is_zero());
    for device in &farm.devices {
        assert!(!device.id.is_zero());
        assert_eq!(device.farm_id, farm.id);
        for setting in &device.settings {
            assert_ne!(setting.id, 0);
        }
        for metric in &device.metrics {
            assert!(!metric.id.is_zero());
        }
        for channel in &device.channels {
            assert!(!channel.id.is_zero());
            for condition in &channel.conditions {
                assert_ne!(condition.id, 0);
            }
            for schedule in &channel.schedules {
                assert_ne!(schedule.id, 0);
            }
        }
    }
    for workflow in &farm.workflows {
        assert_ne!(workflow.id, 0);
        for step in &workflow.steps {
            assert_ne!(step.id, 0);
        }
    }

    // The thermostat inherits the farm interval; the doser keeps its own.
    assert_eq!(farm.device_by_type("thermostat").unwrap().interval, 60);
    assert_eq!(farm.device_by_type("doser").unwrap().interval, 15);

    let server = dao.servers.get(ConsistencyLevel::Quorum).await.unwrap();
    assert!(server.farm_refs.contains(&farm.id));

    let stored = dao
        .farms
        .get(farm.id, ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert_eq!(stored, farm);

    // Traversals resolve against the keyed tree.
    let devices = dao
        .farms
        .devices_by_farm(farm.id, ConsistencyLevel::Local)
        .await
        .unwrap();
    assert_eq!(devices.len(), 2);
    let doser = farm.device_by_type("doser").unwrap();
    let metrics = dao
        .farms
        .metrics_by_device(doser.id, ConsistencyLevel::Local)
        .await
        .unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].key, "ph");

    let workflows = dao
        .farms
        .workflows_by_farm(farm.id, ConsistencyLevel::Local)
        .await
        .unwrap();
    let steps: Vec<&str> = workflows[0].steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(steps, vec!["vents", "lights"]);
}

#[tokio::test]
async fn test_event_history_pages_newest_first() {
    // 25 appended events, second page of ten, newest first.
    let dao = memory_dao();
    let mut farm = farm_fixture("Hillside");
    dao.farms.save(&mut farm).await.unwrap();

    for i in 0..25 {
        let event = EventLogEntry::new(farm.id, "state", "doser", &format!("event {}", i));
        dao.events.append(&event).await.unwrap();
    }

    let page = dao
        .events
        .page(farm.id, 2, 10, ConsistencyLevel::Local)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 10);
    assert!(page.has_more);
    assert_eq!(page.items[0].message, "event 14");
    assert_eq!(page.items[9].message, "event 5");

    let all = dao
        .events
        .get_all(farm.id, ConsistencyLevel::Local)
        .await
        .unwrap();
    assert_eq!(all.len(), 25);
    assert_eq!(all[0].message, "event 0");
    assert_eq!(all[24].message, "event 24");
}

#[tokio::test]
async fn test_device_metric_window_in_order() {
    // Three reports, one metric series back in order; absent keys fail.
    let dao = memory_dao();
    let mut farm = farm_fixture("Hillside");
    dao.farms.save(&mut farm).await.unwrap();
    let device_id = farm.device_by_type("doser").unwrap().id;

    for (i, value) in [12.34, 12.40, 12.45].into_iter().enumerate() {
        let state = DeviceStateMap {
            device_id,
            metrics: HashMap::from([("sensor1".to_string(), value)]),
            channels: vec![0],
            timestamp: 1_000 * (i as u64 + 1),
        };
        dao.device_data.save(&state).await.unwrap();
    }

    let series = dao
        .device_data
        .last_30_days(device_id, "sensor1", ConsistencyLevel::Quorum)
        .await
        .unwrap();
    assert_eq!(series, vec![12.34, 12.40, 12.45]);

    let err = dao
        .device_data
        .last_30_days(device_id, "missing", ConsistencyLevel::Quorum)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::MetricKeyNotFound { key } if key == "missing"));
}

#[tokio::test]
async fn test_family_survives_restart() {
    // Everything written before a shutdown reads back from disk.
    let dir = tempfile::tempdir().unwrap();
    let farm_id;
    let device_id;
    {
        let (host, dao) = disk_dao(dir.path());
        let mut farm = farm_fixture("Test Farm");
        dao.farms.save(&mut farm).await.unwrap();
        farm_id = farm.id;
        device_id = farm.device_by_type("thermostat").unwrap().id;

        let mut user = User::with_email("root@localhost");
        dao.users.save(&mut user).await.unwrap();

        let event = EventLogEntry::new(farm_id, "config", "thermostat", "installed");
        dao.events.append(&event).await.unwrap();

        let state = DeviceStateMap {
            device_id,
            metrics: HashMap::from([("temp".to_string(), 70.0)]),
            channels: vec![0, 1, 0],
            timestamp: 1_000,
        };
        dao.device_data.save(&state).await.unwrap();
        host.shutdown().await;
    }

    let (host, dao) = disk_dao(dir.path());
    let farm = dao.farms.get(farm_id, ConsistencyLevel::Local).await.unwrap();
    assert_eq!(farm.name, "Test Farm");
    dao.users
        .get_by_email("root@localhost", ConsistencyLevel::Local)
        .await
        .unwrap();
    let server = dao.servers.get(ConsistencyLevel::Local).await.unwrap();
    assert!(server.farm_refs.contains(&farm_id));

    let events = dao
        .events
        .get_all(farm_id, ConsistencyLevel::Local)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message, "installed");

    let series = dao
        .device_data
        .last_30_days(device_id, "temp", ConsistencyLevel::Local)
        .await
        .unwrap();
    assert_eq!(series, vec![70.0]);
    host.shutdown().await;
}
