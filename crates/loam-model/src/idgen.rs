//! Deterministic 64-bit identifier derivation.
//!
//! Every entity identifier is the first eight bytes of a BLAKE3 hash over a
//! stable string key, so identical input produces identical identifiers on
//! every node and across restarts. Replication-group identifiers for per-farm
//! resources are derived from the owning entity id plus a fixed label.

use tracing::debug;

use crate::farm::{Channel, Device, Farm};
use crate::ids::{ChannelId, DeviceId, FarmId, MetricId};

/// Label used to derive a farm's event-log replication group.
pub const EVENTS_LABEL: &str = "events";
/// Label used to derive a device's telemetry-history replication group.
pub const DATA_LABEL: &str = "data";
/// Label used to derive a farm's live-state replication group.
pub const STATE_LABEL: &str = "state";

/// Derives a 64-bit identifier from a stable string key.
///
/// Equal input strings yield equal identifiers in every process.
pub fn entity_id(s: &str) -> u64 {
    hash64(s.as_bytes())
}

/// Derives a dependent identifier from a base id and a label.
pub fn derive_id(base: u64, label: &str) -> u64 {
    let mut buf = Vec::with_capacity(8 + label.len());
    buf.extend_from_slice(&base.to_be_bytes());
    buf.extend_from_slice(label.as_bytes());
    hash64(&buf)
}

/// Replication-group id hosting a farm's event log.
pub fn event_log_group(farm_id: FarmId) -> u64 {
    derive_id(farm_id.as_u64(), EVENTS_LABEL)
}

/// Replication-group id hosting a device's telemetry history.
pub fn device_data_group(device_id: DeviceId) -> u64 {
    derive_id(device_id.as_u64(), DATA_LABEL)
}

/// Replication-group id hosting a farm's persisted live state.
pub fn farm_state_group(farm_id: FarmId) -> u64 {
    derive_id(farm_id.as_u64(), STATE_LABEL)
}

/// Encodes an identifier as a fixed-width big-endian key for the KV engine.
pub fn uint64_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Decodes a fixed-width big-endian key back into an identifier.
/// Returns None when the slice is not exactly eight bytes.
pub fn key_to_u64(key: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

fn hash64(input: &[u8]) -> u64 {
    let digest = blake3::hash(input);
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(arr)
}

/// Assigns identifiers to a farm and every nested entity that still has a
/// zero id, from stable string paths rooted at the farm name.
///
/// Already-assigned ids are left untouched, so the operation is idempotent on
/// a fully keyed tree. Parent references (`farm_id`, `device_id`) are always
/// refreshed to match the owning entity.
pub fn assign_farm_ids(farm: &mut Farm) {
    if farm.id.is_zero() {
        farm.id = FarmId::new(entity_id(&farm.name));
        debug!(farm_id = %farm.id, name = %farm.name, "assigned farm identifier");
    }
    let farm_name = farm.name.clone();
    for device in &mut farm.devices {
        assign_device_ids(&farm_name, farm.id, device);
    }
    for workflow in &mut farm.workflows {
        if workflow.id == 0 {
            workflow.id = entity_id(&format!("{}/workflow/{}", farm_name, workflow.name));
        }
        workflow.farm_id = farm.id;
        for (i, step) in workflow.steps.iter_mut().enumerate() {
            if step.id == 0 {
                step.id = entity_id(&format!(
                    "{}/workflow/{}/step/{}",
                    farm_name, workflow.name, i
                ));
            }
        }
    }
}

fn assign_device_ids(farm_name: &str, farm_id: FarmId, device: &mut Device) {
    let path = format!("{}/{}", farm_name, device.device_type);
    if device.id.is_zero() {
        device.id = DeviceId::new(entity_id(&path));
    }
    device.farm_id = farm_id;
    for setting in &mut device.settings {
        if setting.id == 0 {
            setting.id = entity_id(&format!("{}/setting/{}", path, setting.key));
        }
        setting.device_id = device.id;
    }
    for metric in &mut device.metrics {
        if metric.id.is_zero() {
            metric.id = MetricId::new(entity_id(&format!("{}/metric/{}", path, metric.key)));
        }
        metric.device_id = device.id;
    }
    for channel in &mut device.channels {
        assign_channel_ids(&path, device.id, channel);
    }
}

fn assign_channel_ids(device_path: &str, device_id: DeviceId, channel: &mut Channel) {
    let path = format!("{}/channel/{}", device_path, channel.name);
    if channel.id.is_zero() {
        channel.id = ChannelId::new(entity_id(&path));
    }
    channel.device_id = device_id;
    for (i, condition) in channel.conditions.iter_mut().enumerate() {
        if condition.id == 0 {
            condition.id = entity_id(&format!("{}/condition/{}", path, i));
        }
    }
    for (i, schedule) in channel.schedules.iter_mut().enumerate() {
        if schedule.id == 0 {
            schedule.id = entity_id(&format!("{}/schedule/{}", path, i));
        }
    }
}
