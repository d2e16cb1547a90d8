//! Live-state value types: per-device snapshots, farm-wide maps, and the
//! deltas computed against incoming telemetry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, FarmId};

/// Current snapshot of one device: named metric values plus the ordered
/// channel sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceStateMap {
    /// Device this snapshot belongs to.
    pub device_id: DeviceId,
    /// Latest value per metric key.
    pub metrics: HashMap<String, f64>,
    /// Channel values in channel order.
    pub channels: Vec<i64>,
    /// Wall-clock nanoseconds when the snapshot was taken.
    pub timestamp: u64,
}

impl DeviceStateMap {
    /// Value of one metric, if the snapshot carries it.
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    /// Value of one channel, if the index is in range.
    pub fn channel(&self, index: usize) -> Option<i64> {
        self.channels.get(index).copied()
    }
}

/// The fields of a proposed snapshot that differ from current state.
/// Channel changes are keyed by index since only some positions move.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceStateDelta {
    /// Metric values that changed.
    pub metrics: HashMap<String, f64>,
    /// Channel values that changed, by index.
    pub channels: HashMap<usize, i64>,
    /// Wall-clock nanoseconds when the delta was computed.
    pub timestamp: u64,
}

impl DeviceStateDelta {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.channels.is_empty()
    }
}

/// Current snapshots of every device in a farm, keyed by device type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmStateMap {
    /// Farm this map belongs to.
    pub farm_id: FarmId,
    /// Snapshot per device type.
    pub devices: HashMap<String, DeviceStateMap>,
    /// Wall-clock nanoseconds of the most recent update.
    pub timestamp: u64,
}

impl FarmStateMap {
    /// Snapshot for one device type, if present.
    pub fn device(&self, device_type: &str) -> Option<&DeviceStateMap> {
        self.devices.get(device_type)
    }
}
