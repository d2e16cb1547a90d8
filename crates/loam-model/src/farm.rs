//! Farm configuration tree: devices, channels, metrics, and the rule entities
//! attached to them.
//!
//! A farm exclusively owns its devices and workflows. Membership edges to
//! users are kept as id sets, resolved through the DAO layer, so the model
//! never holds a cycle of owning pointers.

use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, DeviceId, FarmId, MetricId, UserId};

/// Read consistency selected per farm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Read from the local replica without coordination. May lag the leader.
    #[default]
    Local,
    /// Read linearizably through the replication group leader.
    Quorum,
}

/// A tenant-scoped collection of devices, the unit of replication and
/// live-state grouping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Farm {
    /// Identifier derived from the farm name. Zero means unassigned.
    pub id: FarmId,
    /// Display name, unique per deployment.
    pub name: String,
    /// Operating mode label, interpreted by the actuation layer.
    pub mode: String,
    /// Default telemetry interval in seconds, inherited by devices that do
    /// not set their own.
    pub interval: u64,
    /// Devices owned by this farm.
    pub devices: Vec<Device>,
    /// Member users, by id. Maintained through permission operations.
    pub users: Vec<UserId>,
    /// Automation workflows owned by this farm.
    pub workflows: Vec<Workflow>,
    /// Read consistency applied to requests scoped to this farm.
    pub consistency_level: ConsistencyLevel,
}

impl Farm {
    /// Pushes the farm interval down to devices that have none of their own.
    pub fn inherit_intervals(&mut self) {
        for device in &mut self.devices {
            if device.interval == 0 {
                device.interval = self.interval;
            }
        }
    }

    /// Device with the given type, if present. Types are unique per farm.
    pub fn device_by_type(&self, device_type: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_type == device_type)
    }

    /// True if the user is a member of this farm.
    pub fn has_user(&self, user_id: UserId) -> bool {
        self.users.contains(&user_id)
    }
}

/// An addressable unit within a farm carrying metrics and channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    /// Identifier derived from "farm name/device type".
    pub id: DeviceId,
    /// Owning farm.
    pub farm_id: FarmId,
    /// Device kind, unique within the farm.
    pub device_type: String,
    /// Telemetry interval in seconds. Zero inherits the farm interval.
    pub interval: u64,
    /// Free-form configuration entries pushed to the device.
    pub settings: Vec<Setting>,
    /// Named numeric measurements the device reports.
    pub metrics: Vec<Metric>,
    /// Ordered on/off outputs the device exposes.
    pub channels: Vec<Channel>,
}

impl Device {
    /// Channel with the given id, if present.
    pub fn channel_by_id(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }
}

/// A key/value configuration entry on a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Setting {
    /// Identifier derived from the device path and key.
    pub id: u64,
    /// Owning device.
    pub device_id: DeviceId,
    /// Setting name.
    pub key: String,
    /// Setting value, uninterpreted by the core.
    pub value: String,
}

/// A named numeric measurement reported by a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metric {
    /// Identifier derived from the device path and key.
    pub id: MetricId,
    /// Owning device.
    pub device_id: DeviceId,
    /// Metric name used in state maps and telemetry history.
    pub key: String,
    /// Unit label for display.
    pub unit: String,
}

/// An on/off output on a device. Its position in the device's channel list
/// matches the index into the live channel-state sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    /// Identifier derived from the device path and channel name.
    pub id: ChannelId,
    /// Owning device.
    pub device_id: DeviceId,
    /// Channel name, unique within the device.
    pub name: String,
    /// Metric-driven rules that actuate this channel.
    pub conditions: Vec<Condition>,
    /// Time-driven rules that actuate this channel.
    pub schedules: Vec<Schedule>,
}

/// A metric-threshold rule. Evaluated by the actuation layer; the core only
/// persists it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Condition {
    /// Identifier assigned positionally under the owning channel.
    pub id: u64,
    /// Metric key the rule watches.
    pub metric_key: String,
    /// Comparison label, e.g. "above" or "below".
    pub comparison: String,
    /// Threshold the metric is compared against.
    pub threshold: f64,
    /// Channel value applied when the rule fires.
    pub value: i64,
    /// Disabled rules are persisted but never fire.
    pub enabled: bool,
}

/// A time-window rule. Evaluated by the actuation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    /// Identifier assigned positionally under the owning channel.
    pub id: u64,
    /// Window start, "HH:MM" local to the farm.
    pub start: String,
    /// Window end, "HH:MM" local to the farm.
    pub stop: String,
    /// Channel value applied inside the window.
    pub value: i64,
    /// Disabled rules are persisted but never fire.
    pub enabled: bool,
}

/// A multi-step automation sequence owned by a farm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workflow {
    /// Identifier derived from the farm name and workflow name.
    pub id: u64,
    /// Owning farm.
    pub farm_id: FarmId,
    /// Workflow name, unique within the farm.
    pub name: String,
    /// Steps in declaration order. Read paths sort by `sort_order`.
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    /// Orders steps by `sort_order` ascending, the order read paths return.
    pub fn sort_steps(&mut self) {
        self.steps.sort_by_key(|s| s.sort_order);
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowStep {
    /// Identifier assigned positionally under the owning workflow.
    pub id: u64,
    /// Step label.
    pub name: String,
    /// Position of this step; read paths sort ascending by this field.
    pub sort_order: i64,
    /// Action label, interpreted by the actuation layer.
    pub action: String,
}
