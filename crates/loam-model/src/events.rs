//! Append-only event log entries and notification records.

use serde::{Deserialize, Serialize};

use crate::clock::unix_nanos;
use crate::ids::FarmId;

/// One append-only audit entry scoped to a farm. The id doubles as the
/// storage key and is the append timestamp in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogEntry {
    /// Append timestamp in nanoseconds, assigned by the log on append.
    pub id: u64,
    /// Farm this entry belongs to.
    pub farm_id: FarmId,
    /// Event kind label, e.g. "state" or "config".
    pub kind: String,
    /// What the event is about, e.g. a device type or user email.
    pub subject: String,
    /// Human-readable description.
    pub message: String,
    /// Wall-clock nanoseconds when the event occurred.
    pub timestamp: u64,
}

impl EventLogEntry {
    /// Builds an entry stamped with the current wall clock. The id stays
    /// zero until the log assigns one on append.
    pub fn new(farm_id: FarmId, kind: &str, subject: &str, message: &str) -> Self {
        EventLogEntry {
            id: 0,
            farm_id,
            kind: kind.to_string(),
            subject: subject.to_string(),
            message: message.to_string(),
            timestamp: unix_nanos(),
        }
    }
}

/// Urgency attached to a notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Routine information.
    #[default]
    Info,
    /// Needs attention soon.
    Warning,
    /// Needs attention now.
    Critical,
}

/// A push-style message fanned out to live subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notification {
    /// Device type the notification concerns.
    pub device: String,
    /// Urgency.
    pub priority: Priority,
    /// Notification kind label.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    /// Wall-clock nanoseconds when the notification was raised.
    pub timestamp: u64,
}
