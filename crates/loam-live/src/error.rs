//! Error type for the live-state engine.

use loam_model::ids::FarmId;

/// Errors produced by the live-state engine, caches, and hubs.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// The engine holds no state for the requested farm.
    #[error("farm {0} not tracked by the live engine")]
    FarmNotFound(FarmId),

    /// The farm's current state has no entry for the device type.
    #[error("device type '{0}' not present in current state")]
    DeviceNotFound(String),

    /// The device reports no metric under the requested key.
    #[error("metric '{key}' not present on device")]
    MetricNotFound {
        /// The missing metric key.
        key: String,
    },

    /// A channel index is outside the device's channel list.
    #[error("channel index {index} out of range for {len} channels")]
    ChannelOutOfRange {
        /// The requested index.
        index: usize,
        /// The device's channel count.
        len: usize,
    },
}
