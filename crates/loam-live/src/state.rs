//! Current state of one farm, shared behind a reader/writer lock.
//!
//! The map holds the latest [`DeviceStateMap`] per device type. Point reads
//! take the read lock and copy values out; mutations and [`FarmState::diff`]
//! take the write lock. Diff in particular holds it across the whole
//! read-compare-write pass so two concurrent reports can never interleave a
//! torn merge.

use std::collections::HashMap;

use tokio::sync::RwLock;

use loam_model::clock::unix_nanos;
use loam_model::ids::FarmId;
use loam_model::state::{DeviceStateDelta, DeviceStateMap, FarmStateMap};

use crate::error::LiveError;

/// Live state of a single farm.
pub struct FarmState {
    farm_id: FarmId,
    current: RwLock<FarmStateMap>,
}

impl FarmState {
    /// Empty state for a farm.
    pub fn new(farm_id: FarmId) -> Self {
        FarmState {
            farm_id,
            current: RwLock::new(FarmStateMap {
                farm_id,
                ..FarmStateMap::default()
            }),
        }
    }

    /// The farm this state belongs to.
    pub fn farm_id(&self) -> FarmId {
        self.farm_id
    }

    /// Copy of the whole current state.
    pub async fn snapshot(&self) -> FarmStateMap {
        self.current.read().await.clone()
    }

    /// Replaces the current state wholesale, keeping the farm id.
    pub async fn replace(&self, mut state: FarmStateMap) {
        state.farm_id = self.farm_id;
        *self.current.write().await = state;
    }

    /// State of one device by type.
    pub async fn get_device(&self, device_type: &str) -> Result<DeviceStateMap, LiveError> {
        self.current
            .read()
            .await
            .device(device_type)
            .cloned()
            .ok_or_else(|| LiveError::DeviceNotFound(device_type.to_string()))
    }

    /// State of every device, keyed by type.
    pub async fn get_devices(&self) -> HashMap<String, DeviceStateMap> {
        self.current.read().await.devices.clone()
    }

    /// Current value of one metric on one device.
    pub async fn metric_value(&self, device_type: &str, key: &str) -> Result<f64, LiveError> {
        let current = self.current.read().await;
        let device = current
            .device(device_type)
            .ok_or_else(|| LiveError::DeviceNotFound(device_type.to_string()))?;
        device.metric(key).ok_or_else(|| LiveError::MetricNotFound {
            key: key.to_string(),
        })
    }

    /// Current value of one channel on one device.
    pub async fn channel_value(&self, device_type: &str, index: usize) -> Result<i64, LiveError> {
        let current = self.current.read().await;
        let device = current
            .device(device_type)
            .ok_or_else(|| LiveError::DeviceNotFound(device_type.to_string()))?;
        device
            .channel(index)
            .ok_or(LiveError::ChannelOutOfRange {
                index,
                len: device.channels.len(),
            })
    }

    /// Sets one metric in place. Unknown keys are inserted.
    pub async fn set_metric_value(
        &self,
        device_type: &str,
        key: &str,
        value: f64,
    ) -> Result<(), LiveError> {
        let mut current = self.current.write().await;
        let device = current
            .devices
            .get_mut(device_type)
            .ok_or_else(|| LiveError::DeviceNotFound(device_type.to_string()))?;
        device.metrics.insert(key.to_string(), value);
        Ok(())
    }

    /// Sets one channel in place. The index must exist.
    pub async fn set_channel_value(
        &self,
        device_type: &str,
        index: usize,
        value: i64,
    ) -> Result<(), LiveError> {
        let mut current = self.current.write().await;
        let device = current
            .devices
            .get_mut(device_type)
            .ok_or_else(|| LiveError::DeviceNotFound(device_type.to_string()))?;
        if index >= device.channels.len() {
            return Err(LiveError::ChannelOutOfRange {
                index,
                len: device.channels.len(),
            });
        }
        device.channels[index] = value;
        Ok(())
    }

    /// Merges a reported state into the current one and returns what changed.
    ///
    /// Only metric keys already present in the current state are compared;
    /// unknown keys are ignored. Channels are compared within the current
    /// channel count. Changed values are recorded in the delta and written
    /// through to the current state under one write lock, so the merge is
    /// atomic with respect to every other accessor. Returns `None` when
    /// nothing differed.
    pub async fn diff(
        &self,
        device_type: &str,
        metrics: &HashMap<String, f64>,
        channels: &HashMap<usize, i64>,
    ) -> Result<Option<DeviceStateDelta>, LiveError> {
        let mut current = self.current.write().await;
        let device = current
            .devices
            .get_mut(device_type)
            .ok_or_else(|| LiveError::DeviceNotFound(device_type.to_string()))?;

        let mut delta = DeviceStateDelta::default();
        for (key, proposed) in metrics {
            if let Some(existing) = device.metrics.get_mut(key) {
                if *existing != *proposed {
                    delta.metrics.insert(key.clone(), *proposed);
                    *existing = *proposed;
                }
            }
        }
        for (&index, &proposed) in channels {
            if let Some(existing) = device.channels.get_mut(index) {
                if *existing != proposed {
                    delta.channels.insert(index, proposed);
                    *existing = proposed;
                }
            }
        }

        if delta.is_empty() {
            return Ok(None);
        }
        delta.timestamp = unix_nanos();
        device.timestamp = delta.timestamp;
        current.timestamp = delta.timestamp;
        Ok(Some(delta))
    }
}

/// Proposed channel values keyed by index, as [`FarmState::diff`] consumes
/// them.
pub fn channels_to_map(channels: &[i64]) -> HashMap<usize, i64> {
    channels.iter().copied().enumerate().collect()
}
