//! Process-wide live engine: per-farm current state, TTL caches over recent
//! device and farm state, and event publication toward the hubs.
//!
//! The engine owns the write path. Device reports come in through
//! [`LiveEngine::diff`], which merges them into the farm's current state,
//! refreshes the caches, and publishes the delta to the farm's hub feed.
//! Publication is non-blocking; a full feed loses the event and bumps a
//! counter rather than stalling the report path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use loam_model::events::Notification;
use loam_model::farm::Farm;
use loam_model::ids::{DeviceId, FarmId};
use loam_model::state::{DeviceStateDelta, DeviceStateMap, FarmStateMap};

use crate::cache::{DeviceStateCache, FarmStateCache, ReaperHandle, StoreStats};
use crate::error::LiveError;
use crate::hub::{DeviceDelta, FarmHub, HubFeed};
use crate::state::FarmState;

/// Tunables for the live engine.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// How long an untouched device-state cache entry lives.
    pub device_ttl: Duration,
    /// How long an untouched farm-state cache entry lives.
    pub farm_ttl: Duration,
    /// How often the cache reapers wake.
    pub gc_tick: Duration,
    /// Capacity of each event channel between engine, hubs, and clients.
    pub channel_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            device_ttl: Duration::from_secs(300),
            farm_ttl: Duration::from_secs(300),
            gc_tick: Duration::from_secs(10),
            channel_capacity: 64,
        }
    }
}

#[derive(Debug)]
struct EngineStatsInner {
    configs_published: AtomicU64,
    states_published: AtomicU64,
    deltas_published: AtomicU64,
    publish_drops: AtomicU64,
}

/// Counter snapshot for the engine.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Config events handed to hub feeds.
    pub configs_published: u64,
    /// Full-state events handed to hub feeds.
    pub states_published: u64,
    /// Delta events handed to hub feeds.
    pub deltas_published: u64,
    /// Events lost to a full or missing feed.
    pub publish_drops: u64,
}

/// Live-state engine for every farm this process serves.
pub struct LiveEngine {
    config: LiveConfig,
    farms: RwLock<HashMap<FarmId, Arc<FarmState>>>,
    feeds: RwLock<HashMap<FarmId, HubFeed>>,
    devices: Arc<DeviceStateCache>,
    farm_cache: Arc<FarmStateCache>,
    reapers: Mutex<Vec<ReaperHandle>>,
    stats: EngineStatsInner,
}

impl LiveEngine {
    /// Builds the engine and starts the cache reapers.
    pub fn new(config: LiveConfig) -> Arc<LiveEngine> {
        let devices = DeviceStateCache::new("device_state", config.device_ttl);
        let farm_cache = FarmStateCache::new("farm_state", config.farm_ttl);
        let reapers = vec![
            devices.spawn_reaper(config.gc_tick),
            farm_cache.spawn_reaper(config.gc_tick),
        ];
        Arc::new(LiveEngine {
            config,
            farms: RwLock::new(HashMap::new()),
            feeds: RwLock::new(HashMap::new()),
            devices,
            farm_cache,
            reapers: Mutex::new(reapers),
            stats: EngineStatsInner {
                configs_published: AtomicU64::new(0),
                states_published: AtomicU64::new(0),
                deltas_published: AtomicU64::new(0),
                publish_drops: AtomicU64::new(0),
            },
        })
    }

    /// State handle for a farm, created on first touch.
    pub async fn ensure_farm(&self, farm_id: FarmId) -> Arc<FarmState> {
        if let Some(state) = self.farms.read().await.get(&farm_id) {
            return Arc::clone(state);
        }
        let mut farms = self.farms.write().await;
        Arc::clone(
            farms
                .entry(farm_id)
                .or_insert_with(|| Arc::new(FarmState::new(farm_id))),
        )
    }

    /// State handle for a farm the engine already tracks.
    pub async fn farm(&self, farm_id: FarmId) -> Result<Arc<FarmState>, LiveError> {
        self.farms
            .read()
            .await
            .get(&farm_id)
            .map(Arc::clone)
            .ok_or(LiveError::FarmNotFound(farm_id))
    }

    /// Forgets a farm: its state, hub feed, and cache entry.
    pub async fn remove_farm(&self, farm_id: FarmId) {
        self.farms.write().await.remove(&farm_id);
        self.feeds.write().await.remove(&farm_id);
        self.farm_cache.remove(&farm_id).await;
        info!(farm_id = %farm_id, "farm removed from live engine");
    }

    /// Spawns a hub for a farm and wires the engine's events into it. A
    /// previous hub for the same farm loses its feed and winds down.
    pub async fn attach_hub(&self, farm_id: FarmId) -> Arc<FarmHub> {
        let (hub, feed) = FarmHub::spawn(farm_id, self.config.channel_capacity);
        self.feeds.write().await.insert(farm_id, feed);
        hub
    }

    /// Disconnects a farm's hub; its event loop ends with the feed.
    pub async fn detach_hub(&self, farm_id: FarmId) {
        self.feeds.write().await.remove(&farm_id);
    }

    /// Seeds or replaces a farm's current state, refreshes the farm cache,
    /// and publishes the full state.
    pub async fn seed(&self, state: FarmStateMap) {
        let farm_id = state.farm_id;
        let farm = self.ensure_farm(farm_id).await;
        farm.replace(state.clone()).await;
        self.farm_cache.put(farm_id, state.clone()).await;
        let sent = {
            let feeds = self.feeds.read().await;
            feeds
                .get(&farm_id)
                .map(|feed| feed.state.try_send(state).is_ok())
        };
        self.count_publish(&self.stats.states_published, sent);
    }

    /// Merges a device report into the farm's current state. On change, the
    /// caches are refreshed and the delta goes out to the farm's hub.
    pub async fn diff(
        &self,
        farm_id: FarmId,
        device_type: &str,
        metrics: &HashMap<String, f64>,
        channels: &HashMap<usize, i64>,
    ) -> Result<Option<DeviceStateDelta>, LiveError> {
        let farm = self.farm(farm_id).await?;
        let delta = farm.diff(device_type, metrics, channels).await?;
        if let Some(delta) = &delta {
            let device = farm.get_device(device_type).await?;
            self.devices.put(device.device_id, device).await;
            self.farm_cache.put(farm_id, farm.snapshot().await).await;

            let event = DeviceDelta {
                farm_id,
                device_type: device_type.to_string(),
                delta: delta.clone(),
            };
            let sent = {
                let feeds = self.feeds.read().await;
                feeds
                    .get(&farm_id)
                    .map(|feed| feed.delta.try_send(event).is_ok())
            };
            self.count_publish(&self.stats.deltas_published, sent);
        }
        Ok(delta)
    }

    /// Publishes a farm configuration change to its hub.
    pub async fn publish_config(&self, farm: &Farm) {
        let sent = {
            let feeds = self.feeds.read().await;
            feeds
                .get(&farm.id)
                .map(|feed| feed.config.try_send(farm.clone()).is_ok())
        };
        self.count_publish(&self.stats.configs_published, sent);
    }

    /// Routes a notification to a farm's hub.
    pub async fn notify(&self, farm_id: FarmId, notification: Notification) {
        let sent = {
            let feeds = self.feeds.read().await;
            feeds
                .get(&farm_id)
                .map(|feed| feed.notification.try_send(notification).is_ok())
        };
        if sent != Some(true) {
            self.stats.publish_drops.fetch_add(1, Ordering::Relaxed);
            debug!(farm_id = %farm_id, "notification had no live hub");
        }
    }

    /// Latest cached state for a device, if it was reported recently.
    pub async fn cached_device(&self, device_id: DeviceId) -> Option<DeviceStateMap> {
        self.devices.get(&device_id).await
    }

    /// Latest cached state for a farm, if anything touched it recently.
    pub async fn cached_farm(&self, farm_id: FarmId) -> Option<FarmStateMap> {
        self.farm_cache.get(&farm_id).await
    }

    /// Counter snapshots for the two caches, device store first.
    pub fn cache_stats(&self) -> (StoreStats, StoreStats) {
        (self.devices.stats(), self.farm_cache.stats())
    }

    /// Counter snapshot for the engine.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            configs_published: self.stats.configs_published.load(Ordering::Relaxed),
            states_published: self.stats.states_published.load(Ordering::Relaxed),
            deltas_published: self.stats.deltas_published.load(Ordering::Relaxed),
            publish_drops: self.stats.publish_drops.load(Ordering::Relaxed),
        }
    }

    /// Stops the cache reapers and drops every hub feed.
    pub async fn shutdown(&self) {
        for reaper in self.reapers.lock().await.drain(..) {
            reaper.stop().await;
        }
        self.feeds.write().await.clear();
        info!("live engine stopped");
    }

    fn count_publish(&self, counter: &AtomicU64, sent: Option<bool>) {
        match sent {
            Some(true) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Some(false) | None => {
                self.stats.publish_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thermostat_map(farm_id: FarmId) -> FarmStateMap {
        let mut map = FarmStateMap {
            farm_id,
            ..FarmStateMap::default()
        };
        map.devices.insert(
            "thermostat".to_string(),
            DeviceStateMap {
                device_id: DeviceId::new(11),
                metrics: HashMap::from([("temp".to_string(), 70.0)]),
                channels: vec![0, 1, 0],
                ..DeviceStateMap::default()
            },
        );
        map
    }

    #[tokio::test]
    async fn test_seed_publishes_full_state() {
        let engine = LiveEngine::new(LiveConfig::default());
        let farm_id = FarmId::new(1);
        let hub = engine.attach_hub(farm_id).await;
        let mut sub = hub.register().await;

        engine.seed(thermostat_map(farm_id)).await;

        let state = sub.states.recv().await.unwrap();
        assert!(state.device("thermostat").is_some());
        assert!(engine.cached_farm(farm_id).await.is_some());
        assert_eq!(engine.stats().states_published, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_diff_publishes_delta_and_refreshes_caches() {
        let engine = LiveEngine::new(LiveConfig::default());
        let farm_id = FarmId::new(1);
        let hub = engine.attach_hub(farm_id).await;
        engine.seed(thermostat_map(farm_id)).await;
        let mut sub = hub.register().await;

        let metrics = HashMap::from([("temp".to_string(), 70.0)]);
        let channels = HashMap::from([(0usize, 1i64)]);
        let delta = engine
            .diff(farm_id, "thermostat", &metrics, &channels)
            .await
            .unwrap()
            .expect("channel 0 changed");
        assert_eq!(delta.channels, HashMap::from([(0usize, 1i64)]));

        let event = sub.deltas.recv().await.unwrap();
        assert_eq!(event.farm_id, farm_id);
        assert_eq!(event.delta.channels, HashMap::from([(0usize, 1i64)]));

        let cached = engine.cached_device(DeviceId::new(11)).await.unwrap();
        assert_eq!(cached.channels[0], 1);

        // The merge wrote through, so the identical report is silent.
        let second = engine
            .diff(farm_id, "thermostat", &metrics, &channels)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(engine.stats().deltas_published, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_diff_unknown_farm() {
        let engine = LiveEngine::new(LiveConfig::default());
        let err = engine
            .diff(FarmId::new(9), "thermostat", &HashMap::new(), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::FarmNotFound(id) if id == FarmId::new(9)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_without_hub_counts_drop() {
        let engine = LiveEngine::new(LiveConfig::default());
        engine.seed(thermostat_map(FarmId::new(1))).await;
        assert_eq!(engine.stats().states_published, 0);
        assert_eq!(engine.stats().publish_drops, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_event_reaches_subscriber() {
        let engine = LiveEngine::new(LiveConfig::default());
        let farm_id = FarmId::new(1);
        let hub = engine.attach_hub(farm_id).await;
        let mut sub = hub.register().await;

        let farm = Farm {
            id: farm_id,
            name: "Test Farm".to_string(),
            ..Farm::default()
        };
        engine.publish_config(&farm).await;

        let got = sub.configs.recv().await.unwrap();
        assert_eq!(got.name, "Test Farm");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_farm_clears_state_and_cache() {
        let engine = LiveEngine::new(LiveConfig::default());
        let farm_id = FarmId::new(1);
        engine.seed(thermostat_map(farm_id)).await;
        assert!(engine.farm(farm_id).await.is_ok());

        engine.remove_farm(farm_id).await;
        assert!(engine.farm(farm_id).await.is_err());
        assert!(engine.cached_farm(farm_id).await.is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_notify_reaches_farm_subscribers() {
        let engine = LiveEngine::new(LiveConfig::default());
        let farm_id = FarmId::new(1);
        let hub = engine.attach_hub(farm_id).await;
        let mut sub = hub.register().await;

        engine
            .notify(
                farm_id,
                Notification {
                    device: "thermostat".to_string(),
                    kind: "alert".to_string(),
                    message: "temp high".to_string(),
                    ..Notification::default()
                },
            )
            .await;

        let got = sub.notifications.recv().await.unwrap();
        assert_eq!(got.message, "temp high");
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reapers() {
        let engine = LiveEngine::new(LiveConfig {
            device_ttl: Duration::from_secs(1),
            farm_ttl: Duration::from_secs(1),
            gc_tick: Duration::from_secs(1),
            channel_capacity: 8,
        });
        engine.seed(thermostat_map(FarmId::new(1))).await;
        engine.shutdown().await;

        // Reapers are gone; the idle cache entry outlives its TTL.
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert!(engine.cached_farm(FarmId::new(1)).await.is_some());
    }
}
