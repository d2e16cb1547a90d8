//! TTL caches for recently touched device and farm state.
//!
//! Every put and get refreshes `last_access` on the stored entry itself, so
//! an entry stays alive as long as anything keeps touching it. A reaper task
//! per store wakes on a fixed tick and evicts entries whose last access is
//! older than the TTL; it stops promptly when its handle is signalled.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;

use loam_model::ids::{DeviceId, FarmId};
use loam_model::state::{DeviceStateMap, FarmStateMap};

/// Cache of the latest reported state per device.
pub type DeviceStateCache = TtlStore<DeviceId, DeviceStateMap>;

/// Cache of the latest assembled state per farm.
pub type FarmStateCache = TtlStore<FarmId, FarmStateMap>;

struct Entry<V> {
    state: V,
    last_access: Instant,
}

#[derive(Debug)]
struct StoreStatsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Counter snapshot for one cache.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Gets that found a live entry.
    pub hits: u64,
    /// Gets that found nothing.
    pub misses: u64,
    /// Entries removed by the reaper.
    pub evictions: u64,
}

/// A TTL-bounded map from id to state.
pub struct TtlStore<K, V> {
    name: &'static str,
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
    stats: StoreStatsInner,
}

impl<K, V> TtlStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Empty store whose entries live `ttl` past their last access. The name
    /// only labels log lines.
    pub fn new(name: &'static str, ttl: Duration) -> Arc<Self> {
        Arc::new(TtlStore {
            name,
            ttl,
            entries: RwLock::new(HashMap::new()),
            stats: StoreStatsInner {
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            },
        })
    }

    /// Inserts or replaces the state for a key, marking it just accessed.
    pub async fn put(&self, key: K, state: V) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                state,
                last_access: Instant::now(),
            },
        );
    }

    /// State for a key, refreshing its last access.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.state.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Removes and returns the state for a key.
    pub async fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().await.remove(key).map(|e| e.state)
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when the store holds nothing.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_access) <= self.ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    /// Starts the eviction task for this store.
    pub fn spawn_reaper(self: &Arc<Self>, gc_tick: Duration) -> ReaperHandle {
        let store = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc_tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = store.evict_expired().await;
                        if evicted > 0 {
                            debug!(store = store.name, evicted, "expired entries removed");
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
        ReaperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Owner's handle to a running reaper. Dropping without [`stop`] leaves the
/// task running until its store's sender side is gone.
///
/// [`stop`]: ReaperHandle::stop
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signals the reaper and waits for it to return.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(device: u64) -> DeviceStateMap {
        DeviceStateMap {
            device_id: DeviceId::new(device),
            ..DeviceStateMap::default()
        }
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = DeviceStateCache::new("device_state", Duration::from_secs(60));
        let id = DeviceId::new(1);
        assert!(store.get(&id).await.is_none());

        store.put(id, state(1)).await;
        assert_eq!(store.get(&id).await.unwrap().device_id, id);
        assert_eq!(store.len().await, 1);

        assert!(store.remove(&id).await.is_some());
        assert!(store.is_empty().await);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_idle_entries() {
        let store = DeviceStateCache::new("device_state", Duration::from_secs(5));
        let reaper = store.spawn_reaper(Duration::from_secs(1));
        store.put(DeviceId::new(1), state(1)).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(store.is_empty().await);
        assert_eq!(store.stats().evictions, 1);
        reaper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_keeps_entry_alive() {
        let store = DeviceStateCache::new("device_state", Duration::from_secs(5));
        let reaper = store.spawn_reaper(Duration::from_secs(1));
        let id = DeviceId::new(1);
        store.put(id, state(1)).await;

        // Touch every 3 simulated seconds; the 5s TTL never elapses.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(3)).await;
            tokio::task::yield_now().await;
            assert!(store.get(&id).await.is_some());
        }
        assert_eq!(store.len().await, 1);
        reaper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_the_reaper() {
        let store = DeviceStateCache::new("device_state", Duration::from_secs(1));
        let reaper = store.spawn_reaper(Duration::from_secs(1));
        reaper.stop().await;

        // With the reaper gone, idle entries survive any amount of time.
        store.put(DeviceId::new(1), state(1)).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_farm_cache_alias() {
        let store = FarmStateCache::new("farm_state", Duration::from_secs(60));
        let id = FarmId::new(2);
        store
            .put(
                id,
                FarmStateMap {
                    farm_id: id,
                    ..FarmStateMap::default()
                },
            )
            .await;
        assert_eq!(store.get(&id).await.unwrap().farm_id, id);
    }
}
