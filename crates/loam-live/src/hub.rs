//! Subscription hubs: best-effort fan-out of live events to clients.
//!
//! Each farm gets one hub. The engine publishes into the hub's feed; the hub
//! forwards every event to each subscriber's bounded channel with a
//! non-blocking send. A subscriber that cannot keep up is dropped on the
//! spot rather than slowing the engine; backpressure is never applied
//! upstream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use loam_model::events::Notification;
use loam_model::farm::Farm;
use loam_model::ids::FarmId;
use loam_model::state::{DeviceStateDelta, FarmStateMap};

/// A device-state change scoped to its farm, as fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDelta {
    /// Farm the change belongs to.
    pub farm_id: FarmId,
    /// Device type whose state changed.
    pub device_type: String,
    /// The changed metrics and channels.
    pub delta: DeviceStateDelta,
}

/// Sender side of a hub's four event channels. The engine publishes here;
/// dropping the feed ends the hub's event loop.
pub struct HubFeed {
    /// Farm configuration changes.
    pub config: mpsc::Sender<Farm>,
    /// Full farm-state replacements.
    pub state: mpsc::Sender<FarmStateMap>,
    /// Per-device state deltas.
    pub delta: mpsc::Sender<DeviceDelta>,
    /// Farm-scoped notifications.
    pub notification: mpsc::Sender<Notification>,
}

/// One subscriber's receiver ends.
pub struct Subscription {
    /// Identifier for [`FarmHub::unregister`].
    pub id: u64,
    /// Farm configuration changes, starting with the current snapshot.
    pub configs: mpsc::Receiver<Farm>,
    /// Full farm-state replacements.
    pub states: mpsc::Receiver<FarmStateMap>,
    /// Per-device state deltas.
    pub deltas: mpsc::Receiver<DeviceDelta>,
    /// Farm-scoped notifications.
    pub notifications: mpsc::Receiver<Notification>,
}

struct Client {
    config_tx: mpsc::Sender<Farm>,
    state_tx: mpsc::Sender<FarmStateMap>,
    delta_tx: mpsc::Sender<DeviceDelta>,
    notification_tx: mpsc::Sender<Notification>,
}

#[derive(Debug)]
struct HubStatsInner {
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

/// Counter snapshot for one hub.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Events delivered into subscriber channels.
    pub delivered: u64,
    /// Events a subscriber's channel had no room for.
    pub dropped: u64,
    /// Subscribers removed for falling behind.
    pub evicted: u64,
}

/// Fan-out broker for one farm's live events.
pub struct FarmHub {
    farm_id: FarmId,
    capacity: usize,
    clients: Mutex<HashMap<u64, Client>>,
    next_client: AtomicU64,
    latest_config: RwLock<Option<Farm>>,
    stats: HubStatsInner,
}

impl FarmHub {
    /// Starts a hub and its event loop. The returned feed is the input side;
    /// the engine keeps it and publishes farm events into it.
    pub fn spawn(farm_id: FarmId, capacity: usize) -> (Arc<FarmHub>, HubFeed) {
        let hub = Arc::new(FarmHub {
            farm_id,
            capacity,
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(0),
            latest_config: RwLock::new(None),
            stats: HubStatsInner {
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
            },
        });
        let (config_tx, config_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = mpsc::channel(capacity);
        let (delta_tx, delta_rx) = mpsc::channel(capacity);
        let (notification_tx, notification_rx) = mpsc::channel(capacity);
        tokio::spawn(Arc::clone(&hub).run(config_rx, state_rx, delta_rx, notification_rx));
        (
            hub,
            HubFeed {
                config: config_tx,
                state: state_tx,
                delta: delta_tx,
                notification: notification_tx,
            },
        )
    }

    async fn run(
        self: Arc<Self>,
        mut configs: mpsc::Receiver<Farm>,
        mut states: mpsc::Receiver<FarmStateMap>,
        mut deltas: mpsc::Receiver<DeviceDelta>,
        mut notifications: mpsc::Receiver<Notification>,
    ) {
        loop {
            tokio::select! {
                event = configs.recv() => match event {
                    Some(farm) => self.publish_config(farm).await,
                    None => break,
                },
                event = states.recv() => match event {
                    Some(state) => self.publish_state(state).await,
                    None => break,
                },
                event = deltas.recv() => match event {
                    Some(delta) => self.publish_delta(delta).await,
                    None => break,
                },
                event = notifications.recv() => match event {
                    Some(notification) => self.publish_notification(notification).await,
                    None => break,
                },
            }
        }
        debug!(farm_id = %self.farm_id, "hub event loop stopped");
    }

    /// Adds a subscriber and immediately hands it the current farm config.
    pub async fn register(&self) -> Subscription {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        let (config_tx, configs) = mpsc::channel(self.capacity);
        let (state_tx, states) = mpsc::channel(self.capacity);
        let (delta_tx, deltas) = mpsc::channel(self.capacity);
        let (notification_tx, notifications) = mpsc::channel(self.capacity);

        if let Some(farm) = self.latest_config.read().await.clone() {
            // Fresh channel with room for at least one message.
            let _ = config_tx.try_send(farm);
        }
        self.clients.lock().await.insert(
            id,
            Client {
                config_tx,
                state_tx,
                delta_tx,
                notification_tx,
            },
        );
        info!(farm_id = %self.farm_id, client = id, "subscriber registered");
        Subscription {
            id,
            configs,
            states,
            deltas,
            notifications,
        }
    }

    /// Removes a subscriber; its receiver ends see the channels close.
    pub async fn unregister(&self, id: u64) {
        if self.clients.lock().await.remove(&id).is_some() {
            info!(farm_id = %self.farm_id, client = id, "subscriber unregistered");
        }
    }

    /// Number of live subscribers.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> HubStats {
        HubStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }

    async fn publish_config(&self, farm: Farm) {
        *self.latest_config.write().await = Some(farm.clone());
        self.fan_out(|client| client.config_tx.try_send(farm.clone()).is_ok())
            .await;
    }

    async fn publish_state(&self, state: FarmStateMap) {
        self.fan_out(|client| client.state_tx.try_send(state.clone()).is_ok())
            .await;
    }

    async fn publish_delta(&self, delta: DeviceDelta) {
        self.fan_out(|client| client.delta_tx.try_send(delta.clone()).is_ok())
            .await;
    }

    async fn publish_notification(&self, notification: Notification) {
        self.fan_out(|client| client.notification_tx.try_send(notification.clone()).is_ok())
            .await;
    }

    // A failed send, full or closed, costs the client its subscription.
    async fn fan_out<F>(&self, mut send: F)
    where
        F: FnMut(&Client) -> bool,
    {
        let mut clients = self.clients.lock().await;
        let mut behind: Vec<u64> = Vec::new();
        for (id, client) in clients.iter() {
            if send(client) {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                behind.push(*id);
            }
        }
        for id in behind {
            clients.remove(&id);
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(farm_id = %self.farm_id, client = id, "slow subscriber dropped");
        }
    }
}

/// Process-wide intake for notifications. Producers call [`notify`]; the
/// paired receiver feeds a [`NotificationHub`].
///
/// [`notify`]: NotificationService::notify
#[derive(Clone)]
pub struct NotificationService {
    tx: mpsc::Sender<Notification>,
}

impl NotificationService {
    /// Creates the service and the receiver end for its hub.
    pub fn new(capacity: usize) -> (NotificationService, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (NotificationService { tx }, rx)
    }

    /// Queues a notification. Returns false when the hub has fallen away or
    /// its intake is full; the notification is then lost.
    pub fn notify(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "notification dropped at intake");
                false
            }
        }
    }
}

/// One subscriber's receiver end on the notification hub.
pub struct NotificationSubscription {
    /// Identifier for [`NotificationHub::unregister`].
    pub id: u64,
    /// Process-wide notifications in arrival order.
    pub notifications: mpsc::Receiver<Notification>,
}

/// Fan-out broker for process-wide notifications.
pub struct NotificationHub {
    capacity: usize,
    clients: Mutex<HashMap<u64, mpsc::Sender<Notification>>>,
    next_client: AtomicU64,
    stats: HubStatsInner,
}

impl NotificationHub {
    /// Starts a hub consuming from a [`NotificationService`] receiver.
    pub fn spawn(feed: mpsc::Receiver<Notification>, capacity: usize) -> Arc<NotificationHub> {
        let hub = Arc::new(NotificationHub {
            capacity,
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(0),
            stats: HubStatsInner {
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
            },
        });
        tokio::spawn(Arc::clone(&hub).run(feed));
        hub
    }

    async fn run(self: Arc<Self>, mut feed: mpsc::Receiver<Notification>) {
        while let Some(notification) = feed.recv().await {
            let mut clients = self.clients.lock().await;
            let mut behind: Vec<u64> = Vec::new();
            for (id, tx) in clients.iter() {
                if tx.try_send(notification.clone()).is_ok() {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    behind.push(*id);
                }
            }
            for id in behind {
                clients.remove(&id);
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                warn!(client = id, "slow notification subscriber dropped");
            }
        }
        debug!("notification hub stopped");
    }

    /// Adds a subscriber.
    pub async fn register(&self) -> NotificationSubscription {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, notifications) = mpsc::channel(self.capacity);
        self.clients.lock().await.insert(id, tx);
        NotificationSubscription { id, notifications }
    }

    /// Removes a subscriber.
    pub async fn unregister(&self, id: u64) {
        self.clients.lock().await.remove(&id);
    }

    /// Number of live subscribers.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> HubStats {
        HubStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_model::clock::unix_nanos;

    fn farm(name: &str) -> Farm {
        Farm {
            id: FarmId::new(1),
            name: name.to_string(),
            ..Farm::default()
        }
    }

    fn notification(message: &str) -> Notification {
        Notification {
            device: "doser".to_string(),
            kind: "alert".to_string(),
            message: message.to_string(),
            timestamp: unix_nanos(),
            ..Notification::default()
        }
    }

    #[tokio::test]
    async fn test_register_receives_config_snapshot() {
        let (hub, feed) = FarmHub::spawn(FarmId::new(1), 8);
        feed.config.send(farm("Test Farm")).await.unwrap();
        // Let the event loop absorb the config before registering.
        tokio::task::yield_now().await;
        while hub.latest_config.read().await.is_none() {
            tokio::task::yield_now().await;
        }

        let mut sub = hub.register().await;
        let snapshot = sub.configs.recv().await.unwrap();
        assert_eq!(snapshot.name, "Test Farm");
    }

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let (hub, feed) = FarmHub::spawn(FarmId::new(1), 8);
        let mut a = hub.register().await;
        let mut b = hub.register().await;
        assert_eq!(hub.client_count().await, 2);

        let delta = DeviceDelta {
            farm_id: FarmId::new(1),
            device_type: "thermostat".to_string(),
            delta: DeviceStateDelta::default(),
        };
        feed.delta.send(delta).await.unwrap();

        assert_eq!(a.deltas.recv().await.unwrap().device_type, "thermostat");
        assert_eq!(b.deltas.recv().await.unwrap().device_type, "thermostat");
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted() {
        let (hub, feed) = FarmHub::spawn(FarmId::new(1), 1);
        let _sub = hub.register().await;

        // Capacity 1 and a sleeping client: the second state overflows.
        feed.state.send(FarmStateMap::default()).await.unwrap();
        feed.state.send(FarmStateMap::default()).await.unwrap();
        feed.state.send(FarmStateMap::default()).await.unwrap();

        let mut waited = 0;
        while hub.client_count().await > 0 && waited < 200 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(hub.client_count().await, 0);
        assert!(hub.stats().evicted >= 1);
    }

    #[tokio::test]
    async fn test_unregister_closes_channels() {
        let (hub, _feed) = FarmHub::spawn(FarmId::new(1), 8);
        let mut sub = hub.register().await;
        hub.unregister(sub.id).await;
        assert!(sub.deltas.recv().await.is_none());
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropping_feed_stops_the_loop() {
        let (hub, feed) = FarmHub::spawn(FarmId::new(1), 8);
        let _sub = hub.register().await;
        drop(feed);
        tokio::task::yield_now().await;
        // The hub handle still answers; only the loop is gone.
        assert_eq!(hub.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_notification_service_feeds_hub() {
        let (service, rx) = NotificationService::new(8);
        let hub = NotificationHub::spawn(rx, 8);
        let mut sub = hub.register().await;

        assert!(service.notify(notification("ph high")));
        let got = sub.notifications.recv().await.unwrap();
        assert_eq!(got.message, "ph high");
        assert_eq!(hub.stats().delivered, 1);

        hub.unregister(sub.id).await;
        assert_eq!(hub.client_count().await, 0);
    }
}
