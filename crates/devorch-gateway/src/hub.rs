//! Observer fan-out
//!
//! The hub owns one broadcast receiver on the core state store and an
//! indexed map of observer handles. A single pump task serializes each delta
//! once and `try_send`s it to every observer's bounded queue, so a slow
//! observer can only hurt itself: when its queue is full the delta is
//! dropped and the observer is marked for resync, and the next frame it
//! gets is a fresh full snapshot.
//!
//! Observers never hold a reference back to the hub. Dropping an observer's
//! sender (eviction, unregister, shutdown) closes its queue, which ends the
//! connection's writer and with it the socket.

use devorch_core::{Delta, StateStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{GatewayError, Result};

/// Outgoing frame (serialized JSON)
pub type OutgoingFrame = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub String);

impl ObserverId {
    pub fn new() -> Self {
        Self(format!("obs_{}", Uuid::new_v4().simple()))
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Observer {
    tx: mpsc::Sender<OutgoingFrame>,
    last_seen: Instant,
    /// Highest version this observer has been sent, snapshot or delta
    synced_version: u64,
    resync_pending: bool,
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

impl Observer {
    fn offer(&mut self, frame: OutgoingFrame, version: u64) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.synced_version = version;
                self.resync_pending = false;
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                self.resync_pending = true;
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Snapshot frame built at most once per pass
struct LazySnapshot<'a> {
    store: &'a StateStore,
    frame: Option<(OutgoingFrame, u64)>,
}

impl<'a> LazySnapshot<'a> {
    fn new(store: &'a StateStore) -> Self {
        Self { store, frame: None }
    }

    fn get(&mut self) -> Option<(OutgoingFrame, u64)> {
        if self.frame.is_none() {
            let delta = Delta::snapshot(self.store.snapshot());
            match delta.to_json() {
                Ok(json) => self.frame = Some((json, delta.version)),
                Err(e) => {
                    tracing::error!("Failed to serialize snapshot: {}", e);
                    return None;
                }
            }
        }
        self.frame.clone()
    }
}

/// Live observer registry
#[derive(Debug)]
pub struct ObserverHub {
    store: Arc<StateStore>,
    observers: Mutex<HashMap<ObserverId, Observer>>,
}

impl ObserverHub {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            observers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Register an observer and queue its initial snapshot.
    ///
    /// The snapshot is taken under the registry lock, so the pump cannot
    /// deliver an older delta after it.
    pub fn register(&self, tx: mpsc::Sender<OutgoingFrame>) -> Result<ObserverId> {
        let id = ObserverId::new();
        let mut observers = self.observers.lock();
        let mut observer = Observer {
            tx,
            last_seen: Instant::now(),
            synced_version: 0,
            resync_pending: true,
        };
        let (frame, version) = LazySnapshot::new(&self.store)
            .get()
            .ok_or_else(|| GatewayError::Internal("snapshot unavailable".to_string()))?;
        if let Delivery::Closed = observer.offer(frame, version) {
            return Err(GatewayError::WebSocket("observer closed before registration".to_string()));
        }
        observers.insert(id.clone(), observer);
        tracing::info!("Observer registered: {} (version {})", id, version);
        Ok(id)
    }

    pub fn unregister(&self, id: &ObserverId) -> bool {
        let removed = self.observers.lock().remove(id).is_some();
        if removed {
            tracing::info!("Observer unregistered: {}", id);
        }
        removed
    }

    /// Any inbound frame counts as a sign of life
    pub fn touch(&self, id: &ObserverId) {
        if let Some(observer) = self.observers.lock().get_mut(id) {
            observer.last_seen = Instant::now();
        }
    }

    /// Queue a fresh snapshot for one observer (`get_state`).
    ///
    /// When the queue is full the observer stays marked and the snapshot is
    /// sent on the next delivery or sweep.
    pub fn resync(&self, id: &ObserverId) -> Result<()> {
        let mut observers = self.observers.lock();
        let observer = observers
            .get_mut(id)
            .ok_or_else(|| GatewayError::WebSocket(format!("unknown observer {}", id)))?;
        let (frame, version) = LazySnapshot::new(&self.store)
            .get()
            .ok_or_else(|| GatewayError::Internal("snapshot unavailable".to_string()))?;
        match observer.offer(frame, version) {
            Delivery::Sent | Delivery::Full => Ok(()),
            Delivery::Closed => {
                observers.remove(id);
                Err(GatewayError::WebSocket(format!("observer {} closed", id)))
            }
        }
    }

    /// Send a reply frame to one observer, waiting for queue space
    pub async fn send_to(&self, id: &ObserverId, frame: OutgoingFrame) -> Result<()> {
        let tx = self
            .observers
            .lock()
            .get(id)
            .map(|o| o.tx.clone())
            .ok_or_else(|| GatewayError::WebSocket(format!("unknown observer {}", id)))?;
        tx.send(frame)
            .await
            .map_err(|_| GatewayError::WebSocket(format!("observer {} closed", id)))
    }

    /// Fan one delta out to every observer
    pub fn deliver(&self, delta: &Delta) {
        let frame = match delta.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to serialize {} delta: {}", delta.event.kind(), e);
                return;
            }
        };
        let mut snapshot = LazySnapshot::new(&self.store);
        let mut observers = self.observers.lock();
        observers.retain(|id, observer| {
            if observer.resync_pending {
                return match snapshot.get() {
                    Some((snap, version)) => Self::settle(id, observer.offer(snap, version)),
                    None => true,
                };
            }
            if delta.version <= observer.synced_version {
                return true;
            }
            Self::settle(id, observer.offer(frame.clone(), delta.version))
        });
    }

    fn settle(id: &ObserverId, delivery: Delivery) -> bool {
        match delivery {
            Delivery::Sent => true,
            Delivery::Full => {
                tracing::debug!("Observer {} is behind, will resync", id);
                true
            }
            Delivery::Closed => {
                tracing::debug!("Observer {} went away", id);
                false
            }
        }
    }

    /// Mark every observer for resync and try to send the snapshot now
    pub fn resync_all(&self) {
        let mut snapshot = LazySnapshot::new(&self.store);
        let mut observers = self.observers.lock();
        observers.retain(|id, observer| {
            observer.resync_pending = true;
            match snapshot.get() {
                Some((frame, version)) => Self::settle(id, observer.offer(frame, version)),
                None => true,
            }
        });
    }

    /// Retry snapshots for observers whose queue was full
    pub fn flush_pending(&self) {
        let mut snapshot = LazySnapshot::new(&self.store);
        let mut observers = self.observers.lock();
        observers.retain(|id, observer| {
            if !observer.resync_pending {
                return true;
            }
            match snapshot.get() {
                Some((frame, version)) => Self::settle(id, observer.offer(frame, version)),
                None => true,
            }
        });
    }

    /// Drop observers silent for longer than `timeout`
    pub fn evict_stale(&self, timeout: Duration) -> Vec<ObserverId> {
        let mut evicted = Vec::new();
        self.observers.lock().retain(|id, observer| {
            let alive = observer.last_seen.elapsed() <= timeout;
            if !alive {
                evicted.push(id.clone());
            }
            alive
        });
        for id in &evicted {
            tracing::warn!("Evicted silent observer {}", id);
        }
        evicted
    }

    /// Drop every observer, closing their connections
    pub fn close_all(&self) {
        let count = {
            let mut observers = self.observers.lock();
            let count = observers.len();
            observers.clear();
            count
        };
        if count > 0 {
            tracing::info!("Closed {} observers", count);
        }
    }

    /// Forward store deltas until the store goes away
    pub fn spawn_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut rx = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(delta) => hub.deliver(&delta),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Hub lagged by {} deltas, resyncing observers", skipped);
                        hub.resync_all();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Hub pump stopped");
        })
    }

    /// Periodic eviction sweep; also retries pending resyncs
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hub.evict_stale(timeout);
                hub.flush_pending();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devorch_core::config::StateLimits;
    use devorch_core::LogLevel;

    fn hub() -> Arc<ObserverHub> {
        Arc::new(ObserverHub::new(Arc::new(StateStore::new(&StateLimits::default()))))
    }

    fn frame_type(frame: &str) -> (String, u64) {
        let json: serde_json::Value = serde_json::from_str(frame).unwrap();
        (
            json["type"].as_str().unwrap().to_string(),
            json["version"].as_u64().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_register_sends_snapshot_first() {
        let hub = hub();
        hub.store().log(LogLevel::Info, "before", "test");
        let (tx, mut rx) = mpsc::channel(8);
        hub.register(tx).unwrap();

        let (kind, version) = frame_type(&rx.recv().await.unwrap());
        assert_eq!(kind, "state");
        assert_eq!(version, hub.store().version());
        assert_eq!(hub.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_pump_delivers_in_order() {
        let hub = hub();
        let pump = hub.spawn_pump();
        let (tx, mut rx) = mpsc::channel(16);
        hub.register(tx).unwrap();
        rx.recv().await.unwrap();

        hub.store().log(LogLevel::Info, "one", "test");
        hub.store().log(LogLevel::Warn, "two", "test");

        let (first, v1) = frame_type(&rx.recv().await.unwrap());
        let (second, v2) = frame_type(&rx.recv().await.unwrap());
        assert_eq!((first.as_str(), second.as_str()), ("log", "log"));
        assert!(v2 > v1);
        pump.abort();
    }

    #[tokio::test]
    async fn test_stale_delta_is_skipped() {
        let hub = hub();
        let mut early = hub.store().subscribe();
        hub.store().log(LogLevel::Info, "already in snapshot", "test");
        let delta = early.recv().await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        hub.register(tx).unwrap();
        rx.recv().await.unwrap();

        hub.deliver(&delta);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_resyncs_instead_of_blocking() {
        let hub = hub();
        let mut deltas = hub.store().subscribe();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(16);
        hub.register(slow_tx).unwrap();
        hub.register(fast_tx).unwrap();
        fast_rx.recv().await.unwrap();

        // The slow queue still holds its snapshot
        for i in 0..3 {
            hub.store().log(LogLevel::Info, format!("line {}", i), "test");
            hub.deliver(&deltas.recv().await.unwrap());
        }
        for _ in 0..3 {
            assert_eq!(frame_type(&fast_rx.recv().await.unwrap()).0, "log");
        }

        assert_eq!(frame_type(&slow_rx.recv().await.unwrap()).0, "state");
        hub.flush_pending();
        let (kind, version) = frame_type(&slow_rx.recv().await.unwrap());
        assert_eq!(kind, "state");
        assert_eq!(version, hub.store().version());
    }

    #[tokio::test]
    async fn test_closed_observer_is_evicted_on_delivery() {
        let hub = hub();
        let mut deltas = hub.store().subscribe();
        let (tx, rx) = mpsc::channel(8);
        hub.register(tx).unwrap();
        drop(rx);

        hub.store().log(LogLevel::Info, "anyone?", "test");
        hub.deliver(&deltas.recv().await.unwrap());
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_observer_is_evicted() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(8);
        let quiet = hub.register(tx).unwrap();
        let (tx2, _rx2) = mpsc::channel(8);
        let chatty = hub.register(tx2).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.touch(&chatty);
        let evicted = hub.evict_stale(Duration::from_millis(20));

        assert_eq!(evicted, vec![quiet]);
        assert_eq!(hub.observer_count(), 1);
        rx.recv().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_get_state_resync_and_unknown_observer() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(8);
        let id = hub.register(tx).unwrap();
        rx.recv().await.unwrap();

        hub.resync(&id).unwrap();
        assert_eq!(frame_type(&rx.recv().await.unwrap()).0, "state");
        assert!(hub.resync(&ObserverId::new()).is_err());
        assert!(hub.unregister(&id));
        assert!(!hub.unregister(&id));
    }
}
