use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::trace;

use super::types::{RelayEvent, SignalPayload};
use crate::error::RelayError;

/// Bidirectional signaling channel shared by every feature of the process.
/// Delivery is at most once and unordered across message kinds.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// This endpoint's participant id.
    fn local_id(&self) -> &str;

    /// Fire-and-forget send to `target`.
    async fn send(&self, target: &str, payload: SignalPayload) -> Result<(), RelayError>;

    /// Every inbound event from now on, until the subscription is dropped.
    fn subscribe(&self) -> RelaySubscription;
}

type SubscriberMap = Mutex<HashMap<u64, mpsc::UnboundedSender<RelayEvent>>>;

/// Fan-out list behind [`SignalingRelay::subscribe`].
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    map: Arc<SubscriberMap>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> RelaySubscription {
        self.subscribe_with(|| None)
    }

    /// Subscribes and hands the new subscriber `initial()` first. The
    /// closure runs under the registry lock, so it cannot interleave with
    /// a concurrent [`Subscribers::publish_if`].
    pub fn subscribe_with<F>(&self, initial: F) -> RelaySubscription
    where
        F: FnOnce() -> Option<RelayEvent>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut map) = self.map.lock() {
            if let Some(event) = initial() {
                let _ = tx.send(event);
            }
            map.insert(id, tx);
        }
        RelaySubscription {
            id,
            rx,
            registry: Arc::downgrade(&self.map),
        }
    }

    /// Delivers `event` to every live subscriber.
    pub fn publish(&self, event: RelayEvent) {
        let Ok(mut map) = self.map.lock() else {
            return;
        };
        map.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                trace!(subscription = id, "pruning closed relay subscription");
            }
            alive
        });
    }

    /// Publishes `event` only when `cond()` holds, checked under the
    /// registry lock.
    pub fn publish_if<F>(&self, cond: F, event: RelayEvent)
    where
        F: FnOnce() -> bool,
    {
        let Ok(mut map) = self.map.lock() else {
            return;
        };
        if !cond() {
            return;
        }
        map.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.map.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`SignalingRelay::subscribe`]. Unsubscribes on drop.
pub struct RelaySubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<RelayEvent>,
    registry: Weak<SubscriberMap>,
}

impl RelaySubscription {
    /// Next event, or `None` once the relay is gone.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        if let Some(map) = self.registry.upgrade() {
            if let Ok(mut map) = map.lock() {
                map.remove(&self.id);
            }
        }
    }
}
