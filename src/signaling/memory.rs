//! In-process relay. Endpoints created from one hub can signal each other,
//! which is enough to run two coordinators against each other locally.
//! Messages cross the hub as JSON envelopes, the same shape a relay server
//! would see.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use super::relay::{RelaySubscription, SignalingRelay, Subscribers};
use super::types::{InboundSignal, OutboundSignal, RelayEvent, SignalPayload};
use crate::error::RelayError;

struct EndpointSlot {
    subscribers: Arc<Subscribers>,
    connected: bool,
}

#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    endpoints: Arc<Mutex<HashMap<String, EndpointSlot>>>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint for `participant_id`. Repeated calls share one inbox.
    pub fn endpoint(&self, participant_id: impl Into<String>) -> MemoryRelay {
        let id = participant_id.into();
        let subscribers = match self.endpoints.lock() {
            Ok(mut map) => map
                .entry(id.clone())
                .or_insert_with(|| EndpointSlot {
                    subscribers: Arc::new(Subscribers::new()),
                    connected: true,
                })
                .subscribers
                .clone(),
            Err(_) => Arc::new(Subscribers::new()),
        };
        MemoryRelay {
            id,
            hub: self.clone(),
            subscribers,
        }
    }

    /// Simulates the relay connection of `participant_id` dropping.
    pub fn disconnect(&self, participant_id: &str) {
        self.set_connected(participant_id, false);
    }

    pub fn reconnect(&self, participant_id: &str) {
        self.set_connected(participant_id, true);
    }

    fn set_connected(&self, participant_id: &str, connected: bool) {
        let subscribers = {
            let Ok(mut map) = self.endpoints.lock() else {
                return;
            };
            let Some(slot) = map.get_mut(participant_id) else {
                return;
            };
            if slot.connected == connected {
                return;
            }
            slot.connected = connected;
            slot.subscribers.clone()
        };
        debug!(participant = participant_id, connected, "memory relay link changed");
        subscribers.publish(if connected {
            RelayEvent::Connected
        } else {
            RelayEvent::Disconnected
        });
    }

    fn is_connected(&self, participant_id: &str) -> bool {
        self.endpoints
            .lock()
            .map(|map| map.get(participant_id).is_some_and(|s| s.connected))
            .unwrap_or(false)
    }

    /// Server side of a send: parses the envelope and fans it out to the
    /// target's subscribers, stamped with the sender id.
    fn route(&self, from: &str, wire: &str) -> Result<(), RelayError> {
        let outbound: OutboundSignal = serde_json::from_str(wire)
            .map_err(|e| RelayError::Setup(format!("malformed envelope: {e}")))?;
        let target = outbound.target_participant_id;
        match self.inbox(&target) {
            Some(inbox) => {
                inbox.publish(RelayEvent::Signal(InboundSignal::new(from, outbound.payload)));
            }
            // the relay drops messages for absent participants
            None => trace!(from, target = %target, "no reachable participant, message dropped"),
        }
        Ok(())
    }

    fn inbox(&self, participant_id: &str) -> Option<Arc<Subscribers>> {
        let map = self.endpoints.lock().ok()?;
        map.get(participant_id)
            .filter(|slot| slot.connected)
            .map(|slot| slot.subscribers.clone())
    }
}

pub struct MemoryRelay {
    id: String,
    hub: MemoryRelayHub,
    subscribers: Arc<Subscribers>,
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    fn local_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, target: &str, payload: SignalPayload) -> Result<(), RelayError> {
        if !self.hub.is_connected(&self.id) {
            return Err(RelayError::NotConnected);
        }
        let wire = serde_json::to_string(&OutboundSignal::new(target, payload))
            .map_err(|e| RelayError::Setup(format!("cannot encode signal: {e}")))?;
        self.hub.route(&self.id, &wire)
    }

    fn subscribe(&self) -> RelaySubscription {
        self.subscribers.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::IceCandidate;

    #[tokio::test]
    async fn messages_carry_the_sender_id() {
        let hub = MemoryRelayHub::new();
        let alice = hub.endpoint("alice");
        let bob = hub.endpoint("bob");
        let mut inbox = bob.subscribe();

        let payload = SignalPayload::IceCandidate(IceCandidate::new("candidate:1"));
        alice.send("bob", payload.clone()).await.unwrap();

        assert_eq!(
            inbox.recv().await,
            Some(RelayEvent::Signal(InboundSignal::new("alice", payload)))
        );
    }

    #[tokio::test]
    async fn disconnected_endpoint_cannot_send_and_is_told() {
        let hub = MemoryRelayHub::new();
        let alice = hub.endpoint("alice");
        let _bob = hub.endpoint("bob");
        let mut events = alice.subscribe();

        hub.disconnect("alice");
        assert_eq!(events.recv().await, Some(RelayEvent::Disconnected));
        let err = alice
            .send("bob", SignalPayload::IceCandidate(IceCandidate::new("c")))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NotConnected);

        hub.reconnect("alice");
        assert_eq!(events.recv().await, Some(RelayEvent::Connected));
    }
}
