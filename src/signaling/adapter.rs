use std::sync::Arc;
use tracing::{debug, trace};

use super::relay::{RelaySubscription, SignalingRelay};
use super::types::{RelayEvent, SignalPayload};
use crate::error::RelayError;

/// A relay bound to one remote participant.
#[derive(Clone)]
pub struct SignalingAdapter {
    relay: Arc<dyn SignalingRelay>,
    remote_id: String,
}

impl SignalingAdapter {
    pub fn bind(relay: Arc<dyn SignalingRelay>, remote_id: impl Into<String>) -> Self {
        Self {
            relay,
            remote_id: remote_id.into(),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub async fn send(&self, payload: SignalPayload) -> Result<(), RelayError> {
        debug!(remote = %self.remote_id, kind = %payload.kind(), "sending signal");
        self.relay.send(&self.remote_id, payload).await
    }

    /// Inbound events for the bound participant only.
    pub fn listen(&self) -> BoundSubscription {
        BoundSubscription {
            remote_id: self.remote_id.clone(),
            inner: self.relay.subscribe(),
        }
    }
}

pub struct BoundSubscription {
    remote_id: String,
    inner: RelaySubscription,
}

impl BoundSubscription {
    /// Next relay event. Signals from any other participant are skipped.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            let event = self.inner.recv().await?;
            if let RelayEvent::Signal(signal) = &event {
                if signal.from_participant_id != self.remote_id {
                    trace!(
                        bound = %self.remote_id,
                        from = %signal.from_participant_id,
                        kind = %signal.payload.kind(),
                        "dropping signal for another session"
                    );
                    continue;
                }
            }
            return Some(event);
        }
    }
}
