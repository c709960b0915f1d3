use serde::{Deserialize, Serialize};
use std::fmt;

use crate::peer::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => f.write_str("offer"),
            SignalKind::Answer => f.write_str("answer"),
            SignalKind::IceCandidate => f.write_str("ice-candidate"),
        }
    }
}

/// Body of a signaling message, tagged by `kind`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }
}

/// Message handed to the relay for delivery.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSignal {
    pub target_participant_id: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
    /// Unix millis at send time.
    #[serde(default)]
    pub sent_at: i64,
}

impl OutboundSignal {
    pub fn new(target: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            target_participant_id: target.into(),
            payload,
            sent_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Message delivered by the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboundSignal {
    pub from_participant_id: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl InboundSignal {
    pub fn new(from: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            from_participant_id: from.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Signal(InboundSignal),
    Connected,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_wire_shape() {
        let mut msg = OutboundSignal::new(
            "user-B",
            SignalPayload::Offer(SessionDescription::offer("v=0")),
        );
        msg.sent_at = 7;
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "targetParticipantId": "user-B",
                "kind": "offer",
                "payload": {"type": "offer", "sdp": "v=0"},
                "sentAt": 7
            })
        );
    }

    #[test]
    fn inbound_candidate_parses() {
        let msg: InboundSignal = serde_json::from_value(json!({
            "fromParticipantId": "user-A",
            "kind": "ice-candidate",
            "payload": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .unwrap();
        assert_eq!(msg.from_participant_id, "user-A");
        assert_eq!(msg.payload.kind(), SignalKind::IceCandidate);
    }
}
