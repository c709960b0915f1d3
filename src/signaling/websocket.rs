//! Plain JSON-over-WebSocket relay. Each text frame is `{event, data}`,
//! where `event` is `webrtc-offer`, `webrtc-answer` or `webrtc-ice-candidate`
//! and `data` carries the call payload addressed with `targetUserId` on the
//! way out and `fromUserId` on the way in. The event names and fields follow
//! the web client's socket events. Socket.IO packet framing is not spoken.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::relay::{RelaySubscription, SignalingRelay, Subscribers};
use super::types::{InboundSignal, RelayEvent, SignalPayload};
use crate::error::RelayError;
use crate::peer::{IceCandidate, SessionDescription};

const EVENT_OFFER: &str = "webrtc-offer";
const EVENT_ANSWER: &str = "webrtc-answer";
const EVENT_CANDIDATE: &str = "webrtc-ice-candidate";

#[derive(Serialize)]
struct ClientFrame {
    event: &'static str,
    data: Value,
}

#[derive(Deserialize)]
struct ServerFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferData {
    #[serde(skip_serializing_if = "Option::is_none")]
    target_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_user_id: Option<String>,
    offer: SessionDescription,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerData {
    #[serde(skip_serializing_if = "Option::is_none")]
    target_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_user_id: Option<String>,
    answer: SessionDescription,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateData {
    #[serde(skip_serializing_if = "Option::is_none")]
    target_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_user_id: Option<String>,
    candidate: IceCandidate,
}

fn encode_frame(target: &str, payload: SignalPayload) -> serde_json::Result<String> {
    let target_user_id = Some(target.to_owned());
    let (event, data) = match payload {
        SignalPayload::Offer(offer) => (
            EVENT_OFFER,
            serde_json::to_value(OfferData {
                target_user_id,
                from_user_id: None,
                offer,
            })?,
        ),
        SignalPayload::Answer(answer) => (
            EVENT_ANSWER,
            serde_json::to_value(AnswerData {
                target_user_id,
                from_user_id: None,
                answer,
            })?,
        ),
        SignalPayload::IceCandidate(candidate) => (
            EVENT_CANDIDATE,
            serde_json::to_value(CandidateData {
                target_user_id,
                from_user_id: None,
                candidate,
            })?,
        ),
    };
    serde_json::to_string(&ClientFrame { event, data })
}

/// Parses a server frame. Unrelated events yield `Ok(None)`.
fn decode_frame(text: &str) -> serde_json::Result<Option<InboundSignal>> {
    let frame: ServerFrame = serde_json::from_str(text)?;
    let signal = match frame.event.as_str() {
        EVENT_OFFER => {
            let d: OfferData = serde_json::from_value(frame.data)?;
            d.from_user_id
                .map(|from| InboundSignal::new(from, SignalPayload::Offer(d.offer)))
        }
        EVENT_ANSWER => {
            let d: AnswerData = serde_json::from_value(frame.data)?;
            d.from_user_id
                .map(|from| InboundSignal::new(from, SignalPayload::Answer(d.answer)))
        }
        EVENT_CANDIDATE => {
            let d: CandidateData = serde_json::from_value(frame.data)?;
            d.from_user_id
                .map(|from| InboundSignal::new(from, SignalPayload::IceCandidate(d.candidate)))
        }
        _ => None,
    };
    Ok(signal)
}

/// Appends `userId` so the server can route messages to this socket.
pub fn derive_websocket_url(base: &str, local_id: &str) -> Result<Url, RelayError> {
    let mut url = Url::parse(base).map_err(|e| RelayError::Setup(format!("invalid relay url: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| RelayError::Setup("cannot switch to ws".into()))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| RelayError::Setup("cannot switch to wss".into()))?,
        other => return Err(RelayError::Setup(format!("unsupported scheme {other}"))),
    }
    url.query_pairs_mut().append_pair("userId", local_id);
    Ok(url)
}

pub struct WebSocketRelay {
    local_id: String,
    send_tx: mpsc::UnboundedSender<String>,
    subscribers: Arc<Subscribers>,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketRelay {
    pub async fn connect(base_url: &str, local_id: impl Into<String>) -> Result<Arc<Self>, RelayError> {
        let local_id = local_id.into();
        let url = derive_websocket_url(base_url, &local_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Setup(format!("websocket connect failed: {e}")))?;
        info!(url = %url, "signaling websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();
        let subscribers = Arc::new(Subscribers::new());
        let connected = Arc::new(AtomicBool::new(true));

        let writer_subs = subscribers.clone();
        let writer_connected = connected.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = send_rx.recv().await {
                if let Err(e) = ws_write.send(Message::text(text)).await {
                    warn!("signaling websocket write failed: {e}");
                    break;
                }
            }
            mark_disconnected(&writer_subs, &writer_connected);
        });

        let reader_subs = subscribers.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("signaling websocket closed: {e}");
                        break;
                    }
                };
                if msg.is_close() {
                    break;
                }
                if !(msg.is_text() || msg.is_binary()) {
                    continue;
                }
                let Ok(text) = msg.to_text() else {
                    continue;
                };
                match decode_frame(text) {
                    Ok(Some(signal)) => reader_subs.publish(RelayEvent::Signal(signal)),
                    Ok(None) => trace!("ignoring unrelated socket event"),
                    Err(e) => warn!("malformed signaling frame: {e}"),
                }
            }
            mark_disconnected(&reader_subs, &reader_connected);
        });

        Ok(Arc::new(Self {
            local_id,
            send_tx,
            subscribers,
            connected,
            tasks: Mutex::new(vec![writer, reader]),
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Flips the link state once, whichever socket task ends first.
fn mark_disconnected(subscribers: &Subscribers, connected: &AtomicBool) {
    subscribers.publish_if(
        || connected.swap(false, Ordering::AcqRel),
        RelayEvent::Disconnected,
    );
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl SignalingRelay for WebSocketRelay {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    async fn send(&self, target: &str, payload: SignalPayload) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let text = encode_frame(target, payload)
            .map_err(|e| RelayError::Setup(format!("cannot encode signal: {e}")))?;
        self.send_tx.send(text).map_err(|_| RelayError::ChannelClosed)
    }

    /// New subscribers first learn the current link state: `Connected`
    /// while the socket is open.
    fn subscribe(&self) -> RelaySubscription {
        self.subscribers.subscribe_with(|| {
            self.connected
                .load(Ordering::Acquire)
                .then_some(RelayEvent::Connected)
        })
    }
}
