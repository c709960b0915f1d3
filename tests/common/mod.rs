#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use call_session::error::Result as CallResult;
use call_session::media::MediaConstraints;
use call_session::peer::{IceCandidate, SessionDescription};
use call_session::signaling::{InboundSignal, RelayEvent, RelaySubscription, Subscribers};
use call_session::{
    CallConfig, CallCoordinator, CallEvent, CallEvents, CallHandle, MediaAccessError,
    MediaAcquirer, MediaTrack, MediaTrackSet, MemoryRelayHub, PeerConnection, PeerConnector,
    PeerEvent, SignalPayload, SignalingRelay, TrackKind,
};

const WAIT: Duration = Duration::from_secs(30);

enum Mode {
    Ready,
    Gated(Arc<Notify>),
    Fail(MediaAccessError),
}

/// Media acquirer handing out plain tracks. Keeps a clone of every track it
/// issued so tests can check they were stopped.
pub struct FakeAcquirer {
    mode: Mode,
    issued: Mutex<Vec<MediaTrack>>,
}

impl FakeAcquirer {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            mode: Mode::Ready,
            issued: Mutex::new(Vec::new()),
        })
    }

    /// Acquisition resolves only after the returned gate is notified.
    pub fn gated() -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let acquirer = Arc::new(Self {
            mode: Mode::Gated(gate.clone()),
            issued: Mutex::new(Vec::new()),
        });
        (acquirer, gate)
    }

    pub fn failing(err: MediaAccessError) -> Arc<Self> {
        Arc::new(Self {
            mode: Mode::Fail(err),
            issued: Mutex::new(Vec::new()),
        })
    }

    pub fn issued(&self) -> Vec<MediaTrack> {
        self.issued.lock().unwrap().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.issued().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl MediaAcquirer for FakeAcquirer {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaTrackSet, MediaAccessError> {
        match &self.mode {
            Mode::Ready => {}
            Mode::Gated(gate) => gate.notified().await,
            Mode::Fail(err) => return Err(err.clone()),
        }
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(MediaTrack::new("cam", TrackKind::Video, "local"));
        }
        if constraints.audio {
            tracks.push(MediaTrack::new("mic", TrackKind::Audio, "local"));
        }
        self.issued.lock().unwrap().extend(tracks.iter().cloned());
        Ok(MediaTrackSet::new("local", tracks))
    }
}

/// Peer connection that records every call made on it.
pub struct FakePeer {
    ops: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    offers: AtomicUsize,
    reject_tracks: bool,
}

impl FakePeer {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops().iter().filter(|o| *o == op).count()
    }

    pub fn position(&self, op: &str) -> Option<usize> {
        self.ops().iter().position(|o| o == op)
    }

    pub fn is_closed(&self) -> bool {
        self.count("close") > 0
    }

    /// Injects a backend event as if webrtc raised it.
    pub fn emit(&self, event: PeerEvent) {
        self.events.send(event).unwrap();
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &MediaTrack) -> CallResult<()> {
        if self.reject_tracks {
            return Err(call_session::CallError::Rtc(format!(
                "cannot add {} track",
                track.kind()
            )));
        }
        self.record(format!("add_track:{}", track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<SessionDescription> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("create_offer".into());
        Ok(SessionDescription::offer(format!("offer-{n}")))
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        self.record("create_answer".into());
        Ok(SessionDescription::answer("local-answer"))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> CallResult<()> {
        self.record(format!("set_local:{}", desc.sdp));
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> CallResult<()> {
        self.record(format!("set_remote:{}", desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> CallResult<()> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> CallResult<()> {
        self.record("close".into());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    reject_tracks: bool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connector whose peers refuse every local track.
    pub fn rejecting_tracks() -> Arc<Self> {
        Arc::new(Self {
            reject_tracks: true,
            ..Self::default()
        })
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers().last().cloned().expect("no peer connection created")
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        _remote_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> CallResult<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeer {
            ops: Mutex::new(Vec::new()),
            events,
            offers: AtomicUsize::new(0),
            reject_tracks: self.reject_tracks,
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

/// Relay whose subscriber list is visible to the test.
pub struct CountingRelay {
    id: String,
    pub subscribers: Arc<Subscribers>,
    pub sent: Mutex<Vec<(String, SignalPayload)>>,
}

impl CountingRelay {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            subscribers: Arc::new(Subscribers::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn deliver(&self, from: &str, payload: SignalPayload) {
        self.subscribers
            .publish(RelayEvent::Signal(InboundSignal::new(from, payload)));
    }
}

#[async_trait]
impl SignalingRelay for CountingRelay {
    fn local_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, target: &str, payload: SignalPayload) -> Result<(), call_session::RelayError> {
        self.sent.lock().unwrap().push((target.to_owned(), payload));
        Ok(())
    }

    fn subscribe(&self) -> RelaySubscription {
        self.subscribers.subscribe()
    }
}

/// A coordinator for `local` wired to an in-memory relay, plus the remote
/// participant's endpoint.
pub struct Harness {
    pub hub: MemoryRelayHub,
    pub call: CallHandle,
    pub events: CallEvents,
    pub connector: Arc<FakeConnector>,
    pub remote: call_session::signaling::MemoryRelay,
    pub remote_inbox: RelaySubscription,
}

impl Harness {
    pub fn new(local: &str, remote: &str, media: Arc<FakeAcquirer>) -> Self {
        Self::with_config(local, remote, media, CallConfig::default())
    }

    pub fn with_config(
        local: &str,
        remote: &str,
        media: Arc<FakeAcquirer>,
        config: CallConfig,
    ) -> Self {
        Self::with_connector(local, remote, media, config, FakeConnector::new())
    }

    pub fn with_connector(
        local: &str,
        remote: &str,
        media: Arc<FakeAcquirer>,
        config: CallConfig,
        connector: Arc<FakeConnector>,
    ) -> Self {
        let hub = MemoryRelayHub::new();
        let relay = Arc::new(hub.endpoint(local));
        let remote = hub.endpoint(remote);
        let remote_inbox = remote.subscribe();
        let (call, events) =
            CallCoordinator::spawn(config, media, connector.clone(), relay).unwrap();
        Self {
            hub,
            call,
            events,
            connector,
            remote,
            remote_inbox,
        }
    }

    /// Sends `payload` from the remote participant to the local one.
    pub async fn remote_sends(&self, local: &str, payload: SignalPayload) {
        self.remote.send(local, payload).await.unwrap();
    }

    /// Next signal the remote participant receives.
    pub async fn remote_receives(&mut self) -> InboundSignal {
        recv_signal(&mut self.remote_inbox).await
    }
}

pub async fn recv_signal(inbox: &mut RelaySubscription) -> InboundSignal {
    loop {
        let event = tokio::time::timeout(WAIT, inbox.recv())
            .await
            .expect("timed out waiting for a signal")
            .expect("relay closed");
        if let RelayEvent::Signal(signal) = event {
            return signal;
        }
    }
}

pub async fn next_event(events: &mut CallEvents) -> CallEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a call event")
        .expect("event channel closed")
}

/// Skips events until one matches, returning it.
pub async fn wait_event<F>(events: &mut CallEvents, mut pred: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Every event up to and including `Ended`.
pub async fn events_until_ended(events: &mut CallEvents) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(event, CallEvent::Ended(_));
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Events already queued, without waiting.
pub fn drain(events: &mut CallEvents) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Polls `cond` until it holds.
pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Lets every spawned task run until the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
