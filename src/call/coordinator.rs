//! Call session coordinator.
//!
//! One actor task owns the active [`CallSession`] and processes a single
//! input at a time: UI commands first, then internal events raised by
//! spawned work (media acquisition, timers, relay and peer pumps). Every
//! internal event carries the epoch of the session that produced it, so
//! results that arrive after a session was released are discarded.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::session::CallSession;
use super::state::{CallEvent, CallState, EndReason};
use crate::config::CallConfig;
use crate::error::{CallError, MediaAccessError, Result};
use crate::media::{MediaAcquirer, MediaConstraints, MediaTrackSet, SampleTrackAcquirer};
use crate::peer::{
    IceCandidate, PeerConnector, PeerEvent, PeerSession, PeerState, RemoteStream, Role,
    RtcPeerConnector, SessionDescription,
};
use crate::signaling::{RelayEvent, SignalPayload, SignalingAdapter, SignalingRelay};

/// Receiving side of the coordinator's UI events.
pub type CallEvents = mpsc::UnboundedReceiver<CallEvent>;

enum Command {
    Start {
        remote_id: String,
        role: Role,
        is_audio_only: bool,
    },
    End,
    MuteAudio(bool),
    MuteVideo(bool),
}

enum Internal {
    MediaReady {
        epoch: u64,
        result: std::result::Result<MediaTrackSet, MediaAccessError>,
    },
    OfferDue {
        epoch: u64,
    },
    DisconnectGraceElapsed {
        epoch: u64,
    },
    Relay {
        epoch: u64,
        event: RelayEvent,
    },
    Peer {
        epoch: u64,
        event: PeerEvent,
    },
}

/// Why an input forced the active session to end.
struct Teardown {
    reason: EndReason,
    error: Option<CallError>,
}

impl Teardown {
    fn failed(msg: impl Into<String>) -> Self {
        Self {
            reason: EndReason::ConnectionFailed,
            error: Some(CallError::PeerConnectionFailure(msg.into())),
        }
    }
}

struct EventSink {
    events: mpsc::UnboundedSender<CallEvent>,
    state: watch::Sender<CallState>,
}

impl EventSink {
    fn emit(&self, event: CallEvent) {
        // the UI may have stopped listening
        let _ = self.events.send(event);
    }

    fn error(&self, err: CallError) {
        if err.is_fatal() {
            error!("{err}");
        } else {
            warn!("{err}");
        }
        self.emit(CallEvent::Error(err));
    }

    fn transition(&self, session: &mut CallSession, next: CallState) {
        if session.state == next {
            return;
        }
        info!(
            remote = %session.remote_id,
            epoch = session.epoch,
            from = ?session.state,
            to = ?next,
            "call state"
        );
        session.state = next;
        self.state.send_replace(next);
        self.emit(CallEvent::StateChanged(next));
    }
}

/// Cloneable command surface of a running coordinator. Dropping every
/// handle ends the active call and stops the actor.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CallState>,
    liveness: Arc<Mutex<Option<CancellationToken>>>,
}

impl CallHandle {
    pub fn start_outgoing_call(&self, remote_id: impl Into<String>, is_audio_only: bool) -> Result<()> {
        self.send(Command::Start {
            remote_id: remote_id.into(),
            role: Role::Caller,
            is_audio_only,
        })
    }

    pub fn start_incoming_call(&self, remote_id: impl Into<String>, is_audio_only: bool) -> Result<()> {
        self.send(Command::Start {
            remote_id: remote_id.into(),
            role: Role::Callee,
            is_audio_only,
        })
    }

    /// Ends the active call. Pending media acquisition and in-flight
    /// negotiation observe the cancellation before the actor gets to the
    /// command. Safe to call in any state.
    pub fn end_call(&self) -> Result<()> {
        if let Ok(mut slot) = self.liveness.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
        self.send(Command::End)
    }

    pub fn mute_audio(&self, muted: bool) -> Result<()> {
        self.send(Command::MuteAudio(muted))
    }

    pub fn mute_video(&self, muted: bool) -> Result<()> {
        self.send(Command::MuteVideo(muted))
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Resolves once the call is at `target` or any later lifecycle stage.
    /// `Ended` is beyond every other state. The previous call's `Ended`
    /// satisfies any target until the next start command is processed.
    pub async fn wait_for_state(&self, target: CallState) -> Result<()> {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|state| *state >= target).await.is_ok();
        if reached {
            Ok(())
        } else {
            Err(CallError::CoordinatorClosed)
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CallError::CoordinatorClosed)
    }
}

pub struct CallCoordinator {
    config: CallConfig,
    media: Arc<dyn MediaAcquirer>,
    connector: Arc<dyn PeerConnector>,
    relay: Arc<dyn SignalingRelay>,
    sink: EventSink,
    internal_tx: mpsc::UnboundedSender<Internal>,
    liveness: Arc<Mutex<Option<CancellationToken>>>,
    session: Option<CallSession>,
    epoch: u64,
}

impl CallCoordinator {
    /// Starts the coordinator actor. Must be called inside a Tokio runtime.
    pub fn spawn(
        config: CallConfig,
        media: Arc<dyn MediaAcquirer>,
        connector: Arc<dyn PeerConnector>,
        relay: Arc<dyn SignalingRelay>,
    ) -> Result<(CallHandle, CallEvents)> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let liveness = Arc::new(Mutex::new(None));

        info!(local = relay.local_id(), "starting call coordinator");
        let coordinator = Self {
            config,
            media,
            connector,
            relay,
            sink: EventSink {
                events: event_tx,
                state: state_tx,
            },
            internal_tx,
            liveness: liveness.clone(),
            session: None,
            epoch: 0,
        };
        tokio::spawn(coordinator.run(command_rx, internal_rx));

        let handle = CallHandle {
            commands: command_tx,
            state: state_rx,
            liveness,
        };
        Ok((handle, event_rx))
    }

    /// Coordinator backed by webrtc-rs peer connections and sample-fed
    /// local tracks.
    pub fn spawn_webrtc(
        config: CallConfig,
        relay: Arc<dyn SignalingRelay>,
    ) -> Result<(CallHandle, CallEvents)> {
        let connector = Arc::new(RtcPeerConnector::new(&config));
        Self::spawn(config, Arc::new(SampleTrackAcquirer::new()), connector, relay)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(event) = internal.recv() => self.on_internal(event).await,
            }
        }
        debug!("all call handles dropped");
        self.end_session(EndReason::Shutdown).await;
        info!("call coordinator stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start {
                remote_id,
                role,
                is_audio_only,
            } => self.start(remote_id, role, is_audio_only).await,
            Command::End => self.end_session(EndReason::HungUp).await,
            Command::MuteAudio(muted) => self.set_mute(Some(muted), None),
            Command::MuteVideo(muted) => self.set_mute(None, Some(muted)),
        }
    }

    async fn on_internal(&mut self, event: Internal) {
        let outcome = match event {
            Internal::MediaReady { epoch, result } => self.on_media_ready(epoch, result).await,
            Internal::OfferDue { epoch } => {
                self.on_offer_due(epoch).await;
                Ok(())
            }
            Internal::DisconnectGraceElapsed { epoch } => self.on_disconnect_grace(epoch),
            Internal::Relay { epoch, event } => {
                self.on_relay_event(epoch, event).await;
                Ok(())
            }
            Internal::Peer { epoch, event } => self.on_peer_event(epoch, event).await,
        };
        if let Err(teardown) = outcome {
            if let Some(err) = teardown.error {
                self.sink.error(err);
            }
            self.end_session(teardown.reason).await;
        }
    }

    async fn start(&mut self, remote_id: String, role: Role, is_audio_only: bool) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.state != CallState::Ended)
        {
            self.end_session(EndReason::Replaced).await;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        info!(remote = %remote_id, ?role, is_audio_only, epoch, "starting call");

        let signaling = SignalingAdapter::bind(self.relay.clone(), remote_id.clone());
        let mut session = CallSession::new(epoch, remote_id, role, is_audio_only, signaling);
        if let Ok(mut slot) = self.liveness.lock() {
            *slot = Some(session.liveness.clone());
        }

        // subscribe before acquiring media so an early offer is kept
        let mut inbound = session.signaling.listen();
        let tx = self.internal_tx.clone();
        session.track_task(tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                if tx.send(Internal::Relay { epoch, event }).is_err() {
                    break;
                }
            }
        }));

        let media = self.media.clone();
        let constraints = MediaConstraints::for_call(is_audio_only);
        let cancelled = session.liveness.clone();
        let tx = self.internal_tx.clone();
        session.track_task(tokio::spawn(async move {
            tokio::select! {
                result = media.acquire(constraints) => {
                    let _ = tx.send(Internal::MediaReady { epoch, result });
                }
                _ = cancelled.cancelled() => debug!(epoch, "media acquisition abandoned"),
            }
        }));

        self.sink.transition(&mut session, CallState::AwaitingMedia);
        self.session = Some(session);
    }

    /// Releases the active session and reports `reason`. No-op when there is
    /// nothing to end.
    async fn end_session(&mut self, reason: EndReason) {
        let Some(session) = self.session.as_mut() else {
            debug!("no call to end");
            return;
        };
        if session.state == CallState::Ended {
            return;
        }
        session.release().await;
        self.sink.transition(session, CallState::Ended);
        self.sink.emit(CallEvent::Ended(reason));
        info!(remote = %session.remote_id, epoch = session.epoch, ?reason, "call ended");
        if let Ok(mut slot) = self.liveness.lock() {
            *slot = None;
        }
    }

    fn set_mute(&mut self, audio: Option<bool>, video: Option<bool>) {
        let Some(session) = self.session.as_mut().filter(|s| s.state != CallState::Ended) else {
            debug!("mute request without an active call");
            return;
        };
        if let Some(muted) = audio {
            session.audio_muted = muted;
        }
        if let Some(muted) = video {
            session.video_muted = muted;
        }
        debug!(audio = session.audio_muted, video = session.video_muted, "mute state");
        session.apply_mute();
    }

    async fn on_media_ready(
        &mut self,
        epoch: u64,
        result: std::result::Result<MediaTrackSet, MediaAccessError>,
    ) -> std::result::Result<(), Teardown> {
        let Some(session) = self.session.as_mut().filter(|s| s.accepts(epoch)) else {
            debug!(epoch, "discarding media acquired for a released call");
            return Ok(());
        };
        let media = result.map_err(|e| Teardown {
            reason: EndReason::MediaAccess,
            error: Some(e.into()),
        })?;

        media.set_audio_enabled(!session.audio_muted);
        media.set_video_enabled(!session.video_muted);
        info!(
            remote = %session.remote_id,
            tracks = media.len(),
            audio_only = session.is_audio_only,
            "local media ready"
        );
        self.sink.emit(CallEvent::LocalMediaReady(media.preview()));
        self.sink.transition(session, CallState::Negotiating);

        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let tx = self.internal_tx.clone();
        session.track_task(tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                if tx.send(Internal::Peer { epoch, event }).is_err() {
                    break;
                }
            }
        }));

        let conn = self
            .connector
            .connect(&session.remote_id, peer_tx)
            .await
            .map_err(|e| Teardown::failed(e.to_string()))?;
        let mut peer = PeerSession::new(session.remote_id.clone(), session.role, conn);
        let attached = peer.attach_tracks(&media).await;
        let has_local_media = peer.has_local_media();
        session.media = Some(media);
        session.peer = Some(peer);
        if let Err(e) = attached {
            if !has_local_media {
                return Err(Teardown::failed(format!("could not attach local media: {e}")));
            }
            self.sink.error(e);
        }
        if session.liveness.is_cancelled() {
            // end_call is queued behind us and releases the peer
            return Ok(());
        }

        for candidate in session.pending.take_candidates() {
            Self::apply_candidate(session, candidate).await;
        }
        match session.role {
            Role::Caller => {
                let delay = self.config.offer_grace_delay();
                debug!(?delay, "offer scheduled");
                let tx = self.internal_tx.clone();
                session.track_task(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Internal::OfferDue { epoch });
                }));
            }
            Role::Callee => {
                if let Some(offer) = session.pending.take_offer() {
                    debug!(remote = %session.remote_id, "replaying buffered offer");
                    Self::apply_offer(&self.sink, session, offer).await;
                }
            }
        }
        Ok(())
    }

    async fn on_offer_due(&mut self, epoch: u64) {
        let Some(session) = self.session.as_mut().filter(|s| s.accepts(epoch)) else {
            return;
        };
        let Some(peer) = session.peer.as_mut() else {
            return;
        };
        if !peer.has_local_media() {
            self.sink.error(CallError::NoLocalMedia);
        }
        match peer.create_offer().await {
            Ok(offer) => {
                if session.liveness.is_cancelled() {
                    return;
                }
                if let Err(e) = session.signaling.send(SignalPayload::Offer(offer)).await {
                    self.sink.error(e.into());
                }
            }
            Err(e) => self.sink.error(e),
        }
    }

    fn on_disconnect_grace(&mut self, epoch: u64) -> std::result::Result<(), Teardown> {
        let Some(session) = self.session.as_mut().filter(|s| s.accepts(epoch)) else {
            return Ok(());
        };
        session.disconnect_timer = None;
        match session.peer.as_ref().map(PeerSession::state) {
            Some(PeerState::Connected) => Ok(()),
            _ => Err(Teardown::failed(format!(
                "connection lost for more than {}ms",
                self.config.disconnect_grace_ms
            ))),
        }
    }

    async fn on_relay_event(&mut self, epoch: u64, event: RelayEvent) {
        let Some(session) = self.session.as_mut().filter(|s| s.accepts(epoch)) else {
            return;
        };
        match event {
            RelayEvent::Connected => {
                info!("signaling relay connected");
                self.sink.emit(CallEvent::SignalingConnected);
            }
            RelayEvent::Disconnected => {
                warn!("signaling relay disconnected");
                self.sink.emit(CallEvent::SignalingDisconnected);
            }
            RelayEvent::Signal(signal) => {
                if signal.from_participant_id != session.remote_id {
                    trace!(from = %signal.from_participant_id, "ignoring signal from stale participant");
                    return;
                }
                debug!(remote = %session.remote_id, kind = %signal.payload.kind(), "signal received");
                match signal.payload {
                    SignalPayload::Offer(offer) => Self::apply_offer(&self.sink, session, offer).await,
                    SignalPayload::Answer(answer) => {
                        Self::apply_answer(&self.sink, session, answer).await
                    }
                    SignalPayload::IceCandidate(candidate) => {
                        Self::apply_candidate(session, candidate).await
                    }
                }
            }
        }
    }

    async fn apply_offer(sink: &EventSink, session: &mut CallSession, offer: SessionDescription) {
        if session.role == Role::Caller {
            sink.error(CallError::SignalingProtocol(
                "offer received while placing a call; keeping own offer".into(),
            ));
            return;
        }
        let Some(peer) = session.peer.as_mut() else {
            debug!(remote = %session.remote_id, "buffering offer until local media is ready");
            session.pending.store_offer(offer);
            return;
        };
        match peer.accept_offer(&offer).await {
            Ok(answer) => {
                if session.liveness.is_cancelled() {
                    return;
                }
                if let Err(e) = session.signaling.send(SignalPayload::Answer(answer)).await {
                    sink.error(e.into());
                }
            }
            Err(CallError::MediaNotReady) => session.pending.store_offer(offer),
            Err(e) => sink.error(e),
        }
    }

    async fn apply_answer(sink: &EventSink, session: &mut CallSession, answer: SessionDescription) {
        let Some(peer) = session.peer.as_mut() else {
            sink.error(CallError::SignalingProtocol(
                "answer received before negotiation started".into(),
            ));
            return;
        };
        match peer.accept_answer(&answer).await {
            Ok(true) => debug!(remote = %session.remote_id, "remote answer applied"),
            Ok(false) => {}
            Err(e) => sink.error(e),
        }
    }

    async fn apply_candidate(session: &mut CallSession, candidate: IceCandidate) {
        match session.peer.as_mut() {
            Some(peer) => peer.add_remote_candidate(candidate).await,
            None => session.pending.push_candidate(candidate),
        }
    }

    async fn on_peer_event(
        &mut self,
        epoch: u64,
        event: PeerEvent,
    ) -> std::result::Result<(), Teardown> {
        let Some(session) = self.session.as_mut().filter(|s| s.accepts(epoch)) else {
            return Ok(());
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let payload = SignalPayload::IceCandidate(candidate);
                if let Err(e) = session.signaling.send(payload).await {
                    self.sink.error(e.into());
                }
            }
            PeerEvent::RemoteTrack(track) => match session.remote_stream.as_mut() {
                Some(stream) => {
                    debug!(kind = %track.kind, "additional remote track");
                    stream.tracks.push(track);
                }
                None => {
                    let stream = RemoteStream::from_track(track);
                    info!(remote = %session.remote_id, stream = %stream.id, "remote stream arrived");
                    session.remote_stream = Some(stream.clone());
                    self.sink.emit(CallEvent::RemoteStreamArrived(stream));
                }
            },
            PeerEvent::StateChanged(transport) => {
                let Some(peer) = session.peer.as_mut() else {
                    return Ok(());
                };
                let Some(state) = peer.on_transport_state(transport) else {
                    return Ok(());
                };
                self.sink.emit(CallEvent::ConnectionStateChanged(state));
                match state {
                    PeerState::Connected => {
                        session.cancel_disconnect_timer();
                        self.sink.transition(session, CallState::Connected);
                    }
                    PeerState::Disconnected if session.disconnect_timer.is_none() => {
                        let grace = self.config.disconnect_grace();
                        warn!(remote = %session.remote_id, ?grace, "peer disconnected, waiting for recovery");
                        let tx = self.internal_tx.clone();
                        session.disconnect_timer = Some(tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            let _ = tx.send(Internal::DisconnectGraceElapsed { epoch });
                        }));
                    }
                    PeerState::Failed => {
                        return Err(Teardown::failed("ICE/DTLS transport failed"));
                    }
                    PeerState::Closed => {
                        return Err(Teardown {
                            reason: EndReason::RemoteClosed,
                            error: None,
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
