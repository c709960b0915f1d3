//! Offer/answer state machine around one [`PeerConnection`].
//!
//! All negotiation entry points take `&mut self`, so only one local
//! description step can be in flight for a session at any time.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::connection::PeerConnection;
use super::ice::{apply_pending_candidates, candidate_type, PendingCandidates};
use super::types::{IceCandidate, PeerState, Role, SessionDescription, TransportState};
use crate::error::{CallError, Result};
use crate::logger::dump_candidate;
use crate::media::MediaTrackSet;

pub struct PeerSession {
    remote_id: String,
    role: Role,
    conn: Arc<dyn PeerConnection>,
    state: PeerState,
    local_tracks: usize,
    offer_sent: bool,
    remote_description_set: bool,
    /// Offer we answered and the answer we produced, kept for duplicates.
    applied_offer: Option<(SessionDescription, SessionDescription)>,
    answer_applied: bool,
    pending: PendingCandidates,
}

impl PeerSession {
    pub fn new(remote_id: impl Into<String>, role: Role, conn: Arc<dyn PeerConnection>) -> Self {
        Self {
            remote_id: remote_id.into(),
            role,
            conn,
            state: PeerState::New,
            local_tracks: 0,
            offer_sent: false,
            remote_description_set: false,
            applied_offer: None,
            answer_applied: false,
            pending: PendingCandidates::default(),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn has_local_media(&self) -> bool {
        self.local_tracks > 0
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending.len()
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.state.can_negotiate() {
            Ok(())
        } else {
            Err(CallError::InvalidState(format!(
                "{op} not allowed in peer state {:?}",
                self.state
            )))
        }
    }

    /// Adds every track of `media` to the connection.
    pub async fn attach_tracks(&mut self, media: &MediaTrackSet) -> Result<()> {
        for track in media.tracks() {
            debug!(remote = %self.remote_id, kind = %track.kind(), "adding track to peer connection");
            self.conn.add_track(track).await?;
            self.local_tracks += 1;
        }
        Ok(())
    }

    /// Creates the offer and installs it as local description. Only the
    /// caller may offer; there is no glare rollback.
    pub async fn create_offer(&mut self) -> Result<SessionDescription> {
        if self.role == Role::Callee {
            return Err(CallError::SignalingProtocol(
                "callee attempted to create an offer".into(),
            ));
        }
        self.ensure_open("create_offer")?;
        if !self.has_local_media() {
            warn!(remote = %self.remote_id, "creating offer without local media");
        }

        let offer = self.conn.create_offer().await?;
        self.conn.set_local_description(&offer).await?;
        self.offer_sent = true;
        self.state = PeerState::Negotiating;
        info!(remote = %self.remote_id, "offer created");
        Ok(offer)
    }

    /// Applies a remote offer and returns the answer to send back.
    ///
    /// Fails with [`CallError::MediaNotReady`] while no local track is
    /// attached; the caller keeps the offer and retries later. The same
    /// offer delivered twice yields the original answer again.
    pub async fn accept_offer(&mut self, offer: &SessionDescription) -> Result<SessionDescription> {
        if self.role == Role::Caller {
            return Err(CallError::SignalingProtocol(
                "caller received an offer (glare); keeping own offer".into(),
            ));
        }
        if let Some((applied, answer)) = &self.applied_offer {
            if applied == offer {
                debug!(remote = %self.remote_id, "duplicate offer, repeating answer");
                return Ok(answer.clone());
            }
            return Err(CallError::SignalingProtocol(
                "renegotiation offers are not supported".into(),
            ));
        }
        self.ensure_open("accept_offer")?;
        if !self.has_local_media() {
            return Err(CallError::MediaNotReady);
        }

        self.conn.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.state = PeerState::Negotiating;
        apply_pending_candidates(self.conn.as_ref(), &mut self.pending).await;

        let answer = self.conn.create_answer().await?;
        self.conn.set_local_description(&answer).await?;
        self.applied_offer = Some((offer.clone(), answer.clone()));
        info!(remote = %self.remote_id, "offer accepted, answer created");
        Ok(answer)
    }

    /// Applies the remote answer once. Returns false when it was ignored
    /// as a repeat.
    pub async fn accept_answer(&mut self, answer: &SessionDescription) -> Result<bool> {
        if self.role == Role::Callee {
            return Err(CallError::SignalingProtocol(
                "callee received an answer".into(),
            ));
        }
        if !self.offer_sent {
            return Err(CallError::SignalingProtocol(
                "answer received before any offer was sent".into(),
            ));
        }
        if self.answer_applied {
            debug!(remote = %self.remote_id, "answer already applied, ignoring");
            return Ok(false);
        }
        if self.state.is_terminal() {
            return Err(CallError::InvalidState(format!(
                "accept_answer not allowed in peer state {:?}",
                self.state
            )));
        }

        self.conn.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.answer_applied = true;
        apply_pending_candidates(self.conn.as_ref(), &mut self.pending).await;
        info!(remote = %self.remote_id, "answer applied");
        Ok(true)
    }

    /// Applies a remote candidate, or queues it until a remote description
    /// exists. Rejected candidates are logged, never fatal.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state.is_terminal() {
            return;
        }
        dump_candidate("REMOTE", &self.remote_id, &candidate);
        let typ = candidate_type(&candidate).unwrap_or("unknown");
        if !self.remote_description_set {
            debug!(remote = %self.remote_id, typ, "queuing ICE candidate until remote description");
            self.pending.push(candidate);
            return;
        }
        match self.conn.add_ice_candidate(&candidate).await {
            Ok(()) => debug!(remote = %self.remote_id, typ, "remote ICE candidate added"),
            Err(e) => warn!(remote = %self.remote_id, typ, "failed to add ICE candidate: {e}"),
        }
    }

    /// Folds a backend state change in. Returns the new state if it changed.
    pub fn on_transport_state(&mut self, transport: TransportState) -> Option<PeerState> {
        if self.state.is_terminal() {
            return None;
        }
        let next = match transport {
            TransportState::New => return None,
            TransportState::Connecting => PeerState::Negotiating,
            TransportState::Connected => PeerState::Connected,
            TransportState::Disconnected => PeerState::Disconnected,
            TransportState::Failed => PeerState::Failed,
            TransportState::Closed => PeerState::Closed,
        };
        if next == self.state {
            return None;
        }
        debug!(remote = %self.remote_id, from = ?self.state, to = ?next, "peer state");
        self.state = next;
        Some(next)
    }

    /// Closes the connection and drops queued candidates. Idempotent.
    pub async fn close(&mut self) {
        self.pending.clear();
        if self.state == PeerState::Closed {
            return;
        }
        self.state = PeerState::Closed;
        if let Err(e) = self.conn.close().await {
            warn!(remote = %self.remote_id, "error while closing peer connection: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeConnection {
        log: Mutex<Vec<String>>,
    }

    impl FakeConnection {
        fn ops(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn record(&self, op: impl Into<String>) {
            self.log.lock().unwrap().push(op.into());
        }
    }

    #[async_trait]
    impl PeerConnection for FakeConnection {
        async fn add_track(&self, track: &MediaTrack) -> Result<()> {
            self.record(format!("track:{}", track.kind()));
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("offer-sdp"))
        }
        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("answer-sdp"))
        }
        async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
            self.record(format!("local:{}", desc.sdp));
            Ok(())
        }
        async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
            self.record(format!("remote:{}", desc.sdp));
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
            self.record(format!("cand:{}", candidate.candidate));
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.record("close");
            Ok(())
        }
    }

    fn media() -> MediaTrackSet {
        MediaTrackSet::new("s", vec![MediaTrack::new("a", TrackKind::Audio, "s")])
    }

    fn session(role: Role) -> (PeerSession, Arc<FakeConnection>) {
        let conn = Arc::new(FakeConnection::default());
        (PeerSession::new("user-B", role, conn.clone()), conn)
    }

    #[tokio::test]
    async fn duplicate_answer_is_ignored() {
        let (mut peer, conn) = session(Role::Caller);
        peer.attach_tracks(&media()).await.unwrap();
        peer.create_offer().await.unwrap();

        let answer = SessionDescription::answer("remote-answer");
        assert!(peer.accept_answer(&answer).await.unwrap());
        let after_first = conn.ops();
        let state = peer.state();

        assert!(!peer.accept_answer(&answer).await.unwrap());
        assert_eq!(conn.ops(), after_first);
        assert_eq!(peer.state(), state);
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description_in_order() {
        let (mut peer, conn) = session(Role::Callee);
        for i in 0..4 {
            peer.add_remote_candidate(IceCandidate::new(format!("c{i}"))).await;
        }
        assert_eq!(peer.pending_candidate_count(), 4);
        assert!(!conn.ops().iter().any(|op| op.starts_with("cand:")));

        peer.attach_tracks(&media()).await.unwrap();
        peer.accept_offer(&SessionDescription::offer("remote-offer")).await.unwrap();

        let ops = conn.ops();
        let remote_at = ops.iter().position(|op| op == "remote:remote-offer").unwrap();
        let cands: Vec<_> = ops.iter().filter(|op| op.starts_with("cand:")).cloned().collect();
        assert_eq!(cands, ["cand:c0", "cand:c1", "cand:c2", "cand:c3"]);
        let first_cand = ops.iter().position(|op| op == "cand:c0").unwrap();
        assert!(remote_at < first_cand);
        assert_eq!(peer.pending_candidate_count(), 0);

        // later candidates go straight through
        peer.add_remote_candidate(IceCandidate::new("c4")).await;
        assert_eq!(conn.ops().last().map(String::as_str), Some("cand:c4"));
    }

    #[tokio::test]
    async fn offer_without_media_is_refused_for_buffering() {
        let (mut peer, conn) = session(Role::Callee);
        let err = peer
            .accept_offer(&SessionDescription::offer("remote-offer"))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::MediaNotReady);
        assert!(conn.ops().is_empty());
        assert_eq!(peer.state(), PeerState::New);
    }

    #[tokio::test]
    async fn duplicate_offer_repeats_the_answer() {
        let (mut peer, conn) = session(Role::Callee);
        peer.attach_tracks(&media()).await.unwrap();
        let offer = SessionDescription::offer("remote-offer");
        let first = peer.accept_offer(&offer).await.unwrap();
        let ops = conn.ops();
        let second = peer.accept_offer(&offer).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(conn.ops(), ops);

        let other = SessionDescription::offer("different");
        assert!(matches!(
            peer.accept_offer(&other).await,
            Err(CallError::SignalingProtocol(_))
        ));
    }

    #[tokio::test]
    async fn roles_decide_who_offers() {
        let (mut callee, _) = session(Role::Callee);
        assert!(matches!(
            callee.create_offer().await,
            Err(CallError::SignalingProtocol(_))
        ));

        let (mut caller, conn) = session(Role::Caller);
        caller.attach_tracks(&media()).await.unwrap();
        let err = caller
            .accept_offer(&SessionDescription::offer("glare"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::SignalingProtocol(_)));
        assert!(!conn.ops().iter().any(|op| op.starts_with("remote:")));
    }

    #[tokio::test]
    async fn answer_before_offer_is_a_protocol_error() {
        let (mut peer, _) = session(Role::Caller);
        let err = peer
            .accept_answer(&SessionDescription::answer("early"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::SignalingProtocol(_)));
    }

    #[tokio::test]
    async fn terminal_states_stick() {
        let (mut peer, conn) = session(Role::Caller);
        assert_eq!(peer.on_transport_state(TransportState::Connecting), Some(PeerState::Negotiating));
        assert_eq!(peer.on_transport_state(TransportState::Connected), Some(PeerState::Connected));
        assert_eq!(peer.on_transport_state(TransportState::Connected), None);
        assert_eq!(peer.on_transport_state(TransportState::Failed), Some(PeerState::Failed));
        assert_eq!(peer.on_transport_state(TransportState::Connected), None);

        peer.close().await;
        peer.close().await;
        assert_eq!(conn.ops().iter().filter(|op| *op == "close").count(), 1);
        assert!(peer.create_offer().await.is_err());
    }
}
