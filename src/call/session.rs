use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::state::CallState;
use crate::media::MediaTrackSet;
use crate::peer::{IceCandidate, PeerSession, RemoteStream, Role, SessionDescription};
use crate::signaling::SignalingAdapter;

/// Signals that arrived before the peer session could take them.
#[derive(Debug, Default)]
pub struct PendingSignals {
    offer: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
}

impl PendingSignals {
    /// Keeps the newest offer only.
    pub fn store_offer(&mut self, offer: SessionDescription) {
        if self.offer.replace(offer).is_some() {
            debug!("replacing previously buffered offer");
        }
    }

    pub fn take_offer(&mut self) -> Option<SessionDescription> {
        self.offer.take()
    }

    pub fn push_candidate(&mut self, candidate: IceCandidate) {
        self.candidates.push(candidate);
    }

    pub fn take_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.candidates)
    }

    pub fn has_offer(&self) -> bool {
        self.offer.is_some()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn clear(&mut self) {
        self.offer = None;
        self.candidates.clear();
    }
}

/// One call, owned by the coordinator from start until the next call.
pub(crate) struct CallSession {
    pub epoch: u64,
    pub remote_id: String,
    pub role: Role,
    pub is_audio_only: bool,
    pub state: CallState,
    pub liveness: CancellationToken,
    pub signaling: SignalingAdapter,
    pub media: Option<MediaTrackSet>,
    pub peer: Option<PeerSession>,
    pub pending: PendingSignals,
    pub remote_stream: Option<RemoteStream>,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub disconnect_timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallSession {
    pub fn new(
        epoch: u64,
        remote_id: String,
        role: Role,
        is_audio_only: bool,
        signaling: SignalingAdapter,
    ) -> Self {
        Self {
            epoch,
            remote_id,
            role,
            is_audio_only,
            state: CallState::Idle,
            liveness: CancellationToken::new(),
            signaling,
            media: None,
            peer: None,
            pending: PendingSignals::default(),
            remote_stream: None,
            audio_muted: false,
            video_muted: false,
            disconnect_timer: None,
            tasks: Vec::new(),
        }
    }

    /// Whether events for `epoch` still apply to this session.
    pub fn accepts(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.state != CallState::Ended && !self.liveness.is_cancelled()
    }

    pub fn track_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    pub fn cancel_disconnect_timer(&mut self) {
        if let Some(timer) = self.disconnect_timer.take() {
            debug!(remote = %self.remote_id, "aborting pending disconnect timer");
            timer.abort();
        }
    }

    pub fn apply_mute(&self) {
        if let Some(media) = &self.media {
            media.set_audio_enabled(!self.audio_muted);
            media.set_video_enabled(!self.video_muted);
        }
    }

    /// Stops tracks, closes the peer, drops pending signals and every task
    /// (relay subscription included).
    pub async fn release(&mut self) {
        self.liveness.cancel();
        self.cancel_disconnect_timer();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(media) = self.media.take() {
            media.stop_all();
        }
        if let Some(peer) = self.peer.as_mut() {
            peer.close().await;
        }
        self.pending.clear();
    }
}
