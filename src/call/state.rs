use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::media::MediaTrack;
use crate::peer::{PeerState, RemoteStream};

/// Coordinator lifecycle, ordered by how far a call has progressed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Idle,
    AwaitingMedia,
    Negotiating,
    Connected,
    Ended,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// `end_call` from the UI.
    HungUp,
    MediaAccess,
    ConnectionFailed,
    /// The peer connection closed underneath us.
    RemoteClosed,
    /// A new call was started while this one was active.
    Replaced,
    /// Every handle to the coordinator was dropped.
    Shutdown,
}

/// Everything the UI layer is told about the active call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    ConnectionStateChanged(PeerState),
    /// Local tracks for a preview surface.
    LocalMediaReady(Vec<MediaTrack>),
    /// Fires once per call, on the first remote track.
    RemoteStreamArrived(RemoteStream),
    SignalingConnected,
    SignalingDisconnected,
    Error(CallError),
    Ended(EndReason),
}
