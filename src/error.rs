use crate::media::TrackKind;
use thiserror::Error;

/// Local capture could not be obtained.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission to use media devices was denied")]
    PermissionDenied,

    #[error("no {0} capture device is available")]
    NoDevice(TrackKind),

    #[error("media constraints cannot be satisfied: {0}")]
    Unsatisfiable(String),
}

/// Failures of the signaling relay channel itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay is not connected")]
    NotConnected,

    #[error("relay channel closed")]
    ChannelClosed,

    #[error("relay setup failed: {0}")]
    Setup(String),

    #[error("unknown relay participant: {0}")]
    UnknownParticipant(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("media access failed: {0}")]
    MediaAccess(#[from] MediaAccessError),

    /// Offer/answer received or attempted in the wrong state (glare included).
    #[error("signaling protocol violation: {0}")]
    SignalingProtocol(String),

    #[error("peer connection failed: {0}")]
    PeerConnectionFailure(String),

    /// An offer arrived before local media was attached.
    #[error("local media is not attached yet")]
    MediaNotReady,

    #[error("negotiating without any local media track")]
    NoLocalMedia,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("webrtc error: {0}")]
    Rtc(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("call coordinator has shut down")]
    CoordinatorClosed,
}

impl CallError {
    /// Whether the active session has to be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::MediaAccess(_) | CallError::PeerConnectionFailure(_)
        )
    }
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        CallError::Rtc(e.to_string())
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        CallError::Serialization(e.to_string())
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_media_and_connection_failures_are_fatal() {
        assert!(CallError::from(MediaAccessError::PermissionDenied).is_fatal());
        assert!(CallError::PeerConnectionFailure("ice".into()).is_fatal());
        assert!(!CallError::SignalingProtocol("glare".into()).is_fatal());
        assert!(!CallError::NoLocalMedia.is_fatal());
        assert!(!CallError::Relay(RelayError::NotConnected).is_fatal());
    }

    #[test]
    fn media_error_message_names_the_device() {
        let err = MediaAccessError::NoDevice(TrackKind::Video);
        assert_eq!(err.to_string(), "no video capture device is available");
    }
}
