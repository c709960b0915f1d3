pub mod connection;
pub mod ice;
pub mod session;
pub mod types;

pub use connection::{PeerConnection, PeerConnector, RtcPeerConnector};
pub use ice::PendingCandidates;
pub use session::PeerSession;
pub use types::{
    IceCandidate, PeerEvent, PeerState, RemoteStream, RemoteTrack, Role, SdpKind,
    SessionDescription, TransportState,
};
