//! Coordinates one peer-to-peer audio/video call between two participants
//! over a signaling relay: local media acquisition, the offer/answer
//! exchange, ICE candidate trickling and teardown.
//!
//! ```no_run
//! use std::sync::Arc;
//! use call_session::{CallConfig, CallCoordinator, CallEvent, MemoryRelayHub};
//!
//! # async fn demo() -> call_session::Result<()> {
//! call_session::logger::init();
//! let hub = MemoryRelayHub::new();
//! let relay = Arc::new(hub.endpoint("user-A"));
//! let (call, mut events) = CallCoordinator::spawn_webrtc(CallConfig::from_env()?, relay)?;
//! call.start_outgoing_call("user-B", false)?;
//! while let Some(event) = events.recv().await {
//!     if let CallEvent::Ended(reason) = event {
//!         println!("call ended: {reason:?}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod utils;

pub use call::{CallCoordinator, CallEvent, CallEvents, CallHandle, CallState, EndReason};
pub use config::{CallConfig, IceServerConfig, IceServerKind};
pub use error::{CallError, MediaAccessError, RelayError, Result};
pub use media::{MediaAcquirer, MediaConstraints, MediaTrack, MediaTrackSet, SampleTrackAcquirer, TrackKind};
pub use peer::{PeerConnection, PeerConnector, PeerEvent, PeerState, RemoteStream, Role, RtcPeerConnector};
pub use signaling::{MemoryRelayHub, SignalPayload, SignalingRelay, WebSocketRelay};
