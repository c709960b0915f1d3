use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::types::{IceCandidate, PeerEvent, RemoteTrack, SessionDescription, TransportState};
use crate::config::{CallConfig, IceServerConfig};
use crate::error::{CallError, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{MediaTrack, TrackKind};

/// One peer-to-peer connection as seen by the session state machine.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates peer connections. Backend events go to `events` until the
/// connection is closed.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// webrtc-rs backed connector
#[derive(Debug, Clone)]
pub struct RtcPeerConnector {
    ice_servers: Vec<IceServerConfig>,
    ice_candidate_pool_size: u8,
}

impl RtcPeerConnector {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.effective_ice_servers(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
        }
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn connect(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = rtc_config(&self.ice_servers, self.ice_candidate_pool_size);
        info!(
            remote = remote_id,
            ice_servers = config.ice_servers.len(),
            "creating peer connection"
        );
        let pc = Arc::new(api.new_peer_connection(config).await?);
        wire_events(&pc, remote_id, events);

        Ok(Arc::new(RtcPeerConnection { pc }))
    }
}

fn wire_events(pc: &Arc<RTCPeerConnection>, remote_id: &str, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    let remote = remote_id.to_owned();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        let remote = remote.clone();
        Box::pin(async move {
            let Some(c) = cand else {
                // None marks the end of gathering
                debug!(remote = %remote, "ICE candidate gathering completed");
                return;
            };
            match c.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate::from(init);
                    dump_candidate("LOCAL", &remote, &candidate);
                    let _ = tx.send(PeerEvent::LocalCandidate(candidate));
                }
                Err(e) => warn!(remote = %remote, "could not serialize local candidate: {e}"),
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            match TrackKind::from_codec_type(track.kind()) {
                Some(kind) => {
                    let remote_track = RemoteTrack {
                        id: track.id(),
                        kind,
                        stream_id: track.stream_id(),
                    };
                    info!(track = %remote_track.id, %kind, "remote track arrived");
                    let _ = tx.send(PeerEvent::RemoteTrack(remote_track));
                }
                None => warn!("ignoring remote track of unspecified kind"),
            }
            Box::pin(async {})
        },
    ));

    let tx = events;
    let pc_stats: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!("peer connection state changed to: {:?}", st);
        if st == RTCPeerConnectionState::Failed || st == RTCPeerConnectionState::Disconnected {
            if let Some(pc) = pc_stats.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        let _ = tx.send(PeerEvent::StateChanged(TransportState::from(st)));
        Box::pin(async {})
    }));
}

/// Peer connection configuration
fn rtc_config(servers: &[IceServerConfig], pool_size: u8) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(servers),
        ice_candidate_pool_size: pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![config.normalized_url()],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let rtc = track.rtc_track().ok_or_else(|| {
            CallError::InvalidState(format!("track {} has no sample writer", track.id()))
        })?;
        let sender = self
            .pc
            .add_track(rtc as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        SessionDescription::try_from(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        SessionDescription::try_from(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.clone().into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
