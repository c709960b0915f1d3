use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::track::{MediaTrack, MediaTrackSet, TrackKind};
use crate::error::MediaAccessError;
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub fn for_call(is_audio_only: bool) -> Self {
        Self {
            video: !is_audio_only,
            audio: true,
        }
    }
}

/// Obtains local capture. Implementations may wait on a user permission
/// prompt indefinitely; callers cancel from the outside instead of timing out.
#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaTrackSet, MediaAccessError>;
}

/// Produces webrtc-rs sample tracks (Opus audio, VP8 video) that the host
/// application feeds with encoded frames from its own capture pipeline.
#[derive(Debug, Clone)]
pub struct SampleTrackAcquirer {
    has_camera: bool,
    has_microphone: bool,
    permission_granted: bool,
}

impl Default for SampleTrackAcquirer {
    fn default() -> Self {
        Self {
            has_camera: true,
            has_microphone: true,
            permission_granted: true,
        }
    }
}

impl SampleTrackAcquirer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_camera(mut self) -> Self {
        self.has_camera = false;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.has_microphone = false;
        self
    }

    pub fn permission_denied(mut self) -> Self {
        self.permission_granted = false;
        self
    }

    fn sample_track(kind: TrackKind, stream_id: &str) -> MediaTrack {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let track_id = format!("{kind}-{}", random_id());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            track_id,
            stream_id.to_owned(),
        ));
        MediaTrack::with_rtc(kind, rtc)
    }
}

#[async_trait]
impl MediaAcquirer for SampleTrackAcquirer {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaTrackSet, MediaAccessError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaAccessError::Unsatisfiable(
                "at least one of audio or video must be requested".into(),
            ));
        }
        if !self.permission_granted {
            warn!("media permission denied");
            return Err(MediaAccessError::PermissionDenied);
        }
        if constraints.audio && !self.has_microphone {
            return Err(MediaAccessError::NoDevice(TrackKind::Audio));
        }
        if constraints.video && !self.has_camera {
            return Err(MediaAccessError::NoDevice(TrackKind::Video));
        }

        let stream_id = format!("local-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(Self::sample_track(TrackKind::Video, &stream_id));
        }
        if constraints.audio {
            tracks.push(Self::sample_track(TrackKind::Audio, &stream_id));
        }
        info!(
            stream = %stream_id,
            tracks = ?tracks.iter().map(|t| t.kind()).collect::<Vec<_>>(),
            "local media acquired"
        );
        Ok(MediaTrackSet::new(stream_id, tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn audio_only_call_gets_one_audio_track() {
        let set = SampleTrackAcquirer::new()
            .acquire(MediaConstraints::for_call(true))
            .await
            .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.tracks()[0].kind(), TrackKind::Audio);
        assert!(set.tracks()[0].rtc_track().is_some());
    }

    #[tokio::test]
    async fn video_call_tracks_share_one_stream() {
        let set = SampleTrackAcquirer::new()
            .acquire(MediaConstraints::for_call(false))
            .await
            .unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.tracks().iter().all(|t| t.stream_id() == set.stream_id()));
    }

    #[tokio::test]
    async fn missing_devices_and_denied_permission_fail() {
        let err = SampleTrackAcquirer::new()
            .without_camera()
            .acquire(MediaConstraints::for_call(false))
            .await
            .unwrap_err();
        assert_eq!(err, MediaAccessError::NoDevice(TrackKind::Video));

        // no camera is fine for audio-only
        assert!(SampleTrackAcquirer::new()
            .without_camera()
            .acquire(MediaConstraints::for_call(true))
            .await
            .is_ok());

        let err = SampleTrackAcquirer::new()
            .permission_denied()
            .acquire(MediaConstraints::for_call(true))
            .await
            .unwrap_err();
        assert_eq!(err, MediaAccessError::PermissionDenied);
    }

    #[tokio::test]
    async fn empty_constraints_are_unsatisfiable() {
        let err = SampleTrackAcquirer::new()
            .acquire(MediaConstraints {
                video: false,
                audio: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MediaAccessError::Unsatisfiable(_)));
    }
}
