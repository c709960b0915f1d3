use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::Result;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

impl TrackKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    stream_id: String,
    enabled: AtomicBool,
    live: AtomicBool,
    rtc: Option<Arc<TrackLocalStaticSample>>,
}

/// Handle to one local capture track. Clones share state, so a preview
/// handle observes mute and stop done by the owning session.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl MediaTrack {
    /// Track without a webrtc-rs sample writer behind it.
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self::build(id.into(), kind, stream_id.into(), None)
    }

    pub fn with_rtc(kind: TrackKind, rtc: Arc<TrackLocalStaticSample>) -> Self {
        use webrtc::track::track_local::TrackLocal;
        let id = rtc.id().to_string();
        let stream_id = rtc.stream_id().to_string();
        Self::build(id, kind, stream_id, Some(rtc))
    }

    fn build(
        id: String,
        kind: TrackKind,
        stream_id: String,
        rtc: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                stream_id,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                rtc,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.inner.rtc.clone()
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Releases the capture. Idempotent.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::AcqRel) {
            debug!(track = %self.inner.id, kind = %self.inner.kind, "track stopped");
        }
    }

    /// Pushes one encoded frame. Returns false when the sample was dropped
    /// because the track is stopped, muted or has no writer.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        let Some(rtc) = &self.inner.rtc else {
            return Ok(false);
        };
        rtc.write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await?;
        Ok(true)
    }
}

/// Tracks owned by one call session. Dropping the set stops every track.
#[derive(Debug)]
pub struct MediaTrackSet {
    stream_id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaTrackSet {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn of_kind(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Shared handles for a local preview surface.
    pub fn preview(&self) -> Vec<MediaTrack> {
        self.tracks.clone()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.of_kind(TrackKind::Audio).for_each(|t| t.set_enabled(enabled));
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.of_kind(TrackKind::Video).for_each(|t| t.set_enabled(enabled));
    }

    pub fn live_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for MediaTrackSet {
    fn drop(&mut self) {
        self.stop_all();
    }
}
