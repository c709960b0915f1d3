pub mod acquirer;
pub mod track;

pub use acquirer::{MediaAcquirer, MediaConstraints, SampleTrackAcquirer};
pub use track::{MediaTrack, MediaTrackSet, TrackKind};
