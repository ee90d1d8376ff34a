//! Local media: track kinds, the track abstraction, and device acquisition.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::MediaAcquisitionError;

/// What a producer publishes. Screen share travels as a video track and is
/// distinguished only by `appData.mediaType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl MediaKind {
    pub fn track_kind(self) -> TrackKind {
        match self {
            MediaKind::Audio => TrackKind::Audio,
            MediaKind::Video | MediaKind::Screen => TrackKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Screen => "screen",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of the underlying RTP track as negotiated with the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<TrackKind> for MediaKind {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => MediaKind::Audio,
            TrackKind::Video => MediaKind::Video,
        }
    }
}

/// A live local or remote media track.
///
/// `stop` releases the underlying capture device (or the receiver for remote
/// tracks) and must be idempotent.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    fn is_stopped(&self) -> bool;

    /// Resolves once the track has ended, whether stopped here or by its
    /// source (a display capture closed from the system picker). `None` when
    /// the backend cannot report it.
    fn ended(&self) -> Option<BoxFuture<'static, ()>> {
        None
    }
}

pub type TrackRef = Arc<dyn MediaTrack>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub min_width: u32,
    pub ideal_height: u32,
    pub min_height: u32,
    pub ideal_frame_rate: u32,
    pub min_frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1920,
            min_width: 1280,
            ideal_height: 1080,
            min_height: 720,
            ideal_frame_rate: 60,
            min_frame_rate: 30,
        }
    }
}

impl VideoConstraints {
    /// Lower each floor to its ideal so a smaller requested size stays satisfiable.
    pub fn with_floors_capped(self) -> Self {
        Self {
            min_width: self.min_width.min(self.ideal_width),
            min_height: self.min_height.min(self.ideal_height),
            min_frame_rate: self.min_frame_rate.min(self.ideal_frame_rate),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub video_constraints: VideoConstraints,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            video_constraints: VideoConstraints::default(),
        }
    }
}

impl MediaConstraints {
    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

/// Tracks returned by a camera/microphone acquisition.
#[derive(Debug, Default, Clone)]
pub struct LocalMedia {
    pub audio: Option<TrackRef>,
    pub video: Option<TrackRef>,
}

impl LocalMedia {
    pub fn into_tracks(self) -> Vec<(MediaKind, TrackRef)> {
        let mut tracks = Vec::new();
        if let Some(track) = self.audio {
            tracks.push((MediaKind::Audio, track));
        }
        if let Some(track) = self.video {
            tracks.push((MediaKind::Video, track));
        }
        tracks
    }

    pub fn stop(&self) {
        for track in self.audio.iter().chain(self.video.iter()) {
            track.stop();
        }
    }
}

/// Device acquisition seam (camera, microphone, display capture).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, MediaAcquisitionError>;

    async fn display_media(&self) -> Result<TrackRef, MediaAcquisitionError>;
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Renderable grouping of received tracks.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<TrackRef>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self {
            id: format!("stream-{}", NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(track: TrackRef) -> Self {
        let mut stream = Self::new();
        stream.add_track(track);
        stream
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_track(&mut self, track: TrackRef) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    pub fn tracks(&self) -> &[TrackRef] {
        &self.tracks
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}
