//! Local camera/microphone source and remote stream bookkeeping
//!
//! Mute and camera-off only flip a track's `enabled` flag. Tracks are stopped
//! exactly once, at teardown; stopping mid-call would change the negotiated
//! track set.

pub mod frames;
pub mod synthetic;

pub use frames::{pump_frames, FrameSink, FrameSource, MediaFrame};
pub use synthetic::SyntheticMediaSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Media acquisition errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Permission to use camera or microphone was denied")]
    PermissionDenied,
    #[error("No camera or microphone found")]
    NotFound,
    #[error("Media acquisition failed: {0}")]
    Unknown(String),
}

/// Track media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Camera facing mode hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

/// Capture constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Request a camera track
    pub video: bool,
    /// Request a microphone track
    pub audio: bool,
    /// Ideal capture width
    pub ideal_width: u32,
    /// Ideal capture height
    pub ideal_height: u32,
    pub facing_mode: FacingMode,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            ideal_width: 480,
            ideal_height: 360,
            facing_mode: FacingMode::User,
        }
    }
}

/// A captured local track
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    frames: Option<Arc<dyn FrameSource>>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .field("has_frames", &self.frames.is_some())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            frames: None,
        }
    }

    /// Attach the encoder output feeding this track
    pub fn with_frames(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn frame_source(&self) -> Option<Arc<dyn FrameSource>> {
        self.frames.clone()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the track. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }
}

/// Local stream: the tracks acquired for one call
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Flip the audio track. Returns the new muted state, or None without audio.
    pub fn toggle_mute(&self) -> Option<bool> {
        self.audio_track().map(|track| {
            track.set_enabled(!track.is_enabled());
            !track.is_enabled()
        })
    }

    /// Flip the video track. Returns the new camera-off state, or None without video.
    pub fn toggle_camera(&self) -> Option<bool> {
        self.video_track().map(|track| {
            track.set_enabled(!track.is_enabled());
            !track.is_enabled()
        })
    }

    /// Stop every track, returning how many were still live
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Source of local media
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire camera and microphone. Never retries.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Remote tracks grouped into one logical stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Add a track. Returns true if the composition changed.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}
