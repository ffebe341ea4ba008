//! Hardware-free media source

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    FrameSource, LocalStream, LocalTrack, MediaConstraints, MediaError, MediaFrame, MediaSource,
    TrackKind,
};

/// Opus packet carrying 20 ms of silence
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME: Duration = Duration::from_millis(20);

/// Frame rate of the synthetic camera
const TEST_PATTERN_FPS: u32 = 15;

/// Opus silence, one packet every 20 ms
#[derive(Debug, Clone, Copy, Default)]
pub struct SilenceFrames;

impl FrameSource for SilenceFrames {
    fn next_frame(&self) -> MediaFrame {
        MediaFrame {
            data: Bytes::from_static(&OPUS_SILENCE),
            duration: OPUS_FRAME,
        }
    }
}

/// VP8 key frames of a blank picture
#[derive(Debug, Clone)]
pub struct TestPatternFrames {
    frame: Bytes,
    duration: Duration,
}

impl TestPatternFrames {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            frame: vp8_key_frame(width, height),
            duration: Duration::from_micros(1_000_000 / u64::from(fps.max(1))),
        }
    }
}

impl FrameSource for TestPatternFrames {
    fn next_frame(&self) -> MediaFrame {
        MediaFrame {
            data: self.frame.clone(),
            duration: self.duration,
        }
    }
}

/// Key frame header for `width`x`height` followed by a zeroed first partition
fn vp8_key_frame(width: u32, height: u32) -> Bytes {
    const PARTITION_LEN: u32 = 32;

    // Frame tag: key frame (bit 0 clear), version 0, show_frame, partition size
    let tag = (1 << 4) | (PARTITION_LEN << 5);
    let mut frame = Vec::with_capacity(10 + PARTITION_LEN as usize);
    frame.extend_from_slice(&tag.to_le_bytes()[..3]);
    frame.extend_from_slice(&[0x9d, 0x01, 0x2a]);
    // 14-bit dimensions, no scaling
    frame.extend_from_slice(&((width & 0x3fff) as u16).to_le_bytes());
    frame.extend_from_slice(&((height & 0x3fff) as u16).to_le_bytes());
    frame.resize(frame.len() + PARTITION_LEN as usize, 0);
    Bytes::from(frame)
}

/// Media source that fabricates tracks instead of opening devices
#[derive(Debug, Clone)]
pub struct SyntheticMediaSource {
    has_camera: bool,
    has_microphone: bool,
    failure: Option<MediaError>,
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self {
            has_camera: true,
            has_microphone: true,
            failure: None,
        }
    }
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend no camera is attached
    pub fn without_camera(mut self) -> Self {
        self.has_camera = false;
        self
    }

    /// Pretend no microphone is attached
    pub fn without_microphone(mut self) -> Self {
        self.has_microphone = false;
        self
    }

    /// Fail every acquisition with `error`
    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if let Some(error) = &self.failure {
            warn!("Synthetic media acquisition failing: {}", error);
            return Err(error.clone());
        }

        if (constraints.video && !self.has_camera) || (constraints.audio && !self.has_microphone)
        {
            return Err(MediaError::NotFound);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(
                LocalTrack::new(TrackKind::Audio, "synthetic-microphone")
                    .with_frames(Arc::new(SilenceFrames)),
            ));
        }
        if constraints.video {
            let frames = TestPatternFrames::new(
                constraints.ideal_width,
                constraints.ideal_height,
                TEST_PATTERN_FPS,
            );
            tracks.push(Arc::new(
                LocalTrack::new(
                    TrackKind::Video,
                    format!(
                        "synthetic-camera {}x{}",
                        constraints.ideal_width, constraints.ideal_height
                    ),
                )
                .with_frames(Arc::new(frames)),
            ));
        }

        debug!("Synthetic media acquired: {} tracks", tracks.len());
        Ok(LocalStream::new(tracks))
    }
}
