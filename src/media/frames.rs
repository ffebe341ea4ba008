//! Encoded frame pacing for local tracks

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::LocalTrack;
use crate::error::Result;

/// Lower bound on the pause between two frames
const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(5);

/// One encoded media frame
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    /// Playout duration, also the pacing interval
    pub duration: Duration,
}

/// Produces encoded frames for a local track
pub trait FrameSource: Send + Sync {
    fn next_frame(&self) -> MediaFrame;
}

/// Destination for encoded frames (an RTP sample track)
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn write_frame(&self, frame: &MediaFrame) -> Result<()>;
}

/// Feed a track's frames into `sink` at the frames' own pace.
///
/// Frames produced while the track is disabled are dropped. Returns the number
/// of frames written once the track is stopped.
pub async fn pump_frames(track: Arc<LocalTrack>, sink: Arc<dyn FrameSink>) -> u64 {
    let Some(source) = track.frame_source() else {
        return 0;
    };

    let mut written = 0u64;
    let mut skipped = 0u64;
    while !track.is_stopped() {
        let frame = source.next_frame();
        if track.is_enabled() {
            match sink.write_frame(&frame).await {
                Ok(()) => written += 1,
                Err(e) => debug!("Failed to write {} frame: {}", track.kind(), e),
            }
        } else {
            skipped += 1;
        }
        tokio::time::sleep(frame.duration.max(MIN_FRAME_INTERVAL)).await;
    }

    debug!(
        "{} track {} sender stopped ({} written, {} skipped while disabled)",
        track.kind(),
        track.id(),
        written,
        skipped
    );
    written
}
