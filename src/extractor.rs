//! Evenly spaced still-frame sampling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::*;

use crate::media::MediaProbe;

pub const MIN_FRAMES: usize = 5;
pub const MAX_FRAMES: usize = 20;
/// Frame count used when the duration is unknown.
pub const DEFAULT_FRAMES: usize = 10;
const SECONDS_PER_FRAME: f64 = 5.0;
/// Distance kept from both ends of the clip, skipping black leader and
/// trailer frames.
const EDGE_GUARD_SECS: f64 = 1.0;

/// One still image on disk, owned by the run's scratch directory.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSample {
    /// 1-based position in the sampling order.
    pub index: usize,
    pub timestamp_secs: f64,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("No frames extracted from video ({attempted} attempted)")]
    NoFrames { attempted: usize },
}

/// One frame per five seconds, between [`MIN_FRAMES`] and [`MAX_FRAMES`].
pub fn frame_count(duration_secs: Option<f64>) -> usize {
    match duration_secs {
        Some(d) if d.is_finite() && d > 0.0 => {
            ((d / SECONDS_PER_FRAME).floor() as usize).clamp(MIN_FRAMES, MAX_FRAMES)
        }
        _ => DEFAULT_FRAMES,
    }
}

/// `count` interior points of the guarded window `[1s, duration - 1s]`.
/// Clips shorter than the guard still get a one second window.
pub fn sample_timestamps(duration_secs: f64, count: usize) -> Vec<f64> {
    let start = EDGE_GUARD_SECS;
    let end = (duration_secs - EDGE_GUARD_SECS).max(start + 1.0);
    let interval = (end - start) / (count as f64 + 1.0);
    (1..=count).map(|i| start + interval * i as f64).collect()
}

pub struct FrameExtractor {
    media: Arc<dyn MediaProbe>,
}

impl FrameExtractor {
    pub fn new(media: Arc<dyn MediaProbe>) -> Self {
        Self { media }
    }

    /// Extract `count` frames into `out_dir`. Frames that fail are skipped,
    /// only an empty result is an error.
    #[instrument(skip(self, out_dir))]
    pub async fn extract(
        &self,
        video: &Path,
        duration_secs: f64,
        count: usize,
        out_dir: &Path,
    ) -> Result<Vec<FrameSample>, ExtractError> {
        let mut samples = Vec::with_capacity(count);

        for (i, timestamp_secs) in sample_timestamps(duration_secs, count)
            .into_iter()
            .enumerate()
        {
            let index = i + 1;
            let path = out_dir.join(format!("frame_{index}.jpg"));
            match self.media.extract_frame(video, timestamp_secs, &path).await {
                Ok(()) => samples.push(FrameSample {
                    index,
                    timestamp_secs,
                    path,
                }),
                Err(err) => {
                    warn!(message = "Failed to extract frame", index, timestamp_secs, error = %err);
                }
            }
        }

        if samples.is_empty() {
            return Err(ExtractError::NoFrames { attempted: count });
        }

        debug!(message = "Extracted frames", extracted = samples.len(), requested = count);
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFrame, FakeMedia};

    #[test]
    fn frame_count_is_clamped() {
        assert_eq!(frame_count(Some(3.0)), 5);
        assert_eq!(frame_count(Some(25.0)), 5);
        assert_eq!(frame_count(Some(54.9)), 10);
        assert_eq!(frame_count(Some(100.0)), 20);
        assert_eq!(frame_count(Some(3600.0)), 20);
        assert_eq!(frame_count(None), DEFAULT_FRAMES);
        assert_eq!(frame_count(Some(f64::NAN)), DEFAULT_FRAMES);
    }

    #[test]
    fn timestamps_avoid_clip_edges() {
        let ts = sample_timestamps(62.0, 5);
        assert_eq!(ts.len(), 5);
        // window [1, 61] split into six intervals of 10s
        assert_eq!(ts, vec![11.0, 21.0, 31.0, 41.0, 51.0]);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn short_clip_keeps_minimum_window() {
        let ts = sample_timestamps(1.5, 5);
        assert!(ts.iter().all(|t| *t > 1.0 && *t < 2.0));
    }

    #[tokio::test]
    async fn skips_failed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let media = FakeMedia::new(30.0).with_frame(2, FakeFrame::Missing);
        let extractor = FrameExtractor::new(Arc::new(media));

        let samples = extractor
            .extract(Path::new("/videos/a.mp4"), 30.0, 5, dir.path())
            .await
            .unwrap();

        let indices: Vec<_> = samples.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 3, 4, 5]);
        assert!(samples.iter().all(|s| s.path.exists()));
    }

    #[tokio::test]
    async fn no_frames_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let media = FakeMedia::new(30.0).with_all_frames(FakeFrame::Missing);
        let extractor = FrameExtractor::new(Arc::new(media));

        let err = extractor
            .extract(Path::new("/videos/a.mp4"), 30.0, 5, dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().to_lowercase().contains("no frames extracted"));
    }
}
