//! Fakes shared by the unit tests.

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::classifier::{ClassifierError, PreparedFrame, Prediction, SafetyClassifier};
use crate::media::{MediaError, MediaProbe, VideoMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFrame {
    Safe,
    Unsafe,
    /// Written to disk but not an image.
    Corrupt,
    /// Extraction fails.
    Missing,
}

pub fn write_frame(path: &Path, frame: FakeFrame) {
    match frame {
        FakeFrame::Safe => RgbImage::from_pixel(32, 24, Rgb([0, 0, 255])).save(path).unwrap(),
        FakeFrame::Unsafe => RgbImage::from_pixel(32, 24, Rgb([255, 0, 0])).save(path).unwrap(),
        FakeFrame::Corrupt => std::fs::write(path, b"not an image").unwrap(),
        FakeFrame::Missing => {}
    }
}

pub struct FakeMedia {
    duration: Option<f64>,
    available: bool,
    probe_error: Option<String>,
    default_frame: FakeFrame,
    frames: HashMap<usize, FakeFrame>,
}

impl FakeMedia {
    pub fn new(duration: f64) -> Self {
        Self {
            duration: Some(duration),
            available: true,
            probe_error: None,
            default_frame: FakeFrame::Safe,
            frames: HashMap::new(),
        }
    }

    pub fn unknown_duration(mut self) -> Self {
        self.duration = None;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn failing_probe(mut self, message: &str) -> Self {
        self.probe_error = Some(message.to_string());
        self
    }

    pub fn with_frame(mut self, index: usize, frame: FakeFrame) -> Self {
        self.frames.insert(index, frame);
        self
    }

    pub fn with_all_frames(mut self, frame: FakeFrame) -> Self {
        self.default_frame = frame;
        self.frames.clear();
        self
    }

    /// Frame `i + 1` gets `frames[i]`.
    pub fn with_frames(mut self, frames: &[FakeFrame]) -> Self {
        for (i, frame) in frames.iter().enumerate() {
            self.frames.insert(i + 1, *frame);
        }
        self
    }
}

#[async_trait]
impl MediaProbe for FakeMedia {
    async fn check_available(&self) -> bool {
        self.available
    }

    async fn probe(&self, _path: &Path) -> Result<VideoMetadata, MediaError> {
        if let Some(stderr) = &self.probe_error {
            return Err(MediaError::Failed {
                program: "ffprobe".into(),
                code: 1,
                stderr: stderr.clone(),
            });
        }
        Ok(VideoMetadata {
            width: Some(640),
            height: Some(360),
            duration: self.duration,
            bitrate: Some(800_000),
            codec: Some("h264".into()),
            ..Default::default()
        })
    }

    async fn extract_frame(
        &self,
        _path: &Path,
        _timestamp_secs: f64,
        output: &Path,
    ) -> Result<(), MediaError> {
        let index: usize = output
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("frame_"))
            .and_then(|s| s.parse().ok())
            .unwrap();
        let frame = self.frames.get(&index).copied().unwrap_or(self.default_frame);
        if frame == FakeFrame::Missing {
            return Err(MediaError::MissingOutput(output.to_path_buf()));
        }
        write_frame(output, frame);
        Ok(())
    }
}

/// Red frames are unsafe, anything else is neutral.
#[derive(Default)]
pub struct FakeClassifier {
    pub unavailable: bool,
    /// `classify` never returns.
    pub hang: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl SafetyClassifier for FakeClassifier {
    async fn warm_up(&self) -> Result<(), ClassifierError> {
        if self.unavailable {
            return Err(ClassifierError::Unavailable(
                "model could not be loaded from any source".into(),
            ));
        }
        Ok(())
    }

    async fn classify(&self, frame: &PreparedFrame) -> Result<Vec<Prediction>, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            futures::future::pending::<()>().await;
        }
        let pixels = (frame.rgb.len() / 3).max(1) as u64;
        let red: u64 = frame.rgb.chunks(3).map(|px| px[0] as u64).sum::<u64>() / pixels;
        let blue: u64 = frame.rgb.chunks(3).map(|px| px[2] as u64).sum::<u64>() / pixels;

        let (unsafe_p, neutral_p) = if red > blue { (0.9, 0.1) } else { (0.05, 0.95) };
        Ok(vec![
            Prediction {
                label: "Porn".into(),
                probability: unsafe_p,
            },
            Prediction {
                label: "Neutral".into(),
                probability: neutral_p,
            },
        ])
    }
}
