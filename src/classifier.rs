//! Per-frame content-safety classification.

use async_trait::async_trait;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::*;

use crate::config::ThresholdPolicy;
use crate::extractor::FrameSample;

/// Side of the square RGB image handed to the classifier.
pub const MODEL_INPUT_SIZE: u32 = 224;

/// Decoded frame, resized to the model input and stripped to packed RGB.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl PreparedFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let img = image::load_from_memory(bytes)?;
        let resized = img
            .resize_exact(MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, FilterType::Triangle)
            .to_rgb8();
        Ok(PreparedFrame {
            width: resized.width(),
            height: resized.height(),
            rgb: resized.into_raw(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(alias = "className")]
    pub label: String,
    pub probability: f32,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Classification failed: {0}")]
    Failed(String),
}

/// Injected safety-classification capability.
///
/// Implementations are treated as CPU/GPU bound: the pipeline calls them
/// one frame at a time.
#[async_trait]
pub trait SafetyClassifier: Send + Sync {
    /// Load whatever the classifier needs before the first frame.
    async fn warm_up(&self) -> Result<(), ClassifierError> {
        Ok(())
    }

    async fn classify(&self, frame: &PreparedFrame) -> Result<Vec<Prediction>, ClassifierError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationResult {
    pub frame_index: usize,
    pub failed: bool,
    pub is_flagged: bool,
    /// 0..=100
    pub confidence: u8,
}

impl ClassificationResult {
    pub fn failed(frame_index: usize) -> Self {
        Self {
            frame_index,
            failed: true,
            is_flagged: false,
            confidence: 0,
        }
    }

    pub fn analyzed(frame_index: usize, is_flagged: bool, confidence: u8) -> Self {
        Self {
            frame_index,
            failed: false,
            is_flagged,
            confidence,
        }
    }
}

impl ThresholdPolicy {
    /// Flag decision and confidence for one frame's predictions.
    pub fn evaluate(&self, predictions: &[Prediction]) -> (bool, u8) {
        let probability = |label: &str| -> f32 {
            predictions
                .iter()
                .filter(|p| p.label.eq_ignore_ascii_case(label))
                .map(|p| p.probability)
                .sum()
        };

        let unsafe_score: f32 = self
            .unsafe_labels
            .iter()
            .map(|t| probability(&t.label))
            .sum();
        let safe_score: f32 = self.safe_labels.iter().map(|l| probability(l)).sum();

        let is_flagged = unsafe_score >= self.unsafe_sum
            || self
                .unsafe_labels
                .iter()
                .any(|t| probability(&t.label) >= t.min_probability);

        let confidence = (unsafe_score.max(safe_score) * 100.0).round().clamp(0.0, 100.0) as u8;
        (is_flagged, confidence)
    }
}

/// Reads a sampled frame, prepares it and runs the injected classifier.
pub struct FrameClassifier {
    capability: Arc<dyn SafetyClassifier>,
    policy: ThresholdPolicy,
}

impl FrameClassifier {
    pub fn new(capability: Arc<dyn SafetyClassifier>, policy: ThresholdPolicy) -> Self {
        Self { capability, policy }
    }

    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }

    pub async fn ready(&self) -> Result<(), ClassifierError> {
        self.capability.warm_up().await
    }

    /// Never fails: unreadable frames and classifier errors yield a result
    /// marked `failed`.
    #[instrument(skip(self, sample), fields(frame = sample.index))]
    pub async fn classify(&self, sample: &FrameSample) -> ClassificationResult {
        let bytes = match tokio::fs::read(&sample.path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(message = "Frame file unreadable", path = ?sample.path, error = %err);
                return ClassificationResult::failed(sample.index);
            }
        };

        let frame = match tokio::task::spawn_blocking(move || PreparedFrame::decode(&bytes)).await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                warn!(message = "Frame could not be decoded", path = ?sample.path, error = %err);
                return ClassificationResult::failed(sample.index);
            }
            Err(err) => {
                error!(message = "Frame decoding task failed", error = %err);
                return ClassificationResult::failed(sample.index);
            }
        };

        match self.capability.classify(&frame).await {
            Ok(predictions) => {
                let (is_flagged, confidence) = self.policy.evaluate(&predictions);
                trace!(is_flagged, confidence);
                ClassificationResult::analyzed(sample.index, is_flagged, confidence)
            }
            Err(err) => {
                warn!(message = "Frame classification failed", error = %err);
                ClassificationResult::failed(sample.index)
            }
        }
    }
}

/// [`SafetyClassifier`] delegating to an external program.
///
/// The program receives the prepared frame as raw RGB24 on stdin, with its
/// dimensions as `--width`/`--height`, and prints a JSON array of
/// `{"label": ..., "probability": ...}` on stdout.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
}

impl CommandClassifier {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl SafetyClassifier for CommandClassifier {
    async fn warm_up(&self) -> Result<(), ClassifierError> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--help")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ClassifierError::Unavailable(format!("{}: {}", self.program, e)))?;
        if !status.success() {
            return Err(ClassifierError::Unavailable(format!(
                "{} exited with {}",
                self.program, status
            )));
        }
        Ok(())
    }

    async fn classify(&self, frame: &PreparedFrame) -> Result<Vec<Prediction>, ClassifierError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args([
                "--width",
                &frame.width.to_string(),
                "--height",
                &frame.height.to_string(),
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClassifierError::Unavailable(format!("{}: {}", self.program, e)))?;

        // Feed stdin while draining stdout and stderr, or a chatty child
        // fills its pipes and both sides block.
        let stdin = child.stdin.take();
        let feed = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&frame.rgb).await,
                None => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output = output.map_err(|e| ClassifierError::Failed(e.to_string()))?;
        if !output.status.success() {
            return Err(ClassifierError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        fed.map_err(|e| ClassifierError::Failed(e.to_string()))?;

        serde_json::from_slice(&output.stdout).map_err(|e| ClassifierError::Failed(e.to_string()))
    }
}
