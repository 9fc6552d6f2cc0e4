//! Aggregation of per-frame results into one verdict per video.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::ClassificationResult;
use crate::media::VideoMetadata;
use crate::{SensitivityLabel, SensitivityStatus, VideoStatus};

pub const FALLBACK_NOTE: &str = "REQUIRES REVIEW: Analysis failed - content marked sensitive.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameScores {
    pub flagged_frame_ratio: f64,
    pub flagged_frames: usize,
    pub analyzed_frames: usize,
    pub failed_frames: usize,
    pub total_frames: usize,
}

/// What the video record keeps of a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResults {
    pub confidence: u8,
    pub frames_analyzed: usize,
    pub scores: Option<FrameScores>,
    pub analysis_note: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateVerdict {
    pub ux_status: SensitivityLabel,
    pub db_status: SensitivityStatus,
    pub confidence: u8,
    pub scores: Option<FrameScores>,
    pub frames_analyzed: usize,
    pub metadata: VideoMetadata,
    pub analysis_note: String,
    /// Produced without a completed analysis.
    pub fallback: bool,
}

#[derive(Debug, Error, PartialEq)]
#[error("All frame analyses failed ({failed} failed).")]
pub struct AllFramesFailed {
    pub failed: usize,
}

impl AggregateVerdict {
    /// Conservative verdict for content that could not be analyzed:
    /// restricted until someone reviews it.
    pub fn fallback() -> Self {
        AggregateVerdict {
            ux_status: SensitivityLabel::Sensitive,
            db_status: SensitivityStatus::Flagged,
            confidence: 0,
            scores: None,
            frames_analyzed: 0,
            metadata: VideoMetadata::placeholder(),
            analysis_note: FALLBACK_NOTE.to_string(),
            fallback: true,
        }
    }

    pub fn is_sensitive(&self) -> bool {
        self.ux_status == SensitivityLabel::Sensitive
    }

    /// Status the record ends in.
    pub fn terminal_status(&self) -> VideoStatus {
        if self.fallback {
            VideoStatus::Flagged
        } else {
            VideoStatus::Completed
        }
    }

    pub fn analysis_results(&self) -> AnalysisResults {
        AnalysisResults {
            confidence: self.confidence,
            frames_analyzed: self.frames_analyzed,
            scores: self.scores.clone(),
            analysis_note: self.analysis_note.clone(),
        }
    }
}

/// Combine frame results. Failed frames count towards the total only; the
/// video is sensitive when strictly more than `flag_ratio` of the valid
/// frames were flagged.
pub fn aggregate(
    results: &[ClassificationResult],
    flag_ratio: f64,
    metadata: VideoMetadata,
) -> Result<AggregateVerdict, AllFramesFailed> {
    let valid: Vec<_> = results.iter().filter(|r| !r.failed).collect();
    let failed_frames = results.len() - valid.len();
    if valid.is_empty() {
        return Err(AllFramesFailed {
            failed: failed_frames,
        });
    }

    let flagged_frames = valid.iter().filter(|r| r.is_flagged).count();
    let flagged_frame_ratio = flagged_frames as f64 / valid.len() as f64;
    let is_sensitive = flagged_frame_ratio > flag_ratio;

    let confidence_sum: u32 = valid.iter().map(|r| r.confidence as u32).sum();
    let confidence = (confidence_sum as f64 / valid.len() as f64).round() as u8;

    let analysis_note = if is_sensitive {
        format!(
            "Sensitive content detected ({}/{} frames).",
            flagged_frames,
            valid.len()
        )
    } else {
        format!(
            "Content safe ({}/{} frames sensitive, {} failed).",
            flagged_frames,
            valid.len(),
            failed_frames
        )
    };

    let ux_status = SensitivityLabel::from_sensitive(is_sensitive);
    Ok(AggregateVerdict {
        ux_status,
        db_status: ux_status.stored(),
        confidence,
        scores: Some(FrameScores {
            flagged_frame_ratio,
            flagged_frames,
            analyzed_frames: valid.len(),
            failed_frames,
            total_frames: results.len(),
        }),
        frames_analyzed: valid.len(),
        metadata,
        analysis_note,
        fallback: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(pattern: &str) -> Vec<ClassificationResult> {
        pattern
            .chars()
            .enumerate()
            .map(|(i, c)| match c {
                'F' => ClassificationResult::analyzed(i + 1, true, 90),
                'S' => ClassificationResult::analyzed(i + 1, false, 80),
                _ => ClassificationResult::failed(i + 1),
            })
            .collect()
    }

    #[test]
    fn two_of_five_is_sensitive() {
        let verdict = aggregate(&frames("FFSSS"), 0.20, VideoMetadata::default()).unwrap();
        assert!(verdict.is_sensitive());
        assert_eq!(verdict.ux_status, SensitivityLabel::Sensitive);
        assert_eq!(verdict.db_status, SensitivityStatus::Flagged);
        assert_eq!(verdict.scores.as_ref().unwrap().flagged_frame_ratio, 0.4);
        assert_eq!(verdict.analysis_note, "Sensitive content detected (2/5 frames).");
        assert_eq!(verdict.terminal_status(), VideoStatus::Completed);
    }

    #[test]
    fn exactly_at_threshold_is_safe() {
        let verdict = aggregate(&frames("FSSSS"), 0.20, VideoMetadata::default()).unwrap();
        assert!(!verdict.is_sensitive());
        assert_eq!(verdict.db_status, SensitivityStatus::Safe);
        assert_eq!(
            verdict.analysis_note,
            "Content safe (1/5 frames sensitive, 0 failed)."
        );
    }

    #[test]
    fn failed_frames_leave_the_denominator() {
        // 1 flagged of 4 valid = 0.25 > 0.20, although 1/6 overall is not
        let verdict = aggregate(&frames("FSSSxx"), 0.20, VideoMetadata::default()).unwrap();
        assert!(verdict.is_sensitive());
        let scores = verdict.scores.unwrap();
        assert_eq!(scores.analyzed_frames, 4);
        assert_eq!(scores.failed_frames, 2);
        assert_eq!(scores.total_frames, 6);
        assert_eq!(verdict.frames_analyzed, 4);
    }

    #[test]
    fn confidence_is_rounded_mean() {
        let results = vec![
            ClassificationResult::analyzed(1, false, 80),
            ClassificationResult::analyzed(2, false, 85),
            ClassificationResult::failed(3),
        ];
        let verdict = aggregate(&results, 0.20, VideoMetadata::default()).unwrap();
        assert_eq!(verdict.confidence, 83);
    }

    #[test]
    fn all_failed_has_no_verdict() {
        let err = aggregate(&frames("xxxxxxxxxx"), 0.20, VideoMetadata::default()).unwrap_err();
        assert_eq!(err, AllFramesFailed { failed: 10 });
        assert!(err.to_string().to_lowercase().contains("all frame analyses failed"));
    }

    #[test]
    fn fallback_is_conservative() {
        let verdict = AggregateVerdict::fallback();
        assert!(verdict.is_sensitive());
        assert_eq!(verdict.confidence, 0);
        assert_eq!(verdict.terminal_status(), VideoStatus::Flagged);
        assert_eq!(verdict.metadata.width, Some(1920));
        assert!(verdict.analysis_note.contains("REQUIRES REVIEW"));
    }
}
