//! Queue and analysis configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::retry::RetryPolicy;

/// Frame classification is CPU-bound, more parallel jobs than this only
/// oversubscribe the host.
pub const MAX_CONCURRENCY: usize = 4;

const GIB: u64 = 1024 * 1024 * 1024;

/// Concurrency from host resources: one core left free, two GiB of memory
/// per job, never more than [`MAX_CONCURRENCY`].
pub fn optimal_concurrency(cpu_count: usize, total_memory_bytes: u64) -> usize {
    let cpu_limit = cpu_count.saturating_sub(1).max(1);
    let memory_limit = ((total_memory_bytes / GIB) / 2).max(1) as usize;
    cpu_limit.min(memory_limit).min(MAX_CONCURRENCY)
}

/// Inspect the host once and derive the concurrency limit.
pub fn detect_concurrency() -> usize {
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let system = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
    );
    optimal_concurrency(cpu_count, system.total_memory())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum jobs running at once.
    pub concurrency_limit: usize,
    /// An attempt running longer than this is abandoned.
    pub job_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl QueueConfig {
    /// Detect the concurrency limit from the host.
    pub fn detect() -> Self {
        Self::with_concurrency(detect_concurrency())
    }

    /// Explicit concurrency, still bounded to `1..=MAX_CONCURRENCY`.
    pub fn with_concurrency(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit: concurrency_limit.clamp(1, MAX_CONCURRENCY),
            job_timeout_secs: 30 * 60,
            retry: RetryPolicy::default(),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::detect()
    }
}

/// Minimum probability for a single unsafe label to flag a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelThreshold {
    pub label: String,
    pub min_probability: f32,
}

impl LabelThreshold {
    fn new(label: &str, min_probability: f32) -> Self {
        Self {
            label: label.to_string(),
            min_probability,
        }
    }
}

/// How classifier predictions turn into a per-frame and per-video decision.
///
/// The values are calibration constants carried over as-is, they are kept
/// configurable instead of being re-derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    /// A frame is flagged when the summed probability of all unsafe labels
    /// reaches this value.
    pub unsafe_sum: f32,
    /// Unsafe labels and the probability at which each flags a frame alone.
    pub unsafe_labels: Vec<LabelThreshold>,
    /// Labels counted towards the safe score.
    pub safe_labels: Vec<String>,
    /// A video is sensitive when the ratio of flagged valid frames is
    /// strictly greater than this.
    pub flagged_frame_ratio: f64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            unsafe_sum: 0.40,
            unsafe_labels: vec![
                LabelThreshold::new("porn", 0.25),
                LabelThreshold::new("hentai", 0.25),
                LabelThreshold::new("sexy", 0.35),
            ],
            safe_labels: vec!["neutral".into(), "drawing".into(), "drawings".into()],
            flagged_frame_ratio: 0.20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Parent of the per-job scratch directories holding extracted frames.
    pub scratch_dir: PathBuf,
    #[serde(default)]
    pub thresholds: ThresholdPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("vidguard"),
            thresholds: ThresholdPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_is_capped() {
        assert_eq!(optimal_concurrency(64, 256 * GIB), MAX_CONCURRENCY);
    }

    #[test]
    fn concurrency_leaves_a_core_free() {
        assert_eq!(optimal_concurrency(3, 64 * GIB), 2);
        assert_eq!(optimal_concurrency(1, 64 * GIB), 1);
        assert_eq!(optimal_concurrency(0, 64 * GIB), 1);
    }

    #[test]
    fn concurrency_follows_memory() {
        assert_eq!(optimal_concurrency(16, 4 * GIB), 2);
        assert_eq!(optimal_concurrency(16, GIB), 1);
        assert_eq!(optimal_concurrency(16, 512 * 1024 * 1024), 1);
    }

    #[test]
    fn detected_concurrency_in_bounds() {
        let limit = detect_concurrency();
        assert!((1..=MAX_CONCURRENCY).contains(&limit));
    }

    #[test]
    fn explicit_concurrency_is_clamped() {
        assert_eq!(QueueConfig::with_concurrency(0).concurrency_limit, 1);
        assert_eq!(QueueConfig::with_concurrency(16).concurrency_limit, 4);
        assert_eq!(
            QueueConfig::with_concurrency(3).job_timeout(),
            Duration::from_secs(1800)
        );
    }
}
