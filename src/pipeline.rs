//! Per-job analysis: metadata, frame sampling, classification and verdict.
//!
//! Progress checkpoints: 0 start, 10 validated, 25 metadata, 40 analysis
//! starting, 45 extraction, 55 classification, 55..=80 one step per frame,
//! 90 finalizing, 100 done.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::*;
use uuid::Uuid;

use crate::classifier::{FrameClassifier, SafetyClassifier};
use crate::config::AnalysisConfig;
use crate::extractor::{frame_count, ExtractError, FrameExtractor};
use crate::media::{MediaError, MediaProbe, VideoMetadata};
use crate::notifier::{Notification, NotificationEvent, ProgressNotifier};
use crate::store::{StoreError, VideoRecord, VideoStore};
use crate::verdict::{aggregate, AggregateVerdict, AllFramesFailed};
use crate::worker::JobRunner;
use crate::{Job, VideoStatus};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("FFmpeg is not installed. Please install FFmpeg to enable video analysis.")]
    ToolingUnavailable,

    #[error("Video file not found")]
    FileNotFound(PathBuf),

    #[error("Failed to read video metadata: {0}")]
    Probe(#[from] MediaError),

    #[error("Video duration could not be determined")]
    UnknownDuration,

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error(transparent)]
    AllFramesFailed(#[from] AllFramesFailed),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl AnalysisError {
    /// Ends the job with a `failed` record. Store errors are retried by
    /// the queue and unexpected errors fall back to a conservative verdict.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AnalysisError::Store(_) | AnalysisError::Unexpected(_))
    }
}

/// Highest progress published for each job that has not reached a
/// terminal state. Survives failed attempts so a retry resumes from it.
type PublishedProgress = Mutex<HashMap<Uuid, u8>>;

/// One job's view of its video record. Every change is saved, then
/// published.
struct Run<'a> {
    store: &'a dyn VideoStore,
    notifier: &'a ProgressNotifier,
    published: &'a PublishedProgress,
    job: &'a Job,
    record: VideoRecord,
}

impl<'a> Run<'a> {
    fn new(pipeline: &'a AnalysisPipeline, job: &'a Job, record: VideoRecord) -> Self {
        Run {
            store: pipeline.store.as_ref(),
            notifier: &pipeline.notifier,
            published: &pipeline.published,
            job,
            record,
        }
    }

    fn publish(&self, event: NotificationEvent) {
        self.notifier.publish(Notification::for_job(self.job, event));
    }

    /// Enter `processing`. A retried attempt picks up at the progress the
    /// failed one had reached.
    async fn start(&mut self) -> Result<(), StoreError> {
        let resumed = self.published.lock().get(&self.job.id).copied();
        self.record.status = VideoStatus::Processing;
        self.record.error_message = None;

        match resumed {
            Some(progress) => {
                debug!(message = "Resuming after a failed attempt", progress);
                self.record.processing_progress = progress;
                self.store.save(&self.record).await?;
            }
            None => {
                self.record.processing_progress = 0;
                self.store.save(&self.record).await?;
                self.published.lock().insert(self.job.id, 0);
                self.publish(NotificationEvent::ProcessingStarted {
                    status: VideoStatus::Processing,
                    progress: 0,
                });
            }
        }
        Ok(())
    }

    /// Never moves backwards.
    async fn progress(&mut self, progress: u8, message: impl Into<String>) -> Result<(), StoreError> {
        let progress = progress.min(100).max(self.record.processing_progress);
        self.record.processing_progress = progress;
        self.store.save(&self.record).await?;
        self.published.lock().insert(self.job.id, progress);
        self.publish(NotificationEvent::Progress {
            progress,
            message: message.into(),
        });
        Ok(())
    }

    fn finish(&self) {
        self.published.lock().remove(&self.job.id);
    }

    async fn complete(&mut self, verdict: &AggregateVerdict) -> Result<(), StoreError> {
        let status = verdict.terminal_status();
        self.record.status = status;
        self.record.sensitivity_status = verdict.db_status;
        self.record.processing_progress = 100;
        self.record.error_message = None;
        self.record.metadata = Some(verdict.metadata.clone());
        self.record.analysis_results = Some(verdict.analysis_results());
        self.record.processed_at = Some(Utc::now());
        self.store.save(&self.record).await?;
        self.finish();

        info!(
            message = "Video processing completed",
            name = %self.record.original_name,
            sensitivity = ?verdict.ux_status,
            confidence = verdict.confidence,
            fallback = verdict.fallback
        );
        self.publish(NotificationEvent::Completed {
            status,
            sensitivity_status: verdict.ux_status,
            progress: 100,
            confidence: verdict.confidence,
            analysis_note: verdict.analysis_note.clone(),
        });
        Ok(())
    }

    async fn fail(&mut self, error: &str) -> Result<(), StoreError> {
        self.record.status = VideoStatus::Failed;
        self.record.error_message = Some(error.to_string());
        self.store.save(&self.record).await?;
        self.finish();
        self.publish(NotificationEvent::Error {
            status: VideoStatus::Failed,
            error: error.to_string(),
        });
        Ok(())
    }
}

pub struct AnalysisPipeline {
    store: Arc<dyn VideoStore>,
    notifier: ProgressNotifier,
    media: Arc<dyn MediaProbe>,
    extractor: FrameExtractor,
    classifier: FrameClassifier,
    scratch_dir: PathBuf,
    published: PublishedProgress,
}

impl AnalysisPipeline {
    pub fn new(
        store: Arc<dyn VideoStore>,
        notifier: ProgressNotifier,
        media: Arc<dyn MediaProbe>,
        classifier: Arc<dyn SafetyClassifier>,
        config: AnalysisConfig,
    ) -> Self {
        AnalysisPipeline {
            store,
            notifier,
            extractor: FrameExtractor::new(media.clone()),
            media,
            classifier: FrameClassifier::new(classifier, config.thresholds),
            scratch_dir: config.scratch_dir,
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Analyze one video and leave its record in a terminal state.
    ///
    /// Only store errors escape; every other failure is written to the
    /// record.
    #[instrument(name = "pipeline.process", skip_all, fields(job_id = %job.id, video_id = %job.video_id))]
    pub async fn process(&self, job: &Job) -> anyhow::Result<()> {
        let Some(record) = self.store.load(&job.video_id).await? else {
            warn!(message = "Video not found, nothing to process", video_id = %job.video_id);
            return Ok(());
        };

        let mut run = Run::new(self, job, record);
        run.start().await?;

        match self.analyze(&mut run).await {
            Ok(verdict) => {
                run.progress(90, "Finalizing processing...").await?;
                run.complete(&verdict).await?;
            }
            Err(AnalysisError::Store(err)) => return Err(err.into()),
            Err(err) => {
                error!(message = "Video processing failed", error = %err);
                run.fail(&err.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Write a `failed` record for a job the queue gave up on, unless the
    /// record already reached a terminal state.
    pub async fn mark_failed(&self, job: &Job, reason: &str) -> Result<(), StoreError> {
        self.published.lock().remove(&job.id);
        let Some(record) = self.store.load(&job.video_id).await? else {
            return Ok(());
        };
        if record.status.is_terminal() {
            debug!(message = "Record already terminal, leaving it", status = ?record.status);
            return Ok(());
        }
        Run::new(self, job, record).fail(reason).await
    }

    async fn analyze(&self, run: &mut Run<'_>) -> Result<AggregateVerdict, AnalysisError> {
        run.progress(10, "Validating video format...").await?;
        if !self.media.check_available().await {
            return Err(AnalysisError::ToolingUnavailable);
        }

        run.progress(25, "Extracting video metadata...").await?;
        let path = run.record.file_path.clone();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(AnalysisError::FileNotFound(path));
        }
        let metadata = self.media.probe(&path).await?;
        let duration = metadata
            .duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .ok_or(AnalysisError::UnknownDuration)?;
        debug!(message = "Extracted metadata", duration, width = ?metadata.width, height = ?metadata.height);

        run.progress(40, "Starting content sensitivity analysis...").await?;
        match self.sample_and_classify(run, &path, duration, metadata).await {
            Err(AnalysisError::Unexpected(err)) => {
                error!(message = "Analysis failed, marking content for review", error = ?err);
                Ok(AggregateVerdict::fallback())
            }
            result => result,
        }
    }

    async fn sample_and_classify(
        &self,
        run: &mut Run<'_>,
        video: &Path,
        duration: f64,
        metadata: VideoMetadata,
    ) -> Result<AggregateVerdict, AnalysisError> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.scratch_dir.display()))?;
        // Removed on drop, including when the job is cancelled mid-run
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}_", run.job.video_id))
            .tempdir_in(&self.scratch_dir)
            .context("Failed to create scratch directory")?;

        run.progress(45, "Extracting video frames for analysis...").await?;
        let samples = self
            .extractor
            .extract(video, duration, frame_count(Some(duration)), scratch.path())
            .await?;
        let total = samples.len();

        run.progress(55, format!("Analyzing {total} frames for sensitive content...")).await?;
        self.classifier
            .ready()
            .await
            .map_err(|err| AnalysisError::ClassifierUnavailable(err.to_string()))?;

        let mut results = Vec::with_capacity(total);
        for (i, sample) in samples.iter().enumerate() {
            results.push(self.classifier.classify(sample).await);
            let progress = 55 + ((i + 1) * 25 / total) as u8;
            run.progress(progress, format!("Analyzed {}/{} frames...", i + 1, total))
                .await?;
        }

        if let Err(err) = scratch.close() {
            warn!(message = "Failed to remove scratch directory", error = %err);
        }

        Ok(aggregate(
            &results,
            self.classifier.policy().flagged_frame_ratio,
            metadata,
        )?)
    }
}

#[async_trait]
impl JobRunner for AnalysisPipeline {
    async fn run(&self, job: &Job) -> Result<(), anyhow::Error> {
        self.process(job).await
    }

    async fn abandon(&self, job: &Job, reason: &str) {
        if let Err(err) = self.mark_failed(job, reason).await {
            error!(message = "Failed to mark video as failed", video_id = %job.video_id, error = %err);
        }
    }
}
