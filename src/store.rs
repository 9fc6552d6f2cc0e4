//! Video record persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::media::VideoMetadata;
use crate::verdict::AnalysisResults;
use crate::{SensitivityStatus, VideoStatus};

/// The part of an uploaded video's record the analysis reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub owner_id: String,
    pub tenant_id: String,
    pub file_path: PathBuf,
    pub original_name: String,
    pub status: VideoStatus,
    pub sensitivity_status: SensitivityStatus,
    /// 0..=100
    pub processing_progress: u8,
    pub error_message: Option<String>,
    pub metadata: Option<VideoMetadata>,
    pub analysis_results: Option<AnalysisResults>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    /// Record as left by the upload handler.
    pub fn uploaded(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        tenant_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        original_name: impl Into<String>,
    ) -> Self {
        VideoRecord {
            id: id.into(),
            owner_id: owner_id.into(),
            tenant_id: tenant_id.into(),
            file_path: file_path.into(),
            original_name: original_name.into(),
            status: VideoStatus::Uploading,
            sensitivity_status: SensitivityStatus::Pending,
            processing_progress: 0,
            error_message: None,
            metadata: None,
            analysis_results: None,
            processed_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Video not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Each `save` commits the whole record at once.
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn load(&self, video_id: &str) -> Result<Option<VideoRecord>, StoreError>;

    async fn save(&self, record: &VideoRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryVideoStore {
    records: RwLock<HashMap<String, VideoRecord>>,
}

impl MemoryVideoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: VideoRecord) {
        self.records.write().insert(record.id.clone(), record);
    }

    pub fn get(&self, video_id: &str) -> Option<VideoRecord> {
        self.records.read().get(video_id).cloned()
    }
}

#[async_trait]
impl VideoStore for MemoryVideoStore {
    async fn load(&self, video_id: &str) -> Result<Option<VideoRecord>, StoreError> {
        Ok(self.get(video_id))
    }

    async fn save(&self, record: &VideoRecord) -> Result<(), StoreError> {
        match self.records.write().get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id.clone())),
        }
    }
}
