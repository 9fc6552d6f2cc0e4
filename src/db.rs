use crate::media::VideoMetadata;
use crate::store::{StoreError, VideoRecord, VideoStore};
use crate::verdict::AnalysisResults;
use crate::{SensitivityStatus, VideoStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::sync::Arc;
use tracing::*;

const SELECT_VIDEO: &str = "SELECT id, owner_id, tenant_id, file_path, original_name, status, \
    sensitivity_status, processing_progress, error_message, metadata, analysis_results, processed_at \
    FROM videos";

/// PostgreSQL-backed [`VideoStore`].
#[derive(Clone)]
pub struct PgVideoStore {
    pool: Arc<PgPool>,
}

#[derive(Debug, sqlx::FromRow)]
struct VideoRow {
    id: String,
    owner_id: String,
    tenant_id: String,
    file_path: String,
    original_name: String,
    status: VideoStatus,
    sensitivity_status: SensitivityStatus,
    processing_progress: i16,
    error_message: Option<String>,
    metadata: Option<Json<VideoMetadata>>,
    analysis_results: Option<Json<AnalysisResults>>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<VideoRow> for VideoRecord {
    fn from(row: VideoRow) -> Self {
        VideoRecord {
            id: row.id,
            owner_id: row.owner_id,
            tenant_id: row.tenant_id,
            file_path: row.file_path.into(),
            original_name: row.original_name,
            status: row.status,
            sensitivity_status: row.sensitivity_status,
            processing_progress: row.processing_progress.clamp(0, 100) as u8,
            error_message: row.error_message,
            metadata: row.metadata.map(|m| m.0),
            analysis_results: row.analysis_results.map(|r| r.0),
            processed_at: row.processed_at,
        }
    }
}

/// Video currently being analyzed, as listed by the status command.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProcessingVideo {
    pub id: String,
    pub original_name: String,
    pub processing_progress: i16,
}

impl PgVideoStore {
    #[instrument(name = "db.connect", skip_all)]
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(PgVideoStore {
            pool: Arc::new(pool),
        })
    }

    #[instrument(name = "db.processing_videos", skip_all)]
    pub async fn processing_videos(&self) -> Result<Vec<ProcessingVideo>, StoreError> {
        debug!("Getting processing videos");
        Ok(sqlx::query_as::<_, ProcessingVideo>(
            "SELECT id, original_name, processing_progress \
            FROM videos \
            WHERE status = 'processing' \
            ORDER BY updated_at desc",
        )
        .fetch_all(&*self.pool)
        .await?)
    }
}

#[async_trait]
impl VideoStore for PgVideoStore {
    #[instrument(name = "db.load", skip(self))]
    async fn load(&self, video_id: &str) -> Result<Option<VideoRecord>, StoreError> {
        let row = sqlx::query_as::<_, VideoRow>(&format!("{SELECT_VIDEO} WHERE id = $1"))
            .bind(video_id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(VideoRecord::from))
    }

    #[instrument(name = "db.save", skip_all, fields(video_id = %record.id, status = ?record.status))]
    async fn save(&self, record: &VideoRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE videos \
                SET status = $2, \
                sensitivity_status = $3, \
                processing_progress = $4, \
                error_message = $5, \
                metadata = $6, \
                analysis_results = $7, \
                processed_at = $8, \
                updated_at = now() \
            WHERE id = $1",
        )
        .bind(&record.id)
        .bind(record.status)
        .bind(record.sensitivity_status)
        .bind(record.processing_progress as i16)
        .bind(&record.error_message)
        .bind(record.metadata.as_ref().map(Json))
        .bind(record.analysis_results.as_ref().map(Json))
        .bind(record.processed_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.id.clone()));
        }

        Ok(())
    }
}
