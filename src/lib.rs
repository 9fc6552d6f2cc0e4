use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod classifier;
pub mod config;
pub mod db;
pub mod extractor;
pub mod media;
pub mod notifier;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod verdict;
pub mod worker;

#[cfg(test)]
mod testing;

/// One request to analyze a single uploaded video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub video_id: String,
    pub owner_id: String,
    pub tenant_id: String,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        video_id: impl Into<String>,
        owner_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Job {
            id: Uuid::new_v4(),
            video_id: video_id.into(),
            owner_id: owner_id.into(),
            tenant_id: tenant_id.into(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "video_status_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
    Flagged,
}

impl VideoStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VideoStatus::Completed | VideoStatus::Failed | VideoStatus::Flagged
        )
    }
}

/// Persisted sensitivity enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sensitivity_status_enum", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SensitivityStatus {
    Pending,
    Safe,
    Flagged,
}

/// Outward-facing sensitivity label shown to clients. Kept apart from
/// [`SensitivityStatus`], which is what gets stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityLabel {
    Sensitive,
    Safe,
}

impl SensitivityLabel {
    pub fn from_sensitive(is_sensitive: bool) -> Self {
        if is_sensitive {
            SensitivityLabel::Sensitive
        } else {
            SensitivityLabel::Safe
        }
    }

    pub fn stored(self) -> SensitivityStatus {
        match self {
            SensitivityLabel::Sensitive => SensitivityStatus::Flagged,
            SensitivityLabel::Safe => SensitivityStatus::Safe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!VideoStatus::Uploading.is_terminal());
        assert!(!VideoStatus::Processing.is_terminal());
        assert!(VideoStatus::Completed.is_terminal());
        assert!(VideoStatus::Failed.is_terminal());
        assert!(VideoStatus::Flagged.is_terminal());
    }

    #[test]
    fn label_and_stored_status_stay_distinct() {
        let label = SensitivityLabel::from_sensitive(true);
        assert_eq!(serde_json::to_string(&label).unwrap(), "\"sensitive\"");
        assert_eq!(
            serde_json::to_string(&label.stored()).unwrap(),
            "\"flagged\""
        );
        assert_eq!(
            SensitivityLabel::from_sensitive(false).stored(),
            SensitivityStatus::Safe
        );
    }
}
