//! Job and job item records.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::error::UnknownVariant;
use crate::quota::KeySelectionStrategy;

/// Lifecycle of a job: CREATED → RUNNING → {COMPLETED | STOPPED | FAILED}.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Stopped | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(JobStatus::Created),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "STOPPED" => Ok(JobStatus::Stopped),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(UnknownVariant {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle of one folder inside a job: PENDING → RUNNING → {COMPLETED | FAILED | STOPPED}.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::Running => "RUNNING",
            ItemStatus::Completed => "COMPLETED",
            ItemStatus::Failed => "FAILED",
            ItemStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ItemStatus::Pending),
            "RUNNING" => Ok(ItemStatus::Running),
            "COMPLETED" => Ok(ItemStatus::Completed),
            "FAILED" => Ok(ItemStatus::Failed),
            "STOPPED" => Ok(ItemStatus::Stopped),
            other => Err(UnknownVariant {
                kind: "item status",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub strategy: KeySelectionStrategy,
    pub parallelism: usize,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub total_items: usize,
    pub processed_items: usize,
    pub last_error: Option<String>,
}

/// A persisted folder entry of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobItemRecord {
    pub id: String,
    pub job_id: String,
    pub queue_index: usize,
    pub folder_path: PathBuf,
    pub image_total: usize,
    pub image_done: usize,
    pub status: ItemStatus,
    pub pdf_path: Option<PathBuf>,
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobItemRecord {
    /// Completed with a PDF that is still on disk.
    pub fn is_verified_complete(&self) -> bool {
        self.status == ItemStatus::Completed
            && self
                .pdf_path
                .as_ref()
                .is_some_and(|p| !p.as_os_str().is_empty() && p.exists())
    }
}

/// A job together with its items, as returned by `get`/`list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    #[serde(flatten)]
    pub job: JobRecord,
    pub items: Vec<JobItemRecord>,
}

/// Partial update of a job row; `None` fields are preserved.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub processed_items: Option<usize>,
    pub last_error: Option<String>,
}

/// Partial update of a job item row; `None` fields are preserved.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub status: Option<ItemStatus>,
    pub image_done: Option<usize>,
    pub pdf_path: Option<PathBuf>,
    pub error_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(status: ItemStatus, pdf_path: Option<PathBuf>) -> JobItemRecord {
        JobItemRecord {
            id: "i".to_string(),
            job_id: "j".to_string(),
            queue_index: 0,
            folder_path: PathBuf::from("/scans"),
            image_total: 1,
            image_done: 1,
            status,
            pdf_path,
            error_reason: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Created,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Stopped,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
        assert_eq!("STOPPED".parse::<ItemStatus>().unwrap(), ItemStatus::Stopped);
    }

    #[test]
    fn test_verified_complete_requires_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("out.pdf");

        assert!(!item(ItemStatus::Completed, Some(pdf.clone())).is_verified_complete());
        std::fs::write(&pdf, b"%PDF-1.5").unwrap();
        assert!(item(ItemStatus::Completed, Some(pdf.clone())).is_verified_complete());
        assert!(!item(ItemStatus::Failed, Some(pdf)).is_verified_complete());
        assert!(!item(ItemStatus::Completed, None).is_verified_complete());
    }

    #[test]
    fn test_job_view_serializes_flat() {
        let view = JobView {
            job: JobRecord {
                id: "j1".to_string(),
                strategy: KeySelectionStrategy::RoundRobin,
                parallelism: 2,
                status: JobStatus::Created,
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
                stop_reason: None,
                total_items: 0,
                processed_items: 0,
                last_error: None,
            },
            items: vec![],
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "j1");
        assert_eq!(json["strategy"], "ROUND_ROBIN");
        assert_eq!(json["status"], "CREATED");
        assert!(json["items"].as_array().unwrap().is_empty());
    }
}
