//! Per-job diagnostic report, written once when a run ends.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use super::model::{ItemStatus, JobStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    pub status: Option<JobStatus>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processed_items: usize,
    pub items: Vec<ItemReport>,
}

/// Outcome of one folder within the run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReport {
    pub folder_path: PathBuf,
    pub image_total: usize,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<PathBuf>,
    pub resumed_from: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: None,
            started_at: Utc::now(),
            ended_at: None,
            stop_reason: None,
            error: None,
            processed_items: 0,
            items: Vec::new(),
        }
    }

    /// Writes `<dir>/<job id>.json`. Failures are logged, never returned.
    pub fn write_best_effort(&self, dir: &Path) -> Option<PathBuf> {
        let path = dir.join(format!("{}.json", self.job_id));
        let result = std::fs::create_dir_all(dir)
            .map_err(|e| e.to_string())
            .and_then(|_| serde_json::to_vec_pretty(self).map_err(|e| e.to_string()))
            .and_then(|bytes| std::fs::write(&path, bytes).map_err(|e| e.to_string()));
        match result {
            Ok(()) => {
                debug!("Wrote job report {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to write report for {}: {}", self.job_id, e);
                None
            }
        }
    }
}
