//! Service-account credential records and the directory scanner that
//! keeps them in sync with the key files on disk.

mod scanner;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use scanner::{fingerprint, CredentialScanner, ScanReport};

/// A known service-account key file.
///
/// Identity is the fingerprint, so the same key keeps its id after the file
/// is moved or renamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: String,
    pub fingerprint: String,
    pub file_path: PathBuf,
    pub file_name: String,
    pub account_label: Option<String>,
    pub project_id: Option<String>,
    pub service_account_email: Option<String>,
    pub private_key_id: Option<String>,
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    #[cfg(test)]
    pub(crate) fn for_test(id: &str, fingerprint: &str, file_path: &str, active: bool) -> Self {
        let file_path = PathBuf::from(file_path);
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: id.to_string(),
            fingerprint: fingerprint.to_string(),
            file_path,
            file_name,
            account_label: None,
            project_id: Some("proj".to_string()),
            service_account_email: Some(format!("{}@proj.iam.gserviceaccount.com", id)),
            private_key_id: None,
            active,
            created_at: None,
            updated_at: None,
        }
    }
}
