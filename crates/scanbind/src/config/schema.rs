use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ocr::DEFAULT_VISION_ENDPOINT;

pub const CONFIG_VERSION: &str = "1.0";
pub const DEFAULT_MONTHLY_CAP: i64 = 1000;
pub const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub pdf: PdfConfig,
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

fn default_base_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".scanbind")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            base_directory: default_base_directory(),
            credentials: CredentialsConfig::default(),
            output: OutputConfig::default(),
            state: StateConfig::default(),
            ocr: OcrConfig::default(),
            pdf: PdfConfig::default(),
        }
    }
}

impl Config {
    pub fn base_directory(&self) -> PathBuf {
        expand_home(&self.base_directory)
    }

    pub fn pdf_directory(&self) -> PathBuf {
        self.output
            .pdf_directory
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.base_directory().join("output").join("pdf"))
    }

    pub fn report_directory(&self) -> PathBuf {
        self.output
            .report_directory
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.base_directory().join("output").join("reports"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.state
            .database_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.base_directory().join("state").join("scanbind.db"))
    }

    /// Credential directories; `<base>/credentials` when none are configured.
    pub fn credential_directories(&self) -> Vec<PathBuf> {
        if self.credentials.directories.is_empty() {
            return vec![self.base_directory().join("credentials")];
        }
        self.credentials
            .directories
            .iter()
            .map(|d| expand_home(d))
            .collect()
    }

    pub fn font_candidates(&self) -> Vec<PathBuf> {
        self.pdf
            .font_candidates
            .iter()
            .map(|f| expand_home(f))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    #[serde(default = "default_monthly_cap")]
    pub monthly_cap: i64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_monthly_cap() -> i64 {
    DEFAULT_MONTHLY_CAP
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            monthly_cap: DEFAULT_MONTHLY_CAP,
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub pdf_directory: Option<PathBuf>,
    #[serde(default)]
    pub report_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_language_hints")]
    pub language_hints: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    DEFAULT_VISION_ENDPOINT.to_string()
}

fn default_language_hints() -> Vec<String> {
    vec!["ko".to_string(), "en".to_string()]
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            language_hints: default_language_hints(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PdfConfig {
    /// Extra TrueType fonts, tried before the built-in OS list.
    #[serde(default)]
    pub font_candidates: Vec<PathBuf>,
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_locations_follow_base() {
        let config = Config {
            base_directory: PathBuf::from("/data/scanbind"),
            ..Default::default()
        };
        assert_eq!(config.pdf_directory(), PathBuf::from("/data/scanbind/output/pdf"));
        assert_eq!(
            config.report_directory(),
            PathBuf::from("/data/scanbind/output/reports")
        );
        assert_eq!(
            config.database_path(),
            PathBuf::from("/data/scanbind/state/scanbind.db")
        );
        assert_eq!(
            config.credential_directories(),
            vec![PathBuf::from("/data/scanbind/credentials")]
        );
    }

    #[test]
    fn test_explicit_locations_win() {
        let mut config = Config::default();
        config.output.pdf_directory = Some(PathBuf::from("/pdfs"));
        config.state.database_path = Some(PathBuf::from("/db/x.db"));
        assert_eq!(config.pdf_directory(), PathBuf::from("/pdfs"));
        assert_eq!(config.database_path(), PathBuf::from("/db/x.db"));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/keys")), home.join("keys"));
        }
    }
}
