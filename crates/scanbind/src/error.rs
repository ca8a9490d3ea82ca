use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanbindError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    #[error("PDF error: {0}")]
    Pdf(#[from] PdfError),

    #[error("OCR error: {0}")]
    Ocr(#[from] OcrError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Unknown timezone '{0}'")]
    InvalidTimezone(String),
}

/// Outcome classes of a single remote OCR call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OcrError {
    /// The credential ran out of quota; the caller should retry with another one.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("OCR call failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("All credentials are exhausted.")]
    AllCredentialsExhausted,

    #[error("Invalid usage adjustment: {0}")]
    InvalidAdjustment(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum PdfError {
    #[error("No OCR pages available.")]
    NoPages,

    #[error("Failed to read image '{path}': {reason}")]
    ImageRead { path: PathBuf, reason: String },

    #[error("Failed to write PDF '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build PDF: {0}")]
    Pdf(String),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("All credentials are exhausted.")]
    AllCredentialsExhausted,

    #[error("OCR failed at {}: {reason}", path.display())]
    OcrCallFailed { path: PathBuf, reason: String },

    #[error("Resume mismatch: expected {expected} pages but got {actual}")]
    ResumeMismatch { expected: usize, actual: usize },

    #[error("Failed to write PDF: {0}")]
    Pdf(#[from] PdfError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Quota bookkeeping failed: {0}")]
    Quota(String),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to scan folder '{path}': {reason}")]
    Scan { path: PathBuf, reason: String },

    #[error("Worker error: {0}")]
    Worker(String),
}

impl From<QuotaError> for JobError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::AllCredentialsExhausted => JobError::AllCredentialsExhausted,
            QuotaError::Database(e) => JobError::Database(e),
            other => JobError::Quota(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanbindError>;
