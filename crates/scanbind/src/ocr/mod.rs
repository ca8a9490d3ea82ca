//! Remote OCR abstraction.

mod vision;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::OcrError;

pub use vision::{VisionClient, DEFAULT_VISION_ENDPOINT};

/// A recognized word with its axis-aligned pixel bounding box.
/// Image coordinates: origin top-left, y grows downward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrWord {
    pub text: String,
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl OcrWord {
    pub fn new(text: impl Into<String>, min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            text: text.into(),
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Box height, never below one pixel.
    pub fn height(&self) -> f32 {
        (self.max_y - self.min_y).max(1.0)
    }

    pub fn center_y(&self) -> f32 {
        (self.min_y + self.max_y) / 2.0
    }
}

/// OCR output for a single page image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrPageResult {
    pub image_path: PathBuf,
    pub full_text: String,
    pub words: Vec<OcrWord>,
}

/// A text-detection backend.
///
/// Implementations must classify quota failures as
/// [`OcrError::QuotaExceeded`] so the caller can rotate credentials.
pub trait OcrEngine: Send + Sync {
    fn detect_text(&self, image: &Path, credential_file: &Path)
        -> Result<OcrPageResult, OcrError>;
}

/// Case-insensitive quota signature check on a remote error message.
pub fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("resource_exhausted") || lower.contains("quota") || lower.contains("rate limit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_signature() {
        assert!(is_quota_message("RESOURCE_EXHAUSTED: try later"));
        assert!(is_quota_message("Quota exceeded for quota metric"));
        assert!(is_quota_message("Rate Limit reached"));
        assert!(!is_quota_message("PERMISSION_DENIED"));
        assert!(!is_quota_message(""));
    }

    #[test]
    fn test_word_geometry() {
        let w = OcrWord::new("a", 0.0, 10.0, 5.0, 10.0);
        assert_eq!(w.height(), 1.0);
        assert_eq!(w.center_y(), 10.0);
    }
}
