//! Scripted OCR backend.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use scanbind::{OcrEngine, OcrError, OcrPageResult, OcrWord};

/// One recorded call: image file name and credential file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub image: String,
    pub credential: String,
}

/// `OcrEngine` answering from a script.
///
/// Credentials listed in `quota_credentials` always report quota
/// exhaustion; images listed in `failing_images` fail with a non-quota
/// error. Everything else succeeds with one word: the image's file stem.
#[derive(Default)]
pub struct ScriptedEngine {
    quota_credentials: HashSet<String>,
    failing_images: HashSet<String>,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credential file (e.g. `a.json`) that always answers RESOURCE_EXHAUSTED.
    pub fn with_quota_exhausted(mut self, credential_file: &str) -> Self {
        self.quota_credentials.insert(credential_file.to_string());
        self
    }

    /// Image file (e.g. `page_2.png`) that always fails.
    pub fn with_failing_image(mut self, image_file: &str) -> Self {
        self.failing_images.insert(image_file.to_string());
        self
    }

    /// Time each call takes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl OcrEngine for ScriptedEngine {
    fn detect_text(&self, image: &Path, credential_file: &Path) -> Result<OcrPageResult, OcrError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let call = Call {
            image: file_name(image),
            credential: file_name(credential_file),
        };
        self.calls.lock().unwrap().push(call.clone());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.quota_credentials.contains(&call.credential) {
            return Err(OcrError::QuotaExceeded(
                "RESOURCE_EXHAUSTED: Quota exceeded for quota metric".to_string(),
            ));
        }
        if self.failing_images.contains(&call.image) {
            return Err(OcrError::Failed("HTTP 400: Bad image data.".to_string()));
        }

        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(OcrPageResult {
            image_path: PathBuf::from(image),
            full_text: stem.clone(),
            words: vec![OcrWord::new(stem, 2.0, 2.0, 30.0, 12.0)],
        })
    }
}
