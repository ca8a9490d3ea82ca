//! Google Cloud Vision `images:annotate` over REST, authenticated with
//! service-account key files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::{debug, info};
use moka::sync::Cache;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::OcrError;
use crate::folders::normalize_path;
use crate::ocr::{is_quota_message, OcrEngine, OcrPageResult, OcrWord};

pub const DEFAULT_VISION_ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const VISION_SCOPE: &str = "https://www.googleapis.com/auth/cloud-vision";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Access tokens live an hour; refresh well before that.
const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);
const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct KeyFile {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

/// Parsed service-account key, cached per credential file.
struct ServiceAccountSession {
    client_email: String,
    private_key: SecretString,
    private_key_id: Option<String>,
    token_uri: String,
}

impl ServiceAccountSession {
    fn load(path: &Path) -> Result<Self, OcrError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OcrError::Failed(format!("Failed to read credential {}: {}", path.display(), e))
        })?;
        let key: KeyFile = serde_json::from_str(&content).map_err(|e| {
            OcrError::Failed(format!("Invalid credential {}: {}", path.display(), e))
        })?;
        Ok(Self {
            client_email: key.client_email,
            private_key: SecretString::from(key.private_key),
            private_key_id: key.private_key_id,
            token_uri: key.token_uri,
        })
    }

    fn assertion(&self) -> Result<String, OcrError> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: VISION_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();
        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|e| OcrError::Failed(format!("Invalid private key: {}", e)))?;
        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| OcrError::Failed(format!("Failed to sign token request: {}", e)))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// [`OcrEngine`] backed by Cloud Vision `DOCUMENT_TEXT_DETECTION`.
pub struct VisionClient {
    http: Client,
    endpoint: String,
    language_hints: Vec<String>,
    sessions: Mutex<HashMap<PathBuf, Arc<ServiceAccountSession>>>,
    tokens: Cache<PathBuf, Arc<SecretString>>,
}

impl VisionClient {
    pub fn new(
        endpoint: impl Into<String>,
        language_hints: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, OcrError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OcrError::Failed(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            language_hints,
            sessions: Mutex::new(HashMap::new()),
            tokens: Cache::builder()
                .max_capacity(1024)
                .time_to_live(TOKEN_TTL)
                .build(),
        })
    }

    fn session(&self, key: &Path) -> Result<Arc<ServiceAccountSession>, OcrError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = sessions.get(key) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(ServiceAccountSession::load(key)?);
        debug!("Opened OCR session for {}", key.display());
        sessions.insert(key.to_path_buf(), Arc::clone(&created));
        Ok(created)
    }

    fn access_token(&self, key: &Path) -> Result<Arc<SecretString>, OcrError> {
        if let Some(token) = self.tokens.get(key) {
            return Ok(token);
        }
        let session = self.session(key)?;
        let assertion = session.assertion()?;
        let response = self
            .http
            .post(&session.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .map_err(|e| OcrError::Failed(format!("Token request failed: {}", e)))?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(OcrError::Failed(format!(
                "Token request rejected ({}): {}",
                status, body
            )));
        }
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| OcrError::Failed(format!("Malformed token response: {}", e)))?;
        let token = Arc::new(SecretString::from(parsed.access_token));
        self.tokens.insert(key.to_path_buf(), Arc::clone(&token));
        info!("Obtained access token for {}", session.client_email);
        Ok(token)
    }

    fn request_body(&self, image: &[u8]) -> serde_json::Value {
        serde_json::json!({
            "requests": [{
                "image": {
                    "content": base64::engine::general_purpose::STANDARD.encode(image),
                },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
                "imageContext": { "languageHints": self.language_hints },
            }]
        })
    }
}

impl OcrEngine for VisionClient {
    fn detect_text(&self, image: &Path, credential_file: &Path) -> Result<OcrPageResult, OcrError> {
        let key = normalize_path(credential_file);
        let bytes = std::fs::read(image).map_err(|e| {
            OcrError::Failed(format!("Failed to read image {}: {}", image.display(), e))
        })?;
        let token = self.access_token(&key)?;

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(token.expose_secret())
            .json(&self.request_body(&bytes))
            .send()
            .map_err(|e| OcrError::Failed(format!("OCR request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| OcrError::Failed(format!("Failed to read OCR response: {}", e)))?;

        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                self.tokens.invalidate(&key);
            }
            return Err(classify_http_error(status.as_u16(), &body));
        }
        parse_annotate_response(image, &body)
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RpcStatus {
    message: String,
    status: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RpcStatus,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct BatchResponse {
    responses: Vec<AnnotateResponse>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct AnnotateResponse {
    full_text_annotation: Option<TextAnnotation>,
    text_annotations: Vec<EntityAnnotation>,
    error: Option<RpcStatus>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct EntityAnnotation {
    description: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TextAnnotation {
    text: String,
    pages: Vec<Page>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Page {
    blocks: Vec<Block>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Block {
    paragraphs: Vec<Paragraph>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Paragraph {
    words: Vec<Word>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct Word {
    bounding_box: Option<BoundingPoly>,
    symbols: Vec<Symbol>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Symbol {
    text: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct BoundingPoly {
    vertices: Vec<Vertex>,
}

/// Zero coordinates are omitted on the wire.
#[derive(Deserialize, Default)]
#[serde(default)]
struct Vertex {
    x: f32,
    y: f32,
}

fn classify_status(status: &RpcStatus) -> OcrError {
    if status.status == RESOURCE_EXHAUSTED || is_quota_message(&status.message) {
        OcrError::QuotaExceeded(status.message.clone())
    } else {
        OcrError::Failed(status.message.clone())
    }
}

/// Maps a non-success HTTP response to an OCR outcome.
pub(crate) fn classify_http_error(status: u16, body: &str) -> OcrError {
    let rpc = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| RpcStatus {
            message: body.trim().to_string(),
            status: String::new(),
        });
    let message = if rpc.message.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, rpc.message)
    };
    if status == 429 || rpc.status == RESOURCE_EXHAUSTED || is_quota_message(&rpc.message) {
        OcrError::QuotaExceeded(message)
    } else {
        OcrError::Failed(message)
    }
}

/// Extracts text and word boxes from a successful `images:annotate` body.
pub(crate) fn parse_annotate_response(image: &Path, body: &str) -> Result<OcrPageResult, OcrError> {
    let batch: BatchResponse = serde_json::from_str(body)
        .map_err(|e| OcrError::Failed(format!("Malformed OCR response: {}", e)))?;
    let response = batch.responses.into_iter().next().unwrap_or_default();
    if let Some(status) = &response.error {
        if !status.message.is_empty() || !status.status.is_empty() {
            return Err(classify_status(status));
        }
    }

    let full_text = match &response.full_text_annotation {
        Some(annotation) => annotation.text.clone(),
        None => response
            .text_annotations
            .first()
            .map(|a| a.description.clone())
            .unwrap_or_default(),
    };
    let words = response
        .full_text_annotation
        .as_ref()
        .map(extract_words)
        .unwrap_or_default();

    Ok(OcrPageResult {
        image_path: image.to_path_buf(),
        full_text,
        words,
    })
}

fn extract_words(annotation: &TextAnnotation) -> Vec<OcrWord> {
    annotation
        .pages
        .iter()
        .flat_map(|p| &p.blocks)
        .flat_map(|b| &b.paragraphs)
        .flat_map(|p| &p.words)
        .filter_map(|word| {
            let text: String = word.symbols.iter().map(|s| s.text.as_str()).collect();
            if text.is_empty() {
                return None;
            }
            let vertices = &word.bounding_box.as_ref()?.vertices;
            let first = vertices.first()?;
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
            for v in &vertices[1..] {
                min_x = min_x.min(v.x);
                min_y = min_y.min(v.y);
                max_x = max_x.max(v.x);
                max_y = max_y.max(v.y);
            }
            Some(OcrWord::new(text, min_x, min_y, max_x, max_y))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "responses": [{
        "textAnnotations": [{"description": "ignored"}],
        "fullTextAnnotation": {
          "text": "안녕 하세요\nPage 1\n",
          "pages": [{"blocks": [{"paragraphs": [{"words": [
            {"boundingBox": {"vertices": [{"x": 10, "y": 5}, {"x": 40, "y": 5}, {"x": 40, "y": 25}, {"x": 10, "y": 25}]},
             "symbols": [{"text": "안"}, {"text": "녕"}]},
            {"boundingBox": {"vertices": [{"y": 30}, {"x": 12, "y": 30}, {"x": 12, "y": 50}, {"y": 50}]},
             "symbols": [{"text": "P"}]},
            {"boundingBox": {"vertices": []}, "symbols": [{"text": "x"}]},
            {"symbols": [{"text": "y"}]},
            {"boundingBox": {"vertices": [{"x": 1, "y": 1}]}, "symbols": []}
          ]}]}]}]
        }
      }]
    }"#;

    #[test]
    fn test_parse_words_and_text() {
        let page = parse_annotate_response(Path::new("/scans/p1.png"), SAMPLE).unwrap();
        assert_eq!(page.full_text, "안녕 하세요\nPage 1\n");
        assert_eq!(page.image_path, PathBuf::from("/scans/p1.png"));
        assert_eq!(
            page.words,
            vec![
                OcrWord::new("안녕", 10.0, 5.0, 40.0, 25.0),
                OcrWord::new("P", 0.0, 30.0, 12.0, 50.0),
            ]
        );
    }

    #[test]
    fn test_parse_falls_back_to_text_annotations() {
        let body = r#"{"responses": [{"textAnnotations": [{"description": "hello"}]}]}"#;
        let page = parse_annotate_response(Path::new("p.png"), body).unwrap();
        assert_eq!(page.full_text, "hello");
        assert!(page.words.is_empty());

        let empty = parse_annotate_response(Path::new("p.png"), r#"{"responses": [{}]}"#).unwrap();
        assert_eq!(empty.full_text, "");
    }

    #[test]
    fn test_per_image_error_is_classified() {
        let quota = r#"{"responses": [{"error": {"code": 8, "message": "Quota exceeded for quota metric", "status": "RESOURCE_EXHAUSTED"}}]}"#;
        assert!(matches!(
            parse_annotate_response(Path::new("p.png"), quota),
            Err(OcrError::QuotaExceeded(_))
        ));
        let bad = r#"{"responses": [{"error": {"code": 3, "message": "Bad image data."}}]}"#;
        assert_eq!(
            parse_annotate_response(Path::new("p.png"), bad),
            Err(OcrError::Failed("Bad image data.".to_string()))
        );
    }

    #[test]
    fn test_http_error_classification() {
        assert!(matches!(classify_http_error(429, ""), OcrError::QuotaExceeded(_)));
        assert!(matches!(
            classify_http_error(
                403,
                r#"{"error": {"code": 403, "message": "denied", "status": "RESOURCE_EXHAUSTED"}}"#
            ),
            OcrError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_http_error(400, "Rate limit exceeded"),
            OcrError::QuotaExceeded(_)
        ));
        assert_eq!(
            classify_http_error(
                403,
                r#"{"error": {"code": 403, "message": "Cloud Vision API has not been used", "status": "PERMISSION_DENIED"}}"#
            ),
            OcrError::Failed("HTTP 403: Cloud Vision API has not been used".to_string())
        );
        assert_eq!(classify_http_error(500, "  "), OcrError::Failed("HTTP 500".to_string()));
    }

    #[test]
    fn test_malformed_body_fails() {
        assert!(matches!(
            parse_annotate_response(Path::new("p.png"), "<html>"),
            Err(OcrError::Failed(_))
        ));
    }

    #[test]
    fn test_missing_credential_file_fails_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("p.png");
        std::fs::write(&image, b"png").unwrap();
        let client = VisionClient::new(
            "http://127.0.0.1:9/unused",
            vec!["en".to_string()],
            Duration::from_secs(1),
        )
        .unwrap();
        let err = client
            .detect_text(&image, &dir.path().join("missing.json"))
            .unwrap_err();
        assert!(matches!(err, OcrError::Failed(m) if m.contains("missing.json")));
    }
}
