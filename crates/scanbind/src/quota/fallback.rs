use std::path::Path;

use log::{debug, warn};

use super::allocator::QuotaAllocator;
use super::strategy::{KeySelectionStrategy, RoundRobinCursor};
use crate::cancel::{CancellationToken, Interruptible};
use crate::error::{JobError, OcrError};
use crate::ocr::{OcrEngine, OcrPageResult};

/// Upper bound on credentials tried for a single page.
pub const MAX_CREDENTIAL_ATTEMPTS: usize = 10;

/// Everything a page worker needs to run OCR with credential rotation.
pub struct FallbackContext<'a> {
    pub allocator: &'a QuotaAllocator,
    pub engine: &'a dyn OcrEngine,
    pub strategy: KeySelectionStrategy,
    pub cursor: &'a RoundRobinCursor,
    pub cancel: &'a CancellationToken,
}

/// Runs OCR on one image, rotating credentials on quota errors.
///
/// Each attempt pre-charges a unit under the allocator lock, then calls the
/// engine outside of it. Quota errors exhaust the credential and retry;
/// any other error refunds the unit and is returned at once.
pub fn detect_with_fallback(
    ctx: &FallbackContext<'_>,
    image: &Path,
) -> Result<Interruptible<OcrPageResult>, JobError> {
    let span = tracing::debug_span!("ocr.detect", image = %image.display());
    let _enter = span.enter();

    for attempt in 1..=MAX_CREDENTIAL_ATTEMPTS {
        if ctx.cancel.is_cancelled() {
            return Ok(Interruptible::Stopped);
        }

        let credential = ctx.allocator.select_and_consume(ctx.strategy, ctx.cursor)?;
        debug!(
            "OCR attempt {} for {} with credential {}",
            attempt,
            image.display(),
            credential.credential_id
        );

        match ctx.engine.detect_text(image, &credential.file_path) {
            Ok(page) => return Ok(Interruptible::Finished(page)),
            Err(OcrError::QuotaExceeded(message)) => {
                warn!(
                    "Credential {} hit its quota on {}: {}",
                    credential.credential_id,
                    image.display(),
                    message
                );
                ctx.allocator.mark_exhausted(
                    &credential.credential_id,
                    &format!("Quota exceeded: {}", message),
                )?;
            }
            Err(OcrError::Failed(reason)) => {
                if let Err(e) = ctx.allocator.release_one_unit(&credential.credential_id) {
                    warn!("Failed to release quota unit after OCR error: {}", e);
                }
                return Err(JobError::OcrCallFailed {
                    path: image.to_path_buf(),
                    reason,
                });
            }
        }
    }

    Err(JobError::AllCredentialsExhausted)
}
