//! Fans the remaining pages of a folder out to OCR, sequentially or on a
//! worker pool, checkpointing every page as its result arrives.

mod pool;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use log::{debug, info};

use crate::cancel::{CancellationToken, Interruptible};
use crate::checkpoint;
use crate::db::{job_repo, Database};
use crate::error::JobError;
use crate::events::{EventBus, JobEventType};
use crate::job::model::ItemUpdate;
use crate::ocr::{OcrEngine, OcrPageResult};
use crate::quota::{
    detect_with_fallback, FallbackContext, KeySelectionStrategy, QuotaAllocator, RoundRobinCursor,
};

pub use pool::WorkerPool;

const RESULT_POLL: Duration = Duration::from_millis(100);

/// One folder's worth of remaining pages.
pub struct DispatchRequest<'a> {
    pub job_id: &'a str,
    pub item_id: &'a str,
    /// Full natural-sorted listing of the folder.
    pub images: &'a [PathBuf],
    /// First page index still to process.
    pub start_index: usize,
    pub parallelism: usize,
    pub strategy: KeySelectionStrategy,
    pub cursor: Arc<RoundRobinCursor>,
    pub cancel: CancellationToken,
}

type PageOutcome = (usize, Result<Interruptible<OcrPageResult>, JobError>);

/// Shared collaborators of every page task.
#[derive(Clone)]
pub struct PageDispatcher {
    db: Database,
    allocator: Arc<QuotaAllocator>,
    engine: Arc<dyn OcrEngine>,
    events: EventBus,
}

impl PageDispatcher {
    pub fn new(
        db: Database,
        allocator: Arc<QuotaAllocator>,
        engine: Arc<dyn OcrEngine>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            allocator,
            engine,
            events,
        }
    }

    /// OCRs pages `start_index..` and returns them in page order.
    ///
    /// The first failure aborts the folder; pages checkpointed before it
    /// stay stored.
    pub fn dispatch(
        &self,
        req: &DispatchRequest<'_>,
    ) -> Result<Interruptible<Vec<OcrPageResult>>, JobError> {
        if req.start_index >= req.images.len() {
            return Ok(Interruptible::Finished(Vec::new()));
        }
        if req.parallelism <= 1 {
            self.run_sequential(req)
        } else {
            self.run_parallel(req)
        }
    }

    fn run_sequential(
        &self,
        req: &DispatchRequest<'_>,
    ) -> Result<Interruptible<Vec<OcrPageResult>>, JobError> {
        let ctx = FallbackContext {
            allocator: self.allocator.as_ref(),
            engine: self.engine.as_ref(),
            strategy: req.strategy,
            cursor: req.cursor.as_ref(),
            cancel: &req.cancel,
        };

        let mut pages = Vec::with_capacity(req.images.len() - req.start_index);
        for (index, image) in req.images.iter().enumerate().skip(req.start_index) {
            if req.cancel.is_cancelled() {
                return Ok(Interruptible::Stopped);
            }
            let page = match detect_with_fallback(&ctx, image)? {
                Interruptible::Finished(page) => page,
                Interruptible::Stopped => return Ok(Interruptible::Stopped),
            };
            self.record_page(req, index, &page, index + 1)?;
            pages.push(page);
        }
        Ok(Interruptible::Finished(pages))
    }

    fn run_parallel(
        &self,
        req: &DispatchRequest<'_>,
    ) -> Result<Interruptible<Vec<OcrPageResult>>, JobError> {
        if req.cancel.is_cancelled() {
            return Ok(Interruptible::Stopped);
        }

        let remaining = req.images.len() - req.start_index;
        let workers = req.parallelism.min(remaining);
        info!(
            "Dispatching {} pages of item {} to {} workers",
            remaining, req.item_id, workers
        );

        let allocator = Arc::clone(&self.allocator);
        let engine = Arc::clone(&self.engine);
        let cursor = Arc::clone(&req.cursor);
        let cancel = req.cancel.clone();
        let strategy = req.strategy;
        let pool: WorkerPool<(usize, PathBuf), PageOutcome> = WorkerPool::new(
            workers,
            remaining,
            move |worker_id: usize, (index, image): (usize, PathBuf)| {
                debug!("Worker {} takes page {}", worker_id, index);
                let ctx = FallbackContext {
                    allocator: allocator.as_ref(),
                    engine: engine.as_ref(),
                    strategy,
                    cursor: cursor.as_ref(),
                    cancel: &cancel,
                };
                (index, detect_with_fallback(&ctx, &image))
            },
        );

        let outcome = self.collect(req, &pool, remaining);
        pool.shutdown();
        pool.wait();
        outcome
    }

    fn collect(
        &self,
        req: &DispatchRequest<'_>,
        pool: &WorkerPool<(usize, PathBuf), PageOutcome>,
        remaining: usize,
    ) -> Result<Interruptible<Vec<OcrPageResult>>, JobError> {
        for (index, image) in req.images.iter().enumerate().skip(req.start_index) {
            pool.submit((index, image.clone()))?;
        }

        let mut collected: BTreeMap<usize, OcrPageResult> = BTreeMap::new();
        while collected.len() < remaining {
            if req.cancel.is_cancelled() {
                return Ok(Interruptible::Stopped);
            }
            let (index, result) = match pool.recv_result_timeout(RESULT_POLL) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(JobError::Worker("page workers exited early".to_string()))
                }
            };
            let page = match result? {
                Interruptible::Finished(page) => page,
                Interruptible::Stopped => return Ok(Interruptible::Stopped),
            };
            let done = req.start_index + collected.len() + 1;
            self.record_page(req, index, &page, done)?;
            collected.insert(index, page);
        }

        Ok(Interruptible::Finished(collected.into_values().collect()))
    }

    /// Checkpoints one page and reports progress.
    fn record_page(
        &self,
        req: &DispatchRequest<'_>,
        index: usize,
        page: &OcrPageResult,
        image_done: usize,
    ) -> Result<(), JobError> {
        checkpoint::save_page(&self.db, req.item_id, index, page)?;
        job_repo::update_item(
            &self.db,
            req.item_id,
            &ItemUpdate {
                image_done: Some(image_done),
                ..Default::default()
            },
        )?;
        self.events.publish(
            JobEventType::ItemProgress,
            req.job_id,
            format!("{}/{} pages", image_done, req.images.len()),
            Some(serde_json::json!({
                "itemId": req.item_id,
                "pageIndex": index,
                "imageDone": image_done,
                "imageTotal": req.images.len(),
            })),
        );
        Ok(())
    }
}
