use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use log::{error, info, warn};
use serde_json::json;
use tracing::info_span;
use uuid::Uuid;

use super::model::{
    ItemStatus, ItemUpdate, JobItemRecord, JobRecord, JobStatus, JobUpdate, JobView,
};
use super::report::{ItemReport, JobReport};
use crate::cancel::{CancellationToken, Interruptible};
use crate::checkpoint;
use crate::db::job_repo::{self, RecoveryCounts};
use crate::db::Database;
use crate::dispatch::{DispatchRequest, PageDispatcher};
use crate::error::JobError;
use crate::events::{EventBus, JobEventType};
use crate::folders;
use crate::pdf::PdfWriter;
use crate::quota::{KeySelectionStrategy, RoundRobinCursor};

pub const MAX_PARALLELISM: usize = 8;

const STOPPED_BY_USER: &str = "Stopped by user";
const FAILURE_STOP_REASON: &str = "OCR failure";
const STOPPED_DUE_TO_FAILURE: &str = "Stopped due to failure";
const INTERRUPTED_STOP_REASON: &str = "Unexpected interruption";
const STOPPED_DUE_TO_INTERRUPTION: &str = "Stopped due to unexpected interruption";

/// Where finished artifacts go.
#[derive(Debug, Clone)]
pub struct OutputDirs {
    pub pdf_directory: PathBuf,
    pub report_directory: PathBuf,
}

struct ActiveRun {
    job_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RunState {
    active: Option<ActiveRun>,
    handles: HashMap<String, JoinHandle<()>>,
}

struct Inner {
    db: Database,
    dispatcher: PageDispatcher,
    pdf: PdfWriter,
    events: EventBus,
    output: OutputDirs,
    state: Mutex<RunState>,
}

/// Owns the job lifecycle and runs at most one job at a time on a
/// background thread.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        db: Database,
        dispatcher: PageDispatcher,
        pdf: PdfWriter,
        events: EventBus,
        output: OutputDirs,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                dispatcher,
                pdf,
                events,
                output,
                state: Mutex::new(RunState::default()),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Fails every job and item a crash left RUNNING. Call once at startup,
    /// before any job is started.
    pub fn recover_after_restart(&self) -> Result<RecoveryCounts, JobError> {
        let counts = job_repo::recover_running_after_restart(&self.inner.db)?;
        if counts.jobs > 0 || counts.items > 0 {
            warn!(
                "Marked {} jobs and {} items interrupted by a restart as FAILED",
                counts.jobs, counts.items
            );
        }
        Ok(counts)
    }

    /// Validates the folders and persists a new job with one PENDING item
    /// per distinct folder.
    pub fn create(
        &self,
        folders: &[PathBuf],
        strategy: KeySelectionStrategy,
        parallelism: usize,
    ) -> Result<String, JobError> {
        if !(1..=MAX_PARALLELISM).contains(&parallelism) {
            return Err(JobError::InvalidInput(format!(
                "Parallelism must be between 1 and {}, got {}",
                MAX_PARALLELISM, parallelism
            )));
        }

        let mut normalized: Vec<PathBuf> = Vec::with_capacity(folders.len());
        for folder in folders {
            let folder = folders::normalize_folder(folder);
            if !normalized.contains(&folder) {
                normalized.push(folder);
            }
        }
        if normalized.is_empty() {
            return Err(JobError::InvalidInput(
                "At least one folder is required.".to_string(),
            ));
        }

        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut items = Vec::with_capacity(normalized.len());
        for (queue_index, folder) in normalized.into_iter().enumerate() {
            if !folder.is_dir() {
                return Err(JobError::InvalidInput(format!(
                    "Folder not found: {}",
                    folder.display()
                )));
            }
            let image_total = folders::list_images(&folder)
                .map_err(|e| JobError::Scan {
                    path: folder.clone(),
                    reason: e.to_string(),
                })?
                .len();
            if image_total == 0 {
                return Err(JobError::InvalidInput(format!(
                    "Folder has no supported images: {}",
                    folder.display()
                )));
            }
            items.push(JobItemRecord {
                id: Uuid::new_v4().to_string(),
                job_id: job_id.clone(),
                queue_index,
                folder_path: folder,
                image_total,
                image_done: 0,
                status: ItemStatus::Pending,
                pdf_path: None,
                error_reason: None,
                created_at: now,
                started_at: None,
                ended_at: None,
            });
        }

        let job = JobRecord {
            id: job_id.clone(),
            strategy,
            parallelism,
            status: JobStatus::Created,
            created_at: now,
            started_at: None,
            ended_at: None,
            stop_reason: None,
            total_items: items.len(),
            processed_items: 0,
            last_error: None,
        };
        job_repo::insert_job_with_items(&self.inner.db, &job, &items)?;

        info!("Created job {} with {} folders", job_id, items.len());
        self.inner.events.publish(
            JobEventType::JobCreated,
            &job_id,
            "Job created",
            Some(json!({ "jobId": job_id, "totalItems": items.len() })),
        );
        Ok(job_id)
    }

    pub fn list(&self) -> Result<Vec<JobView>, JobError> {
        job_repo::list_jobs(&self.inner.db)?
            .into_iter()
            .map(|job| self.inner.view(job))
            .collect()
    }

    pub fn get(&self, job_id: &str) -> Result<JobView, JobError> {
        let job = self.inner.find_job(job_id)?;
        self.inner.view(job)
    }

    /// Starts a job on the background thread and returns at once.
    ///
    /// Fails with `Conflict` while any job runs in this process, including
    /// `job_id` itself, and while a stored job is still marked RUNNING
    /// without a live run (restart recovery has not run yet).
    pub fn start(&self, job_id: &str) -> Result<(), JobError> {
        let mut state = self.inner.lock_state();
        if state.active.is_some() {
            return Err(JobError::Conflict(
                "Another job is already running.".to_string(),
            ));
        }
        if let Some(stale) = job_repo::find_running_job(&self.inner.db)? {
            return Err(JobError::Conflict(format!(
                "Job {} is still marked RUNNING; recover it before starting a job.",
                stale.id
            )));
        }

        self.inner.find_job(job_id)?;

        let processed = job_repo::items_by_job(&self.inner.db, job_id)?
            .iter()
            .filter(|item| item.is_verified_complete())
            .count();
        job_repo::prepare_job_for_run(&self.inner.db, job_id, processed)?;
        self.inner.events.publish(
            JobEventType::JobStarted,
            job_id,
            "Job started",
            Some(json!({ "processedItems": processed })),
        );

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let run_id = job_id.to_string();
        let run_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("scanbind-job-{}", job_id.chars().take(8).collect::<String>()))
            .spawn(move || inner.run_in_background(&run_id, &run_cancel));

        match handle {
            Ok(handle) => {
                state.active = Some(ActiveRun {
                    job_id: job_id.to_string(),
                    cancel,
                });
                state.handles.insert(job_id.to_string(), handle);
                Ok(())
            }
            Err(e) => {
                let reason = format!("Failed to spawn job thread: {}", e);
                error!("{}", reason);
                job_repo::update_job(
                    &self.inner.db,
                    job_id,
                    &JobUpdate {
                        status: Some(JobStatus::Failed),
                        ended_at: Some(Utc::now()),
                        last_error: Some(reason.clone()),
                        ..Default::default()
                    },
                )?;
                Err(JobError::Worker(reason))
            }
        }
    }

    /// Requests a cooperative stop. Honored at the next page or folder
    /// boundary; in-flight OCR calls finish first.
    pub fn stop(&self, job_id: &str) -> Result<(), JobError> {
        self.inner.find_job(job_id)?;
        {
            let state = self.inner.lock_state();
            if let Some(active) = state.active.as_ref().filter(|a| a.job_id == job_id) {
                active.cancel.cancel();
            }
        }
        info!("Stop requested for job {}", job_id);
        self.inner
            .events
            .publish(JobEventType::JobStopRequested, job_id, "Stop requested", None);
        Ok(())
    }

    /// Id of the job currently running, if any.
    pub fn running_job(&self) -> Option<String> {
        self.inner
            .lock_state()
            .active
            .as_ref()
            .map(|a| a.job_id.clone())
    }

    /// Blocks until the background run of `job_id` (if any) has ended.
    pub fn wait(&self, job_id: &str) {
        let handle = self.inner.lock_state().handles.remove(job_id);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Job thread for {} panicked", job_id);
            }
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn find_job(&self, job_id: &str) -> Result<JobRecord, JobError> {
        job_repo::find_job(&self.db, job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    fn view(&self, job: JobRecord) -> Result<JobView, JobError> {
        let items = job_repo::items_by_job(&self.db, &job.id)?;
        Ok(JobView { job, items })
    }

    fn run_in_background(&self, job_id: &str, cancel: &CancellationToken) {
        let mut report = JobReport::new(job_id);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_job(job_id, cancel, &mut report)
        }));
        if outcome.is_err() {
            error!("Job {} panicked", job_id);
        }

        if let Err(e) = self.reconcile(job_id) {
            error!("Failed to reconcile job {}: {}", job_id, e);
        }
        if let Ok(Some(job)) = job_repo::find_job(&self.db, job_id) {
            report.status = Some(job.status);
            report.stop_reason = job.stop_reason;
            report.error = job.last_error;
            report.processed_items = job.processed_items;
        }
        report.ended_at = Some(Utc::now());
        report.write_best_effort(&self.output.report_directory);

        let mut state = self.lock_state();
        if state.active.as_ref().is_some_and(|a| a.job_id == job_id) {
            state.active = None;
            // the run is over; a later `wait` has nothing left to join
            state.handles.remove(job_id);
        }
    }

    fn run_job(&self, job_id: &str, cancel: &CancellationToken, report: &mut JobReport) {
        let span = info_span!("job.run", job_id = %job_id);
        let _enter = span.enter();

        let mut processed = 0;
        let outcome = self.run_items(job_id, cancel, report, &mut processed);
        let terminal = match outcome {
            Ok(Interruptible::Finished(())) => {
                info!("Job {} completed ({} folders)", job_id, processed);
                self.finish(
                    job_id,
                    JobStatus::Completed,
                    processed,
                    None,
                    None,
                    JobEventType::JobCompleted,
                    "Job completed",
                )
            }
            Ok(Interruptible::Stopped) => {
                info!("Job {} stopped after {} folders", job_id, processed);
                job_repo::stop_open_items(&self.db, job_id, STOPPED_BY_USER)
                    .map_err(JobError::from)
                    .and_then(|_| {
                        self.finish(
                            job_id,
                            JobStatus::Stopped,
                            processed,
                            Some(STOPPED_BY_USER),
                            None,
                            JobEventType::JobStopped,
                            "Job stopped",
                        )
                    })
            }
            Err(e) => {
                error!("Job {} failed: {}", job_id, e);
                let message = e.to_string();
                job_repo::stop_open_items(&self.db, job_id, STOPPED_DUE_TO_FAILURE)
                    .map_err(JobError::from)
                    .and_then(|_| {
                        self.finish(
                            job_id,
                            JobStatus::Failed,
                            processed,
                            Some(FAILURE_STOP_REASON),
                            Some(message),
                            JobEventType::JobFailed,
                            "Job failed",
                        )
                    })
            }
        };
        if let Err(e) = terminal {
            error!("Failed to record the outcome of job {}: {}", job_id, e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        processed: usize,
        stop_reason: Option<&str>,
        last_error: Option<String>,
        event: JobEventType,
        message: &str,
    ) -> Result<(), JobError> {
        job_repo::update_job(
            &self.db,
            job_id,
            &JobUpdate {
                status: Some(status),
                ended_at: Some(Utc::now()),
                stop_reason: stop_reason.map(str::to_string),
                processed_items: Some(processed),
                last_error: last_error.clone(),
                ..Default::default()
            },
        )?;
        let payload = match last_error {
            Some(error) => json!({ "processedItems": processed, "error": error }),
            None => json!({ "processedItems": processed }),
        };
        self.events.publish(event, job_id, message, Some(payload));
        Ok(())
    }

    fn run_items(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
        report: &mut JobReport,
        processed: &mut usize,
    ) -> Result<Interruptible<()>, JobError> {
        let job = self.find_job(job_id)?;
        let items = job_repo::items_by_job(&self.db, job_id)?;
        let cursor = Arc::new(RoundRobinCursor::new());
        // `start` already counted the verified folders
        *processed = job.processed_items;

        for item in &items {
            if cancel.is_cancelled() {
                return Ok(Interruptible::Stopped);
            }
            if item.is_verified_complete() {
                info!(
                    "Skipping folder {} (already converted)",
                    item.folder_path.display()
                );
                continue;
            }
            if self.process_item(&job, item, &cursor, cancel, report)?.is_stopped() {
                return Ok(Interruptible::Stopped);
            }

            *processed += 1;
            job_repo::update_job(
                &self.db,
                job_id,
                &JobUpdate {
                    processed_items: Some(*processed),
                    ..Default::default()
                },
            )?;
        }
        Ok(Interruptible::Finished(()))
    }

    /// Runs one folder; on failure the item is marked FAILED before the
    /// error is returned.
    fn process_item(
        &self,
        job: &JobRecord,
        item: &JobItemRecord,
        cursor: &Arc<RoundRobinCursor>,
        cancel: &CancellationToken,
        report: &mut JobReport,
    ) -> Result<Interruptible<()>, JobError> {
        let span = info_span!("item.process", item_id = %item.id, queue_index = item.queue_index);
        let _enter = span.enter();

        let mut resumed_from = 0;
        match self.convert_folder(job, item, cursor, cancel, &mut resumed_from) {
            Ok(Interruptible::Finished((pdf_path, image_total))) => {
                report.items.push(ItemReport {
                    folder_path: item.folder_path.clone(),
                    image_total,
                    status: ItemStatus::Completed,
                    pdf_path: Some(pdf_path),
                    resumed_from,
                    error: None,
                });
                Ok(Interruptible::Finished(()))
            }
            Ok(Interruptible::Stopped) => Ok(Interruptible::Stopped),
            Err(e) => {
                let reason = e.to_string();
                warn!("Folder {} failed: {}", item.folder_path.display(), reason);
                job_repo::update_item(
                    &self.db,
                    &item.id,
                    &ItemUpdate {
                        status: Some(ItemStatus::Failed),
                        error_reason: Some(reason.clone()),
                        ended_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )?;
                self.events.publish(
                    JobEventType::ItemFailed,
                    &job.id,
                    "Folder failed",
                    Some(json!({
                        "itemId": item.id,
                        "folder": item.folder_path,
                        "error": reason,
                    })),
                );
                report.items.push(ItemReport {
                    folder_path: item.folder_path.clone(),
                    image_total: item.image_total,
                    status: ItemStatus::Failed,
                    pdf_path: None,
                    resumed_from,
                    error: Some(reason),
                });
                Err(e)
            }
        }
    }

    fn convert_folder(
        &self,
        job: &JobRecord,
        item: &JobItemRecord,
        cursor: &Arc<RoundRobinCursor>,
        cancel: &CancellationToken,
        resumed_from: &mut usize,
    ) -> Result<Interruptible<(PathBuf, usize)>, JobError> {
        let images = folders::list_images(&item.folder_path).map_err(|e| JobError::Scan {
            path: item.folder_path.clone(),
            reason: e.to_string(),
        })?;
        let resume = checkpoint::load_resume_state(&self.db, &item.id, &images)?;
        let recorded = item.image_done.min(images.len());
        if recorded > resume.start_index {
            warn!(
                "Item {} recorded {} pages done but only {} contiguous checkpoints match; resuming at {}",
                item.id, recorded, resume.start_index, resume.start_index
            );
        }
        *resumed_from = resume.start_index;

        job_repo::begin_item(&self.db, &item.id, resume.start_index)?;
        self.events.publish(
            JobEventType::ItemStarted,
            &job.id,
            "Folder started",
            Some(json!({
                "itemId": item.id,
                "folder": item.folder_path,
                "resumeFrom": resume.start_index,
                "imageTotal": images.len(),
            })),
        );

        let request = DispatchRequest {
            job_id: &job.id,
            item_id: &item.id,
            images: &images,
            start_index: resume.start_index,
            parallelism: job.parallelism,
            strategy: job.strategy,
            cursor: Arc::clone(cursor),
            cancel: cancel.clone(),
        };
        let fresh = match self.dispatcher.dispatch(&request)? {
            Interruptible::Finished(pages) => pages,
            Interruptible::Stopped => return Ok(Interruptible::Stopped),
        };

        let mut pages = resume.cached_pages;
        pages.extend(fresh);
        if pages.len() != images.len() {
            return Err(JobError::ResumeMismatch {
                expected: images.len(),
                actual: pages.len(),
            });
        }

        let target = unique_pdf_path(&self.output.pdf_directory, &item.folder_path);
        let pdf_path = self.pdf.write_searchable_pdf(&pages, &target)?;

        checkpoint::clear(&self.db, &item.id)?;
        job_repo::update_item(
            &self.db,
            &item.id,
            &ItemUpdate {
                status: Some(ItemStatus::Completed),
                image_done: Some(images.len()),
                pdf_path: Some(pdf_path.clone()),
                ended_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;
        info!(
            "Folder {} converted to {}",
            item.folder_path.display(),
            pdf_path.display()
        );
        self.events.publish(
            JobEventType::ItemCompleted,
            &job.id,
            "Folder completed",
            Some(json!({ "itemId": item.id, "pdfPath": pdf_path })),
        );
        Ok(Interruptible::Finished((pdf_path, images.len())))
    }

    /// Settles a job the run loop left RUNNING.
    fn reconcile(&self, job_id: &str) -> Result<(), JobError> {
        let Some(job) = job_repo::find_job(&self.db, job_id)? else {
            return Ok(());
        };
        if job.status != JobStatus::Running {
            return Ok(());
        }

        let items = job_repo::items_by_job(&self.db, job_id)?;
        let completed = items.iter().filter(|i| i.is_verified_complete()).count();
        let failure = items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .filter_map(|i| i.error_reason.clone())
            .find(|reason| !reason.trim().is_empty());
        let open = items
            .iter()
            .any(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::Running));

        let update = if let Some(reason) = failure {
            JobUpdate {
                status: Some(JobStatus::Failed),
                stop_reason: Some(FAILURE_STOP_REASON.to_string()),
                last_error: Some(reason),
                ..Default::default()
            }
        } else if !items.is_empty() && completed == items.len() {
            JobUpdate {
                status: Some(JobStatus::Completed),
                ..Default::default()
            }
        } else if open {
            job_repo::stop_open_items(&self.db, job_id, STOPPED_DUE_TO_INTERRUPTION)?;
            JobUpdate {
                status: Some(JobStatus::Failed),
                stop_reason: Some(INTERRUPTED_STOP_REASON.to_string()),
                ..Default::default()
            }
        } else {
            return Ok(());
        };

        warn!("Reconciling job {} left RUNNING to {:?}", job_id, update.status);
        job_repo::update_job(
            &self.db,
            job_id,
            &JobUpdate {
                ended_at: Some(Utc::now()),
                processed_items: Some(completed),
                ..update
            },
        )?;
        Ok(())
    }
}

/// `<pdf dir>/<folder name>.pdf`, with `_<epoch millis>` appended to the
/// stem when that file already exists.
pub(crate) fn unique_pdf_path(pdf_directory: &Path, folder: &Path) -> PathBuf {
    let stem = folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "output".to_string());
    let candidate = pdf_directory.join(format!("{}.pdf", stem));
    if !candidate.exists() {
        return candidate;
    }
    pdf_directory.join(format!("{}_{}.pdf", stem, Utc::now().timestamp_millis()))
}
