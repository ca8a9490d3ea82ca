//! Per-page checkpoints and the contiguous-prefix resume rule.
//!
//! A checkpoint is written as soon as a page's OCR finishes. When an item
//! starts again, checkpoints are accepted from page 0 upward only while
//! each one's stored image path matches the image now at that index; the
//! first gap or mismatch ends the prefix and everything after it is
//! reprocessed.

use std::path::PathBuf;

use log::{debug, warn};

use crate::db::{checkpoint_repo, Database, DatabaseError};
use crate::folders::normalize_path;
use crate::ocr::OcrPageResult;

/// Where an item picks up and the pages it already has.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeState {
    pub start_index: usize,
    pub cached_pages: Vec<OcrPageResult>,
}

impl ResumeState {
    pub fn fresh() -> Self {
        Self {
            start_index: 0,
            cached_pages: Vec::new(),
        }
    }
}

/// Computes the resume point of an item against its current image listing.
pub fn load_resume_state(
    db: &Database,
    job_item_id: &str,
    images: &[PathBuf],
) -> Result<ResumeState, DatabaseError> {
    let mut rows = checkpoint_repo::find_by_item(db, job_item_id)?;
    if rows.is_empty() {
        return Ok(ResumeState::fresh());
    }
    rows.sort_by_key(|r| r.page_index);

    let mut cached_pages = Vec::new();
    for row in rows {
        let index = cached_pages.len();
        if row.page_index != index {
            debug!("Checkpoint gap at page {} of item {}", index, job_item_id);
            break;
        }
        let Some(expected) = images.get(index) else {
            break;
        };
        if normalize_path(&row.page.image_path) != normalize_path(expected) {
            warn!(
                "Checkpoint of page {} of item {} is stale ({} != {}), resuming from there",
                index,
                job_item_id,
                row.page.image_path.display(),
                expected.display()
            );
            break;
        }
        cached_pages.push(row.page);
    }

    Ok(ResumeState {
        start_index: cached_pages.len(),
        cached_pages,
    })
}

/// Persists the OCR result of one page.
pub fn save_page(
    db: &Database,
    job_item_id: &str,
    page_index: usize,
    page: &OcrPageResult,
) -> Result<(), DatabaseError> {
    checkpoint_repo::upsert(db, job_item_id, page_index, page)
}

/// Drops all checkpoints of a completed item.
pub fn clear(db: &Database, job_item_id: &str) -> Result<(), DatabaseError> {
    let removed = checkpoint_repo::delete_by_item(db, job_item_id)?;
    debug!("Cleared {} checkpoints of item {}", removed, job_item_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repo;
    use crate::job::model::{ItemStatus, JobItemRecord, JobRecord, JobStatus};
    use crate::quota::KeySelectionStrategy;
    use chrono::Utc;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        let job = JobRecord {
            id: "j".to_string(),
            strategy: KeySelectionStrategy::MaxRemaining,
            parallelism: 1,
            status: JobStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            stop_reason: None,
            total_items: 1,
            processed_items: 0,
            last_error: None,
        };
        let item = JobItemRecord {
            id: "item".to_string(),
            job_id: "j".to_string(),
            queue_index: 0,
            folder_path: PathBuf::from("/scans"),
            image_total: 10,
            image_done: 0,
            status: ItemStatus::Pending,
            pdf_path: None,
            error_reason: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        job_repo::insert_job_with_items(&db, &job, &[item]).unwrap();
        db
    }

    fn images(n: usize) -> Vec<PathBuf> {
        (1..=n).map(|i| PathBuf::from(format!("/scans/page{}.png", i))).collect()
    }

    fn page(path: &PathBuf) -> OcrPageResult {
        OcrPageResult {
            image_path: path.clone(),
            full_text: path.display().to_string(),
            words: vec![],
        }
    }

    #[test]
    fn test_no_checkpoints_starts_at_zero() {
        let db = seeded();
        assert_eq!(load_resume_state(&db, "item", &images(3)).unwrap(), ResumeState::fresh());
    }

    #[test]
    fn test_full_prefix_is_accepted() {
        let db = seeded();
        let imgs = images(10);
        for (i, img) in imgs.iter().enumerate() {
            save_page(&db, "item", i, &page(img)).unwrap();
        }
        let state = load_resume_state(&db, "item", &imgs).unwrap();
        assert_eq!(state.start_index, 10);
        assert_eq!(state.cached_pages.len(), 10);
    }

    #[test]
    fn test_replaced_last_image_resumes_at_nine() {
        let db = seeded();
        let imgs = images(10);
        for (i, img) in imgs.iter().enumerate() {
            save_page(&db, "item", i, &page(img)).unwrap();
        }
        let mut current = imgs.clone();
        current[9] = PathBuf::from("/scans/page10-rescan.png");

        let state = load_resume_state(&db, "item", &current).unwrap();
        assert_eq!(state.start_index, 9);
        assert_eq!(state.cached_pages.len(), 9);
    }

    #[test]
    fn test_gap_stops_prefix() {
        let db = seeded();
        let imgs = images(5);
        for i in [0, 1, 3, 4] {
            save_page(&db, "item", i, &page(&imgs[i])).unwrap();
        }
        let state = load_resume_state(&db, "item", &imgs).unwrap();
        assert_eq!(state.start_index, 2);
    }

    #[test]
    fn test_folder_shrunk_below_checkpoints() {
        let db = seeded();
        let imgs = images(4);
        for (i, img) in imgs.iter().enumerate() {
            save_page(&db, "item", i, &page(img)).unwrap();
        }
        let state = load_resume_state(&db, "item", &imgs[..2]).unwrap();
        assert_eq!(state.start_index, 2);
    }

    #[test]
    fn test_clear_removes_all() {
        let db = seeded();
        let imgs = images(2);
        save_page(&db, "item", 0, &page(&imgs[0])).unwrap();
        clear(&db, "item").unwrap();
        assert_eq!(load_resume_state(&db, "item", &imgs).unwrap().start_index, 0);
    }
}
