//! Job repository: CRUD operations for the `jobs` and `job_items` tables.

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, now_text, parse_column, parse_timestamp, Database, DatabaseError};
use crate::job::model::{ItemUpdate, JobItemRecord, JobRecord, JobUpdate};

pub const RESTART_STOP_REASON: &str = "Application restarted";
pub const RESTART_JOB_ERROR: &str = "Application restarted while job was running";
pub const RESTART_ITEM_ERROR: &str = "Application restarted while item was running";

fn job_from_row(row: &Row<'_>) -> Result<JobRecord, rusqlite::Error> {
    Ok(JobRecord {
        id: row.get("id")?,
        strategy: parse_column(row, "strategy")?,
        parallelism: row.get::<_, i64>("parallelism")?.max(1) as usize,
        status: parse_column(row, "status")?,
        created_at: parse_timestamp(row.get("created_at")?).unwrap_or_default(),
        started_at: parse_timestamp(row.get("started_at")?),
        ended_at: parse_timestamp(row.get("ended_at")?),
        stop_reason: row.get("stop_reason")?,
        total_items: row.get::<_, i64>("total_items")?.max(0) as usize,
        processed_items: row.get::<_, i64>("processed_items")?.max(0) as usize,
        last_error: row.get("last_error")?,
    })
}

fn item_from_row(row: &Row<'_>) -> Result<JobItemRecord, rusqlite::Error> {
    Ok(JobItemRecord {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        queue_index: row.get::<_, i64>("queue_index")?.max(0) as usize,
        folder_path: PathBuf::from(row.get::<_, String>("folder_path")?),
        image_total: row.get::<_, i64>("image_total")?.max(0) as usize,
        image_done: row.get::<_, i64>("image_done")?.max(0) as usize,
        status: parse_column(row, "status")?,
        pdf_path: row.get::<_, Option<String>>("pdf_path")?.map(PathBuf::from),
        error_reason: row.get("error_reason")?,
        created_at: parse_timestamp(row.get("created_at")?).unwrap_or_default(),
        started_at: parse_timestamp(row.get("started_at")?),
        ended_at: parse_timestamp(row.get("ended_at")?),
    })
}

fn path_text(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Inserts a job and all of its items in one transaction.
pub fn insert_job_with_items(
    db: &Database,
    job: &JobRecord,
    items: &[JobItemRecord],
) -> Result<(), DatabaseError> {
    db.with_tx(|tx| {
        tx.execute(
            "INSERT INTO jobs (id, strategy, parallelism, status, created_at, started_at, ended_at,
             stop_reason, total_items, processed_items, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.id,
                job.strategy.as_str(),
                job.parallelism as i64,
                job.status.as_str(),
                format_timestamp(job.created_at),
                job.started_at.map(format_timestamp),
                job.ended_at.map(format_timestamp),
                job.stop_reason,
                job.total_items as i64,
                job.processed_items as i64,
                job.last_error,
            ],
        )?;

        let mut stmt = tx.prepare(
            "INSERT INTO job_items (id, job_id, queue_index, folder_path, image_total, image_done,
             status, pdf_path, error_reason, created_at, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        for item in items {
            stmt.execute(params![
                item.id,
                item.job_id,
                item.queue_index as i64,
                path_text(&item.folder_path),
                item.image_total as i64,
                item.image_done as i64,
                item.status.as_str(),
                item.pdf_path.as_deref().map(path_text),
                item.error_reason,
                format_timestamp(item.created_at),
                item.started_at.map(format_timestamp),
                item.ended_at.map(format_timestamp),
            ])?;
        }
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_job(db: &Database, id: &str) -> Result<Option<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
            .optional()?;
        Ok(job)
    })
}

/// Lists all jobs, newest first.
pub fn list_jobs(db: &Database) -> Result<Vec<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC")?;
        let rows = stmt
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Items of a job in processing order.
pub fn items_by_job(db: &Database, job_id: &str) -> Result<Vec<JobItemRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM job_items WHERE job_id = ?1 ORDER BY queue_index ASC")?;
        let rows = stmt
            .query_map(params![job_id], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Finds a single item by its ID.
pub fn find_item(db: &Database, id: &str) -> Result<Option<JobItemRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let item = conn
            .query_row(
                "SELECT * FROM job_items WHERE id = ?1",
                params![id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    })
}

/// Returns the most recently created job still marked RUNNING, if any.
pub fn find_running_job(db: &Database) -> Result<Option<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE status = 'RUNNING' ORDER BY created_at DESC LIMIT 1",
                [],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    })
}

/// Moves a job to RUNNING for a fresh run: clears stop/error fields and
/// `ended_at`, stamps `started_at`, and sets the processed count.
pub fn prepare_job_for_run(
    db: &Database,
    id: &str,
    processed_items: usize,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs
                SET status = 'RUNNING',
                    stop_reason = NULL,
                    last_error = NULL,
                    processed_items = ?2,
                    started_at = ?3,
                    ended_at = NULL
              WHERE id = ?1",
            params![id, processed_items as i64, now_text()],
        )?;
        Ok(())
    })
}

/// Applies a partial update to a job; `None` fields keep their stored value.
pub fn update_job(db: &Database, id: &str, update: &JobUpdate) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs
                SET status = COALESCE(?2, status),
                    started_at = COALESCE(?3, started_at),
                    ended_at = COALESCE(?4, ended_at),
                    stop_reason = COALESCE(?5, stop_reason),
                    processed_items = COALESCE(?6, processed_items),
                    last_error = COALESCE(?7, last_error)
              WHERE id = ?1",
            params![
                id,
                update.status.map(|s| s.as_str()),
                update.started_at.map(format_timestamp),
                update.ended_at.map(format_timestamp),
                update.stop_reason,
                update.processed_items.map(|n| n as i64),
                update.last_error,
            ],
        )?;
        Ok(())
    })
}

/// Marks an item RUNNING at the given resume offset, clearing any error and
/// end time left over from a previous run.
pub fn begin_item(db: &Database, id: &str, image_done: usize) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE job_items
                SET status = 'RUNNING',
                    image_done = ?2,
                    error_reason = NULL,
                    started_at = ?3,
                    ended_at = NULL
              WHERE id = ?1",
            params![id, image_done as i64, now_text()],
        )?;
        Ok(())
    })
}

/// Applies a partial update to an item; `None` fields keep their stored value.
pub fn update_item(db: &Database, id: &str, update: &ItemUpdate) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE job_items
                SET status = COALESCE(?2, status),
                    image_done = COALESCE(?3, image_done),
                    pdf_path = COALESCE(?4, pdf_path),
                    error_reason = COALESCE(?5, error_reason),
                    started_at = COALESCE(?6, started_at),
                    ended_at = COALESCE(?7, ended_at)
              WHERE id = ?1",
            params![
                id,
                update.status.map(|s| s.as_str()),
                update.image_done.map(|n| n as i64),
                update.pdf_path.as_deref().map(path_text),
                update.error_reason,
                update.started_at.map(format_timestamp),
                update.ended_at.map(format_timestamp),
            ],
        )?;
        Ok(())
    })
}

/// Forces every PENDING or RUNNING item of a job to STOPPED with `reason`.
/// Returns the number of items touched.
pub fn stop_open_items(db: &Database, job_id: &str, reason: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let count = conn.execute(
            "UPDATE job_items
                SET status = 'STOPPED',
                    error_reason = ?2,
                    ended_at = COALESCE(ended_at, ?3)
              WHERE job_id = ?1 AND status IN ('PENDING', 'RUNNING')",
            params![job_id, reason, now_text()],
        )?;
        Ok(count)
    })
}

/// Summary of a crash-recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryCounts {
    pub jobs: usize,
    pub items: usize,
}

fn recover_running(conn: &Connection) -> Result<RecoveryCounts, DatabaseError> {
    let now = now_text();
    let jobs = conn.execute(
        "UPDATE jobs
            SET status = 'FAILED',
                ended_at = COALESCE(ended_at, ?1),
                stop_reason = COALESCE(stop_reason, ?2),
                last_error = COALESCE(last_error, ?3)
          WHERE status = 'RUNNING'",
        params![now, RESTART_STOP_REASON, RESTART_JOB_ERROR],
    )?;
    let items = conn.execute(
        "UPDATE job_items
            SET status = 'FAILED',
                ended_at = COALESCE(ended_at, ?1),
                error_reason = COALESCE(error_reason, ?2)
          WHERE status = 'RUNNING'",
        params![now, RESTART_ITEM_ERROR],
    )?;
    Ok(RecoveryCounts { jobs, items })
}

/// Fails every job and item left RUNNING by an abnormal shutdown.
pub fn recover_running_after_restart(db: &Database) -> Result<RecoveryCounts, DatabaseError> {
    db.with_tx(|tx| recover_running(tx))
}
