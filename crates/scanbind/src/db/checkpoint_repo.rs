//! Page checkpoint repository: the `ocr_page_checkpoints` table.

use std::path::PathBuf;

use rusqlite::{params, Row};

use super::{now_text, Database, DatabaseError};
use crate::ocr::{OcrPageResult, OcrWord};

/// A stored page result.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRow {
    pub job_item_id: String,
    pub page_index: usize,
    pub page: OcrPageResult,
}

/// Row as stored, before the word list is decoded.
struct RawCheckpoint {
    job_item_id: String,
    page_index: usize,
    image_path: String,
    full_text: Option<String>,
    words_json: String,
}

impl RawCheckpoint {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_item_id: row.get("job_item_id")?,
            page_index: row.get::<_, i64>("page_index")?.max(0) as usize,
            image_path: row.get("image_path")?,
            full_text: row.get("full_text")?,
            words_json: row.get("words_json")?,
        })
    }

    fn decode(self) -> Result<CheckpointRow, DatabaseError> {
        let words: Vec<OcrWord> = serde_json::from_str(&self.words_json)?;
        Ok(CheckpointRow {
            job_item_id: self.job_item_id,
            page_index: self.page_index,
            page: OcrPageResult {
                image_path: PathBuf::from(self.image_path),
                full_text: self.full_text.unwrap_or_default(),
                words,
            },
        })
    }
}

/// Inserts or replaces the checkpoint of one page.
pub fn upsert(
    db: &Database,
    job_item_id: &str,
    page_index: usize,
    page: &OcrPageResult,
) -> Result<(), DatabaseError> {
    let words_json = serde_json::to_string(&page.words)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO ocr_page_checkpoints (job_item_id, page_index, image_path, full_text, words_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(job_item_id, page_index) DO UPDATE SET
                image_path = excluded.image_path,
                full_text = excluded.full_text,
                words_json = excluded.words_json,
                updated_at = excluded.updated_at",
            params![
                job_item_id,
                page_index as i64,
                page.image_path.to_string_lossy(),
                page.full_text,
                words_json,
                now_text(),
            ],
        )?;
        Ok(())
    })
}

/// All checkpoints of an item in page order.
pub fn find_by_item(db: &Database, job_item_id: &str) -> Result<Vec<CheckpointRow>, DatabaseError> {
    let raw = db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM ocr_page_checkpoints WHERE job_item_id = ?1 ORDER BY page_index ASC",
        )?;
        let rows = stmt
            .query_map(params![job_item_id], RawCheckpoint::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    raw.into_iter().map(RawCheckpoint::decode).collect()
}

/// Number of checkpoints stored for an item.
pub fn count_by_item(db: &Database, job_item_id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ocr_page_checkpoints WHERE job_item_id = ?1",
            params![job_item_id],
            |r| r.get(0),
        )?;
        Ok(count.max(0) as usize)
    })
}

/// Deletes every checkpoint of an item. Returns the number of rows removed.
pub fn delete_by_item(db: &Database, job_item_id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let count = conn.execute(
            "DELETE FROM ocr_page_checkpoints WHERE job_item_id = ?1",
            params![job_item_id],
        )?;
        Ok(count)
    })
}
