//! Credential repository: CRUD operations for the `credentials` table.

use std::path::PathBuf;

use rusqlite::{params, OptionalExtension, Row};

use super::{now_text, parse_timestamp, Database, DatabaseError};
use crate::credentials::CredentialRecord;

fn from_row(row: &Row<'_>) -> Result<CredentialRecord, rusqlite::Error> {
    Ok(CredentialRecord {
        id: row.get("id")?,
        fingerprint: row.get("fingerprint")?,
        file_path: PathBuf::from(row.get::<_, String>("file_path")?),
        file_name: row.get("file_name")?,
        account_label: row.get("account_label")?,
        project_id: row.get("project_id")?,
        service_account_email: row.get("service_account_email")?,
        private_key_id: row.get("private_key_id")?,
        active: row.get::<_, i64>("is_active")? == 1,
        created_at: parse_timestamp(row.get("created_at")?),
        updated_at: parse_timestamp(row.get("updated_at")?),
    })
}

/// All credentials ordered by file name.
pub fn find_all(db: &Database) -> Result<Vec<CredentialRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM credentials ORDER BY file_name ASC, id ASC")?;
        let rows = stmt
            .query_map([], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Finds a credential by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<CredentialRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM credentials WHERE id = ?1",
                params![id],
                from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Finds a credential by its fingerprint.
pub fn find_by_fingerprint(
    db: &Database,
    fingerprint: &str,
) -> Result<Option<CredentialRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM credentials WHERE fingerprint = ?1",
                params![fingerprint],
                from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Inserts a credential, or refreshes the stored one with the same
/// fingerprint. The stored id wins on conflict.
pub fn upsert(db: &Database, record: &CredentialRecord) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let now = now_text();
        conn.execute(
            "INSERT INTO credentials (id, fingerprint, file_path, file_name, account_label, project_id,
             service_account_email, private_key_id, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(fingerprint) DO UPDATE SET
                file_path = excluded.file_path,
                file_name = excluded.file_name,
                account_label = excluded.account_label,
                project_id = excluded.project_id,
                service_account_email = excluded.service_account_email,
                private_key_id = excluded.private_key_id,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
            params![
                record.id,
                record.fingerprint,
                record.file_path.to_string_lossy(),
                record.file_name,
                record.account_label,
                record.project_id,
                record.service_account_email,
                record.private_key_id,
                record.active as i64,
                now,
            ],
        )?;
        Ok(())
    })
}

/// Marks exactly the given fingerprints active and every other credential
/// inactive, in one transaction.
pub fn set_active_fingerprints(db: &Database, fingerprints: &[String]) -> Result<(), DatabaseError> {
    db.with_tx(|tx| {
        let now = now_text();
        tx.execute(
            "UPDATE credentials SET is_active = 0, updated_at = ?1",
            params![now],
        )?;
        let mut stmt = tx.prepare(
            "UPDATE credentials SET is_active = 1, updated_at = ?1 WHERE fingerprint = ?2",
        )?;
        for fingerprint in fingerprints {
            stmt.execute(params![now, fingerprint])?;
        }
        Ok(())
    })
}
