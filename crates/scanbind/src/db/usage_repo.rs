//! Usage repository: monthly quota rows and the append-only audit trail.
//!
//! Every public function is a single transaction, so a crash never leaves a
//! usage change without its audit row.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{now_text, parse_timestamp, Database, DatabaseError};
use chrono::{DateTime, Utc};

/// Usage of one credential within one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub credential_id: String,
    pub period: String,
    pub cap_units: i64,
    pub used_units: i64,
    pub adjusted_units: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn remaining(&self) -> i64 {
        (self.cap_units - self.used_units).max(0)
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            credential_id: row.get("credential_id")?,
            period: row.get("period")?,
            cap_units: row.get("cap_units")?,
            used_units: row.get("used_units")?,
            adjusted_units: row.get("adjusted_units")?,
            updated_at: parse_timestamp(row.get("updated_at")?),
        })
    }
}

/// One audit row: a manual adjustment or an exhaustion event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub credential_id: String,
    pub period: String,
    pub old_used_units: i64,
    pub new_used_units: i64,
    pub reason: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl AuditEntry {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            credential_id: row.get("credential_id")?,
            period: row.get("period")?,
            old_used_units: row.get("old_used_units")?,
            new_used_units: row.get("new_used_units")?,
            reason: row.get("reason")?,
            created_at: parse_timestamp(row.get("created_at")?),
        })
    }
}

fn find_in(
    conn: &Connection,
    credential_id: &str,
    period: &str,
) -> Result<Option<UsageRecord>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM usage_monthly WHERE credential_id = ?1 AND period = ?2",
            params![credential_id, period],
            UsageRecord::from_row,
        )
        .optional()?;
    Ok(row)
}

fn ensure_in(
    conn: &Connection,
    credential_id: &str,
    period: &str,
    cap_units: i64,
) -> Result<UsageRecord, DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO usage_monthly (credential_id, period, cap_units, used_units, adjusted_units, updated_at)
         VALUES (?1, ?2, ?3, 0, 0, ?4)",
        params![credential_id, period, cap_units, now_text()],
    )?;
    let row = conn.query_row(
        "SELECT * FROM usage_monthly WHERE credential_id = ?1 AND period = ?2",
        params![credential_id, period],
        UsageRecord::from_row,
    )?;
    Ok(row)
}

fn audit_in(
    conn: &Connection,
    credential_id: &str,
    period: &str,
    old_used: i64,
    new_used: i64,
    reason: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO usage_audit (credential_id, period, old_used_units, new_used_units, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![credential_id, period, old_used, new_used, reason, now_text()],
    )?;
    Ok(())
}

/// All usage rows recorded for a period.
pub fn find_by_period(db: &Database, period: &str) -> Result<Vec<UsageRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM usage_monthly WHERE period = ?1")?;
        let rows = stmt
            .query_map(params![period], UsageRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Finds the usage row of a credential for a period, if it was ever created.
pub fn find(
    db: &Database,
    credential_id: &str,
    period: &str,
) -> Result<Option<UsageRecord>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, credential_id, period))
}

/// Returns the usage row, creating it with `cap_units` and zero usage on
/// first reference to the period.
pub fn ensure_row(
    db: &Database,
    credential_id: &str,
    period: &str,
    cap_units: i64,
) -> Result<UsageRecord, DatabaseError> {
    db.with_tx(|tx| ensure_in(tx, credential_id, period, cap_units))
}

/// Adds `delta` to `used_units` without any bound check.
pub fn increment_used(
    db: &Database,
    credential_id: &str,
    period: &str,
    cap_units: i64,
    delta: i64,
) -> Result<UsageRecord, DatabaseError> {
    db.with_tx(|tx| {
        ensure_in(tx, credential_id, period, cap_units)?;
        tx.execute(
            "UPDATE usage_monthly SET used_units = used_units + ?3, updated_at = ?4
              WHERE credential_id = ?1 AND period = ?2",
            params![credential_id, period, delta, now_text()],
        )?;
        ensure_in(tx, credential_id, period, cap_units)
    })
}

/// Subtracts one unit, never going below zero.
pub fn decrement_used(
    db: &Database,
    credential_id: &str,
    period: &str,
    cap_units: i64,
) -> Result<UsageRecord, DatabaseError> {
    db.with_tx(|tx| {
        ensure_in(tx, credential_id, period, cap_units)?;
        tx.execute(
            "UPDATE usage_monthly SET used_units = MAX(0, used_units - 1), updated_at = ?3
              WHERE credential_id = ?1 AND period = ?2",
            params![credential_id, period, now_text()],
        )?;
        ensure_in(tx, credential_id, period, cap_units)
    })
}

/// Sets `used_units` (floored at 0), adds the delta to `adjusted_units` and
/// appends an audit row. Returns `(old, new)`.
pub fn adjust_used(
    db: &Database,
    credential_id: &str,
    period: &str,
    cap_units: i64,
    new_used: i64,
    reason: &str,
) -> Result<(UsageRecord, UsageRecord), DatabaseError> {
    db.with_tx(|tx| {
        let old = ensure_in(tx, credential_id, period, cap_units)?;
        let new_used = new_used.max(0);
        tx.execute(
            "UPDATE usage_monthly
                SET used_units = ?3,
                    adjusted_units = adjusted_units + ?4,
                    updated_at = ?5
              WHERE credential_id = ?1 AND period = ?2",
            params![
                credential_id,
                period,
                new_used,
                new_used - old.used_units,
                now_text()
            ],
        )?;
        audit_in(tx, credential_id, period, old.used_units, new_used, reason)?;
        let updated = ensure_in(tx, credential_id, period, cap_units)?;
        Ok((old, updated))
    })
}

/// Forces `used_units` up to the row's cap and records an audit row.
/// Returns `None` when the row was already at or above its cap.
pub fn mark_exhausted(
    db: &Database,
    credential_id: &str,
    period: &str,
    cap_units: i64,
    reason: &str,
) -> Result<Option<UsageRecord>, DatabaseError> {
    db.with_tx(|tx| {
        let existing = ensure_in(tx, credential_id, period, cap_units)?;
        if existing.used_units >= existing.cap_units {
            return Ok(None);
        }
        tx.execute(
            "UPDATE usage_monthly SET used_units = cap_units, updated_at = ?3
              WHERE credential_id = ?1 AND period = ?2",
            params![credential_id, period, now_text()],
        )?;
        audit_in(
            tx,
            credential_id,
            period,
            existing.used_units,
            existing.cap_units,
            reason,
        )?;
        ensure_in(tx, credential_id, period, cap_units).map(Some)
    })
}

/// Audit rows of a credential, newest first.
pub fn audit_for(db: &Database, credential_id: &str) -> Result<Vec<AuditEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM usage_audit WHERE credential_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map(params![credential_id], AuditEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialRecord;
    use crate::db::credential_repo;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        credential_repo::upsert(
            &db,
            &CredentialRecord::for_test("c1", "fp1", "/keys/a.json", true),
        )
        .unwrap();
        db
    }

    #[test]
    fn test_ensure_row_is_lazy_and_stable() {
        let db = seeded();
        assert!(find(&db, "c1", "2026-03").unwrap().is_none());

        let row = ensure_row(&db, "c1", "2026-03", 1000).unwrap();
        assert_eq!(row.cap_units, 1000);
        assert_eq!(row.used_units, 0);

        // A later cap change does not rewrite an existing row.
        let again = ensure_row(&db, "c1", "2026-03", 5).unwrap();
        assert_eq!(again.cap_units, 1000);
        assert_eq!(find_by_period(&db, "2026-03").unwrap().len(), 1);
        assert!(find_by_period(&db, "2026-04").unwrap().is_empty());
    }

    #[test]
    fn test_increment_is_unbounded_and_decrement_floors() {
        let db = seeded();
        let row = increment_used(&db, "c1", "2026-03", 1, 3).unwrap();
        assert_eq!(row.used_units, 3);
        assert_eq!(row.remaining(), 0);

        for _ in 0..5 {
            decrement_used(&db, "c1", "2026-03", 1).unwrap();
        }
        assert_eq!(find(&db, "c1", "2026-03").unwrap().unwrap().used_units, 0);
    }

    #[test]
    fn test_consume_then_release_round_trips() {
        let db = seeded();
        increment_used(&db, "c1", "2026-03", 10, 4).unwrap();
        increment_used(&db, "c1", "2026-03", 10, 1).unwrap();
        let row = decrement_used(&db, "c1", "2026-03", 10).unwrap();
        assert_eq!(row.used_units, 4);
    }

    #[test]
    fn test_adjust_used_tracks_delta_and_audits() {
        let db = seeded();
        increment_used(&db, "c1", "2026-03", 100, 10).unwrap();

        let (old, new) = adjust_used(&db, "c1", "2026-03", 100, 4, "console sync").unwrap();
        assert_eq!(old.used_units, 10);
        assert_eq!(new.used_units, 4);
        assert_eq!(new.adjusted_units, -6);

        let (_, floored) = adjust_used(&db, "c1", "2026-03", 100, -3, "clamp").unwrap();
        assert_eq!(floored.used_units, 0);

        let audit = audit_for(&db, "c1").unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].reason, "clamp");
        assert_eq!(audit[1].old_used_units, 10);
        assert_eq!(audit[1].new_used_units, 4);
    }

    #[test]
    fn test_mark_exhausted_is_idempotent() {
        let db = seeded();
        increment_used(&db, "c1", "2026-03", 5, 2).unwrap();

        let row = mark_exhausted(&db, "c1", "2026-03", 5, "quota").unwrap().unwrap();
        assert_eq!(row.used_units, 5);
        assert!(mark_exhausted(&db, "c1", "2026-03", 5, "quota").unwrap().is_none());

        let audit = audit_for(&db, "c1").unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].old_used_units, 2);
        assert_eq!(audit[0].new_used_units, 5);
    }
}
