use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset};
use log::{debug, info, warn};
use serde::Serialize;

use super::period::PeriodClock;
use super::strategy::{self, KeySelectionStrategy, RoundRobinCursor};
use crate::credentials::CredentialRecord;
use crate::db::usage_repo::{self, AuditEntry, UsageRecord};
use crate::db::{credential_repo, Database};
use crate::error::QuotaError;

/// Whether a credential can currently be used.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialStatus {
    /// Marked active by the last scan and the key file is on disk.
    Active,
    Missing,
}

/// A credential with its usage in the current period.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub account_label: Option<String>,
    pub project_id: Option<String>,
    pub service_account_email: Option<String>,
    pub cap_units: i64,
    pub used_units: i64,
    pub remaining_units: i64,
    pub period: String,
    pub reset_at: DateTime<FixedOffset>,
    pub status: CredentialStatus,
}

impl CredentialSummary {
    pub fn is_eligible(&self) -> bool {
        self.status == CredentialStatus::Active && self.remaining_units > 0
    }
}

/// A credential picked for one remote call, already pre-charged one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedCredential {
    pub credential_id: String,
    pub file_path: PathBuf,
}

/// Per-credential monthly quota bookkeeping.
///
/// `select_and_consume` is the only path that hands out credentials; it
/// holds `allocation` across both selection and the pre-charge so two
/// workers never both take the last unit of the same credential.
pub struct QuotaAllocator {
    db: Database,
    clock: PeriodClock,
    monthly_cap: i64,
    allocation: Mutex<()>,
}

impl QuotaAllocator {
    pub fn new(db: Database, clock: PeriodClock, monthly_cap: i64) -> Self {
        Self {
            db,
            clock,
            monthly_cap,
            allocation: Mutex::new(()),
        }
    }

    pub fn clock(&self) -> &PeriodClock {
        &self.clock
    }

    /// Every known credential with its usage for the current period, in
    /// file-name order. Usage rows are created on first sight.
    pub fn list_summaries(&self) -> Result<Vec<CredentialSummary>, QuotaError> {
        let period = self.clock.current_period();
        let reset_at = self.clock.next_reset_at().fixed_offset();

        let credentials = credential_repo::find_all(&self.db)?;
        let mut usage: HashMap<String, UsageRecord> = usage_repo::find_by_period(&self.db, &period)?
            .into_iter()
            .map(|u| (u.credential_id.clone(), u))
            .collect();

        let mut summaries = Vec::with_capacity(credentials.len());
        for credential in credentials {
            let record = match usage.remove(&credential.id) {
                Some(record) => record,
                None => usage_repo::ensure_row(&self.db, &credential.id, &period, self.monthly_cap)?,
            };
            summaries.push(summarize(credential, &record, &period, reset_at));
        }
        Ok(summaries)
    }

    pub fn find_summary(&self, credential_id: &str) -> Result<CredentialSummary, QuotaError> {
        self.list_summaries()?
            .into_iter()
            .find(|s| s.id == credential_id)
            .ok_or_else(|| QuotaError::NotFound(credential_id.to_string()))
    }

    /// Selects an eligible credential under `strategy` and pre-charges one
    /// unit to it, atomically with respect to other callers.
    pub fn select_and_consume(
        &self,
        strategy: KeySelectionStrategy,
        cursor: &RoundRobinCursor,
    ) -> Result<AllocatedCredential, QuotaError> {
        let _guard = self
            .allocation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let eligible: Vec<CredentialSummary> = self
            .list_summaries()?
            .into_iter()
            .filter(CredentialSummary::is_eligible)
            .collect();
        let remaining: Vec<i64> = eligible.iter().map(|s| s.remaining_units).collect();

        let index = strategy::select(strategy, &remaining, cursor)
            .ok_or(QuotaError::AllCredentialsExhausted)?;
        let chosen = &eligible[index];

        let left = self.consume_one_unit(&chosen.id)?;
        debug!(
            "Allocated credential {} ({}) under {}, {} units left",
            chosen.id, chosen.file_name, strategy, left
        );
        Ok(AllocatedCredential {
            credential_id: chosen.id.clone(),
            file_path: chosen.file_path.clone(),
        })
    }

    /// Unconditional +1 on the current period. Returns remaining units.
    pub fn consume_one_unit(&self, credential_id: &str) -> Result<i64, QuotaError> {
        let period = self.clock.current_period();
        let row = usage_repo::increment_used(&self.db, credential_id, &period, self.monthly_cap, 1)?;
        Ok(row.remaining())
    }

    /// Refunds one unit, floored at zero. Returns remaining units.
    pub fn release_one_unit(&self, credential_id: &str) -> Result<i64, QuotaError> {
        let period = self.clock.current_period();
        let row = usage_repo::decrement_used(&self.db, credential_id, &period, self.monthly_cap)?;
        Ok(row.remaining())
    }

    /// Forces usage up to the cap for the current period and audits it.
    /// No-op when the credential is already at or above its cap.
    pub fn mark_exhausted(&self, credential_id: &str, reason: &str) -> Result<(), QuotaError> {
        let period = self.clock.current_period();
        match usage_repo::mark_exhausted(&self.db, credential_id, &period, self.monthly_cap, reason)? {
            Some(row) => warn!(
                "Credential {} exhausted for {} (used {}/{}): {}",
                credential_id, period, row.used_units, row.cap_units, reason
            ),
            None => debug!("Credential {} already exhausted for {}", credential_id, period),
        }
        Ok(())
    }

    /// Manually sets the used units of the current period.
    pub fn adjust_usage(
        &self,
        credential_id: &str,
        new_used: i64,
        reason: &str,
    ) -> Result<CredentialSummary, QuotaError> {
        if new_used < 0 {
            return Err(QuotaError::InvalidAdjustment(
                "usedUnits must be 0 or greater".to_string(),
            ));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(QuotaError::InvalidAdjustment(
                "reason must not be blank".to_string(),
            ));
        }
        if credential_repo::find_by_id(&self.db, credential_id)?.is_none() {
            return Err(QuotaError::NotFound(credential_id.to_string()));
        }

        let period = self.clock.current_period();
        let (old, new) = usage_repo::adjust_used(
            &self.db,
            credential_id,
            &period,
            self.monthly_cap,
            new_used,
            reason,
        )?;
        info!(
            "Usage of {} for {} adjusted {} -> {}: {}",
            credential_id, period, old.used_units, new.used_units, reason
        );
        self.find_summary(credential_id)
    }

    /// Audit trail of one credential, newest first.
    pub fn audit_log(&self, credential_id: &str) -> Result<Vec<AuditEntry>, QuotaError> {
        if credential_repo::find_by_id(&self.db, credential_id)?.is_none() {
            return Err(QuotaError::NotFound(credential_id.to_string()));
        }
        Ok(usage_repo::audit_for(&self.db, credential_id)?)
    }
}

fn summarize(
    credential: CredentialRecord,
    usage: &UsageRecord,
    period: &str,
    reset_at: DateTime<FixedOffset>,
) -> CredentialSummary {
    let status = if credential.active && credential.file_path.exists() {
        CredentialStatus::Active
    } else {
        CredentialStatus::Missing
    };
    CredentialSummary {
        id: credential.id,
        file_name: credential.file_name,
        file_path: credential.file_path,
        account_label: credential.account_label,
        project_id: credential.project_id,
        service_account_email: credential.service_account_email,
        cap_units: usage.cap_units,
        used_units: usage.used_units,
        remaining_units: usage.remaining(),
        period: period.to_string(),
        reset_at,
        status,
    }
}
