// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// One-time codes for phone verification.
//
// At most one code exists per phone number. A code is single-use, expires
// after the policy TTL, and is burned after `max_attempts` wrong guesses.
// Every check-and-mutate runs inside one transaction under the database
// lock, so two concurrent validations of the same code cannot both succeed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::OsRng;
use rusqlite::{OptionalExtension, params};
use safewatch_core::config::SafewatchConfig;
use safewatch_core::error::{Result, SafewatchError};
use safewatch_core::types::normalize_phone;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};

use crate::db::{Database, db_err};

/// Code lifetime and guess budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpPolicy {
    pub ttl: Duration,
    pub max_attempts: u32,
    pub digits: u32,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_attempts: 3,
            digits: 6,
        }
    }
}

impl OtpPolicy {
    pub fn from_config(config: &SafewatchConfig) -> Result<Self> {
        let policy = Self {
            ttl: config.otp_ttl(),
            max_attempts: config.otp_max_attempts,
            digits: config.otp_digits,
        };
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<()> {
        if !(4..=9).contains(&self.digits) {
            return Err(SafewatchError::Input(format!(
                "OTP length must be 4-9 digits, got {}",
                self.digits
            )));
        }
        if self.max_attempts == 0 {
            return Err(SafewatchError::Input("OTP attempt budget must be at least 1".into()));
        }
        Ok(())
    }
}

/// A freshly generated code, to be delivered out of band.
#[derive(Debug, Clone)]
pub struct OtpIssued {
    pub phone_number: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

pub struct OtpAuthenticator {
    db: Arc<Database>,
    policy: OtpPolicy,
}

impl OtpAuthenticator {
    pub fn new(db: Arc<Database>, policy: OtpPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { db, policy })
    }

    pub fn policy(&self) -> &OtpPolicy {
        &self.policy
    }

    /// Issue a code for `phone`.
    ///
    /// While an unexpired code exists the request is refused with
    /// `RateLimited`; an expired one is silently replaced.
    #[instrument(skip(self))]
    pub fn generate(&self, phone: &str) -> Result<OtpIssued> {
        let phone_number = normalize_phone(phone)?;
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(self.policy.ttl.as_millis())
            .map_err(|_| SafewatchError::Input("OTP lifetime too large".into()))?;
        let expires_at_ms = now_ms.saturating_add(ttl_ms);

        let mut conn = self.db.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let live: Option<i64> = tx
            .query_row(
                "SELECT expires_at_ms FROM otp_codes WHERE phone_number = ?1",
                params![phone_number],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(existing_expiry) = live
            && existing_expiry > now_ms
        {
            let retry_after_secs = ((existing_expiry - now_ms) as u64).div_ceil(1000).max(1);
            debug!(retry_after_secs, "live code already outstanding");
            return Err(SafewatchError::RateLimited { retry_after_secs });
        }

        let code = self.random_code();
        tx.execute(
            "INSERT OR REPLACE INTO otp_codes (phone_number, code, expires_at_ms, attempts, created_at_ms)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![phone_number, code, expires_at_ms, now_ms],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        info!("one-time code issued");
        Ok(OtpIssued {
            phone_number,
            code,
            expires_at: DateTime::from_timestamp_millis(expires_at_ms).unwrap_or_else(Utc::now),
        })
    }

    /// Check `candidate` against the outstanding code for `phone`.
    ///
    /// A match consumes the code. Expired and exhausted codes are deleted
    /// as they are discovered.
    #[instrument(skip(self, candidate))]
    pub fn validate(&self, phone: &str, candidate: &str) -> Result<()> {
        let phone_number = normalize_phone(phone)?;
        let now_ms = Utc::now().timestamp_millis();

        let mut conn = self.db.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let record: Option<(String, i64, u32)> = tx
            .query_row(
                "SELECT code, expires_at_ms, attempts FROM otp_codes WHERE phone_number = ?1",
                params![phone_number],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err)?;
        let Some((code, expires_at_ms, attempts)) = record else {
            return Err(SafewatchError::NotFound("no code requested for this number".into()));
        };

        let delete = |tx: &rusqlite::Transaction<'_>| {
            tx.execute("DELETE FROM otp_codes WHERE phone_number = ?1", params![phone_number])
                .map_err(db_err)
        };

        if now_ms >= expires_at_ms {
            delete(&tx)?;
            tx.commit().map_err(db_err)?;
            debug!("expired code purged");
            return Err(SafewatchError::OtpExpired);
        }
        if attempts >= self.policy.max_attempts {
            delete(&tx)?;
            tx.commit().map_err(db_err)?;
            warn!("code burned after too many attempts");
            return Err(SafewatchError::AttemptsExceeded);
        }

        let matches: bool = code.as_bytes().ct_eq(candidate.trim().as_bytes()).into();
        if matches {
            delete(&tx)?;
            tx.commit().map_err(db_err)?;
            info!("one-time code accepted");
            return Ok(());
        }

        let attempts: u32 = tx
            .query_row(
                "UPDATE otp_codes SET attempts = attempts + 1 WHERE phone_number = ?1
                 RETURNING attempts",
                params![phone_number],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        let remaining_attempts = self.policy.max_attempts.saturating_sub(attempts);
        debug!(remaining_attempts, "code mismatch");
        Err(SafewatchError::OtpMismatch { remaining_attempts })
    }

    /// Purge every expired code. Returns how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let conn = self.db.lock()?;
        let removed = conn
            .execute("DELETE FROM otp_codes WHERE expires_at_ms <= ?1", params![now_ms])
            .map_err(db_err)?;
        if removed > 0 {
            debug!(removed, "expired codes purged");
        }
        Ok(removed)
    }

    fn random_code(&self) -> String {
        let bound = 10u64.pow(self.policy.digits);
        let n = OsRng.gen_range(0..bound);
        format!("{n:0width$}", width = self.policy.digits as usize)
    }
}
