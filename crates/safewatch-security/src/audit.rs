// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Audit trail: append-only SQLite log of security-relevant events.
//
// Schema:
//   audit_log(
//     id         INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp  TEXT    NOT NULL,   -- RFC 3339
//     action     TEXT    NOT NULL,   -- e.g. "otp_issued", "login", "plaintext_fallback"
//     subject    TEXT    NOT NULL,   -- fingerprint from integrity::subject_fingerprint
//     success    INTEGER NOT NULL,   -- 0 = failure, 1 = success
//     details    TEXT                -- optional free-form context, never secrets
//   )

use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, params};
use safewatch_core::error::SafewatchError;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const CREATE_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS audit_log (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp  TEXT    NOT NULL,
        action     TEXT    NOT NULL,
        subject    TEXT    NOT NULL,
        success    INTEGER NOT NULL,
        details    TEXT
    );
    CREATE INDEX IF NOT EXISTS audit_log_subject ON audit_log (subject);
";

/// Convert a `rusqlite::Error` into a `SafewatchError::Database`.
fn db_err(e: rusqlite::Error) -> SafewatchError {
    SafewatchError::Database(e.to_string())
}

/// A single entry in the audit log, used for queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub action: String,
    pub subject: String,
    pub success: bool,
    pub details: Option<String>,
}

/// Append-only audit log backed by its own SQLite database.
///
/// Subjects are pseudonymous fingerprints; phone numbers and identity ids
/// are never written in the clear.
pub struct AuditLog {
    conn: Connection,
}

impl AuditLog {
    /// Open (or create) the audit database at `path`, in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SafewatchError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("audit log opened");
        Ok(Self { conn })
    }

    /// Open an in-memory audit database (useful for tests).
    pub fn open_in_memory() -> Result<Self, SafewatchError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("in-memory audit log opened");
        Ok(Self { conn })
    }

    /// Record a new audit entry.
    #[instrument(skip(self, details), fields(%action, success))]
    pub fn record(
        &self,
        action: &str,
        subject: &str,
        success: bool,
        details: Option<&str>,
    ) -> Result<(), SafewatchError> {
        self.conn
            .execute(
                "INSERT INTO audit_log (timestamp, action, subject, success, details)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![Utc::now().to_rfc3339(), action, subject, success, details],
            )
            .map_err(db_err)?;

        debug!("audit entry recorded");
        Ok(())
    }

    /// All entries for one subject, oldest first.
    pub fn entries_for_subject(&self, subject: &str) -> Result<Vec<AuditEntry>, SafewatchError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, timestamp, action, subject, success, details
                 FROM audit_log
                 WHERE subject = ?1
                 ORDER BY id ASC",
            )
            .map_err(db_err)?;

        stmt.query_map(params![subject], row_to_entry)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent_entries(&self, limit: u32) -> Result<Vec<AuditEntry>, SafewatchError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, timestamp, action, subject, success, details
                 FROM audit_log
                 ORDER BY id DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;

        stmt.query_map(params![limit], row_to_entry)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    /// Total number of entries in the audit log.
    pub fn count(&self) -> Result<u64, SafewatchError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .map_err(db_err)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        action: row.get(2)?,
        subject: row.get(3)?,
        success: row.get(4)?,
        details: row.get(5)?,
    })
}
