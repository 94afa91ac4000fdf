// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared SQLite handle.
//
// One connection, guarded by a mutex, shared as `Arc<Database>` by every
// store. Multi-statement operations take the lock once and run inside a
// transaction, so readers never see half of a resolve.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use rusqlite::types::Type;
use safewatch_core::error::{Result, SafewatchError};
use tracing::{debug, info, instrument};

/// Schema for every table the stores use.
///
/// Envelope columns carry a CHECK so that a row holds either all three
/// artifacts or none, and exactly one of plaintext / envelope.
const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS identities (
        id TEXT PRIMARY KEY,
        phone_number TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        date_of_birth TEXT NOT NULL,
        public_key TEXT NOT NULL,
        verified INTEGER NOT NULL DEFAULT 0,
        role TEXT NOT NULL DEFAULT 'citizen'
            CHECK (role IN ('citizen', 'responder', 'admin')),
        last_location TEXT,
        created_at TEXT NOT NULL,
        last_login_at TEXT
    );

    CREATE TABLE IF NOT EXISTS identity_keys (
        identity_id TEXT PRIMARY KEY REFERENCES identities (id),
        private_key TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS otp_codes (
        phone_number TEXT PRIMARY KEY,
        code TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        created_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS incidents (
        identity_id TEXT PRIMARY KEY,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        accuracy REAL,
        address TEXT,
        urgency TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('active', 'responding')),
        message_plain TEXT,
        ciphertext TEXT,
        wrapped_key TEXT,
        iv TEXT,
        encryption_degraded INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK ((ciphertext IS NULL) = (wrapped_key IS NULL)
           AND (wrapped_key IS NULL) = (iv IS NULL)),
        CHECK ((message_plain IS NULL) <> (ciphertext IS NULL))
    );

    CREATE TABLE IF NOT EXISTS incident_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id TEXT NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        accuracy REAL,
        address TEXT,
        urgency TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'resolved' CHECK (status = 'resolved'),
        message_plain TEXT,
        ciphertext TEXT,
        wrapped_key TEXT,
        iv TEXT,
        encryption_degraded INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        resolved_by TEXT NOT NULL,
        resolution_notes TEXT,
        resolved_at TEXT NOT NULL,
        CHECK ((ciphertext IS NULL) = (wrapped_key IS NULL)
           AND (wrapped_key IS NULL) = (iv IS NULL)),
        CHECK ((message_plain IS NULL) <> (ciphertext IS NULL))
    );
    CREATE INDEX IF NOT EXISTS incident_history_identity ON incident_history (identity_id);

    CREATE TABLE IF NOT EXISTS complaints (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        category TEXT NOT NULL,
        subject TEXT NOT NULL,
        description_plain TEXT,
        ciphertext TEXT,
        wrapped_key TEXT,
        iv TEXT,
        encryption_degraded INTEGER NOT NULL DEFAULT 0,
        location TEXT,
        urgency TEXT NOT NULL,
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'assigned', 'in_progress', 'resolved', 'rejected')),
        assigned_to TEXT,
        response_notes TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        resolved_at TEXT,
        CHECK ((ciphertext IS NULL) = (wrapped_key IS NULL)
           AND (wrapped_key IS NULL) = (iv IS NULL)),
        CHECK ((description_plain IS NULL) <> (ciphertext IS NULL))
    );
    CREATE INDEX IF NOT EXISTS complaints_owner ON complaints (owner_id);
    CREATE INDEX IF NOT EXISTS complaints_status ON complaints (status);
"#;

/// Convert a `rusqlite::Error` into a `SafewatchError::Database`.
pub(crate) fn db_err(e: rusqlite::Error) -> SafewatchError {
    SafewatchError::Database(e.to_string())
}

/// Whether `e` is a UNIQUE / PRIMARY KEY / CHECK violation.
pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Shared database handle injected into every store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// WAL mode lets readers proceed while a writer holds the file.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| SafewatchError::Database(format!("open: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SafewatchError::Database(format!("WAL pragma: {e}")))?;

        Self::prepare(conn, "database opened")
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SafewatchError::Database(format!("open in-memory: {e}")))?;

        Self::prepare(conn, "in-memory database opened")
    }

    fn prepare(conn: Connection, message: &'static str) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| SafewatchError::Database(format!("foreign_keys pragma: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| SafewatchError::Database(format!("create schema: {e}")))?;

        debug!("{message}");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Take the connection for the duration of one operation.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SafewatchError::Internal("database lock poisoned".into()))
    }

    /// Flush and close the connection.
    pub fn close(self) -> Result<()> {
        let conn = self
            .conn
            .into_inner()
            .map_err(|_| SafewatchError::Internal("database lock poisoned".into()))?;
        conn.close()
            .map_err(|(_, e)| SafewatchError::Database(format!("close: {e}")))?;

        info!("database closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Column helpers shared by the stores
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time, truncated to what `timestamp` stores.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::parse_from_rfc3339(&timestamp(&now))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

pub(crate) fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_timestamp(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_timestamp(idx, &s)).transpose()
}

/// Parse one of the closed string enums from core.
pub(crate) fn parse_enum<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = SafewatchError>,
{
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_twice() {
        let db = Database::open_in_memory().expect("open");
        let conn = db.lock().expect("lock");
        conn.execute_batch(SCHEMA_SQL).expect("schema is idempotent");
    }

    #[test]
    fn partial_envelope_is_rejected_by_schema() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO incidents (identity_id, latitude, longitude, urgency, status,
                                    ciphertext, wrapped_key, created_at, updated_at)
             VALUES ('x', 0, 0, 'high', 'active', 'c', 'w', 't', 't')",
            [],
        );
        let err = result.expect_err("envelope without IV must be refused");
        assert!(is_constraint_violation(&err));
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = timestamp(&DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc));
        let b = timestamp(&DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z").unwrap().with_timezone(&Utc));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_timestamp(0, &b).unwrap().timestamp_subsec_micros(), 500_000);
    }

    #[test]
    fn on_disk_open_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("safewatch.db")).expect("open");
        db.close().expect("close");
        let reopened = Database::open(dir.path().join("safewatch.db")).expect("reopen");
        reopened.close().expect("close again");
    }
}
