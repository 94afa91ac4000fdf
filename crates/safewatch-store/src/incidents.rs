// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Emergency alerts.
//
// The `incidents` table is keyed by identity, so each identity has at most
// one live alert and a resubmission replaces it. Resolving moves the row to
// `incident_history` in a single transaction.

use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use safewatch_core::error::{Result, SafewatchError};
use safewatch_core::types::{
    IdentityId, Incident, IncidentEntry, IncidentRecord, IncidentStats, IncidentStatus,
    IncidentSubmission, Location, Revealed,
};
use safewatch_security::{EnvelopeCrypto, KeyCustody, PublicKeyDirectory, reveal};
use tracing::{info, instrument, warn};

use crate::db::{Database, db_err, now, parse_enum, parse_timestamp, timestamp};
use crate::sealed;

const ACTIVE_COLUMNS: &str = "identity_id, latitude, longitude, accuracy, address, urgency, status,
                              message_plain, ciphertext, wrapped_key, iv, encryption_degraded,
                              created_at, updated_at";

const HISTORY_COLUMNS: &str = "id, identity_id, latitude, longitude, accuracy, address, urgency,
                               status, message_plain, ciphertext, wrapped_key, iv,
                               encryption_degraded, created_at, resolved_by, resolution_notes,
                               resolved_at";

/// Lifecycle manager for emergency alerts.
pub struct IncidentStore {
    db: Arc<Database>,
    directory: Arc<dyn PublicKeyDirectory>,
    crypto: EnvelopeCrypto,
}

impl IncidentStore {
    pub fn new(db: Arc<Database>, directory: Arc<dyn PublicKeyDirectory>) -> Self {
        Self {
            db,
            directory,
            crypto: EnvelopeCrypto::new(),
        }
    }

    /// Raise (or replace) the identity's active alert.
    ///
    /// The message is sealed to the identity's public key. If that is not
    /// possible the alert is still stored, in plaintext, with
    /// `encryption_degraded` set.
    #[instrument(skip(self, submission), fields(identity_id = %identity))]
    pub fn submit(&self, identity: &IdentityId, submission: &IncidentSubmission) -> Result<Incident> {
        submission.validate()?;

        // Sealing consults the key directory, which may share our database
        // lock. It must finish before the lock is taken below.
        let (message, encryption_degraded) =
            sealed::seal_or_degrade(&self.crypto, self.directory.as_ref(), identity, &submission.message);
        let (plain, ciphertext, wrapped_key, iv) = sealed::columns(&message);

        let submitted_at = now();
        let incident = Incident {
            identity_id: *identity,
            location: submission.location(),
            urgency: submission.urgency.unwrap_or(IncidentSubmission::DEFAULT_URGENCY),
            status: IncidentStatus::Active,
            message: message.clone(),
            encryption_degraded,
            created_at: submitted_at,
            updated_at: submitted_at,
        };
        let created_at = timestamp(&incident.created_at);

        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO incidents (identity_id, latitude, longitude, accuracy, address, urgency,
                                    status, message_plain, ciphertext, wrapped_key, iv,
                                    encryption_degraded, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT (identity_id) DO UPDATE SET
                 latitude = excluded.latitude,
                 longitude = excluded.longitude,
                 accuracy = excluded.accuracy,
                 address = excluded.address,
                 urgency = excluded.urgency,
                 status = 'active',
                 message_plain = excluded.message_plain,
                 ciphertext = excluded.ciphertext,
                 wrapped_key = excluded.wrapped_key,
                 iv = excluded.iv,
                 encryption_degraded = excluded.encryption_degraded,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at",
            params![
                identity.to_string(),
                incident.location.latitude,
                incident.location.longitude,
                incident.location.accuracy,
                incident.location.address,
                incident.urgency.as_str(),
                plain,
                ciphertext,
                wrapped_key,
                iv,
                encryption_degraded,
                created_at,
            ],
        )
        .map_err(db_err)?;

        info!(urgency = %incident.urgency, encryption_degraded, "incident submitted");
        Ok(incident)
    }

    /// Move an active alert between `active` and `responding`.
    ///
    /// Returns `false` if the identity has no active alert. `resolved` is
    /// refused; use [`IncidentStore::resolve`].
    #[instrument(skip(self), fields(identity_id = %identity, %status))]
    pub fn update_status(&self, identity: &IdentityId, status: IncidentStatus) -> Result<bool> {
        if status == IncidentStatus::Resolved {
            return Err(SafewatchError::Input(
                "incidents are resolved through resolve(), not a status update".into(),
            ));
        }

        let conn = self.db.lock()?;
        let rows = conn
            .execute(
                "UPDATE incidents SET status = ?2, updated_at = ?3 WHERE identity_id = ?1",
                params![identity.to_string(), status.as_str(), timestamp(&now())],
            )
            .map_err(db_err)?;

        if rows > 0 {
            info!("incident status updated");
        }
        Ok(rows > 0)
    }

    /// A responder has picked up the alert.
    pub fn mark_responding(&self, identity: &IdentityId) -> Result<bool> {
        self.update_status(identity, IncidentStatus::Responding)
    }

    /// Archive the identity's active alert as resolved.
    ///
    /// The copy into history and the removal of the active row commit
    /// together or not at all.
    #[instrument(skip(self, notes), fields(identity_id = %identity))]
    pub fn resolve(&self, identity: &IdentityId, resolver: &str, notes: Option<&str>) -> Result<bool> {
        let resolver = resolver.trim();
        if resolver.is_empty() {
            return Err(SafewatchError::Input("resolver is required".into()));
        }
        let notes = notes.map(str::trim).filter(|n| !n.is_empty());

        let mut conn = self.db.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let archived = tx
            .execute(
                "INSERT INTO incident_history (identity_id, latitude, longitude, accuracy, address,
                                               urgency, status, message_plain, ciphertext,
                                               wrapped_key, iv, encryption_degraded, created_at,
                                               resolved_by, resolution_notes, resolved_at)
                 SELECT identity_id, latitude, longitude, accuracy, address, urgency, 'resolved',
                        message_plain, ciphertext, wrapped_key, iv, encryption_degraded,
                        created_at, ?2, ?3, ?4
                 FROM incidents WHERE identity_id = ?1",
                params![identity.to_string(), resolver, notes, timestamp(&now())],
            )
            .map_err(db_err)?;
        if archived == 0 {
            return Err(SafewatchError::NotFound(format!("no active incident for identity {identity}")));
        }

        tx.execute("DELETE FROM incidents WHERE identity_id = ?1", params![identity.to_string()])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        info!(resolver, "incident resolved");
        Ok(true)
    }

    pub fn get(&self, identity: &IdentityId) -> Result<Option<Incident>> {
        let conn = self.db.lock()?;
        conn.query_row(
            &format!("SELECT {ACTIVE_COLUMNS} FROM incidents WHERE identity_id = ?1"),
            params![identity.to_string()],
            row_to_incident,
        )
        .optional()
        .map_err(db_err)
    }

    /// Every live alert, newest first.
    pub fn list_active(&self) -> Result<Vec<Incident>> {
        let conn = self.db.lock()?;
        query_active(&conn)
    }

    /// Archived alerts, most recently resolved first.
    pub fn history(&self, limit: usize) -> Result<Vec<IncidentRecord>> {
        let conn = self.db.lock()?;
        query_history(&conn, limit)
    }

    /// Live and archived alerts together, newest first by creation time.
    ///
    /// Both tables are read under one lock, so an alert being resolved
    /// appears exactly once.
    pub fn list_all(&self) -> Result<Vec<IncidentEntry>> {
        let (active, archived) = {
            let conn = self.db.lock()?;
            (query_active(&conn)?, query_history(&conn, usize::MAX)?)
        };
        let mut entries: Vec<IncidentEntry> = active
            .into_iter()
            .map(IncidentEntry::Active)
            .chain(archived.into_iter().map(IncidentEntry::Archived))
            .collect();
        entries.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
        Ok(entries)
    }

    /// Live alerts with their messages opened for a responder.
    pub fn list_active_revealed(&self, keys: &dyn KeyCustody) -> Result<Vec<Revealed<Incident>>> {
        let incidents = self.list_active()?;
        Ok(incidents
            .into_iter()
            .map(|incident| {
                let (text, state) = reveal(&self.crypto, keys, &incident.identity_id, &incident.message);
                Revealed {
                    record: incident,
                    text,
                    state,
                }
            })
            .collect())
    }

    pub fn history_revealed(
        &self,
        limit: usize,
        keys: &dyn KeyCustody,
    ) -> Result<Vec<Revealed<IncidentRecord>>> {
        let records = self.history(limit)?;
        Ok(records
            .into_iter()
            .map(|record| {
                let (text, state) = reveal(&self.crypto, keys, &record.identity_id, &record.message);
                Revealed { record, text, state }
            })
            .collect())
    }

    pub fn stats(&self) -> Result<IncidentStats> {
        let conn = self.db.lock()?;
        let mut stats = IncidentStats::default();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM incidents GROUP BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?;
        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            match status.parse::<IncidentStatus>() {
                Ok(IncidentStatus::Active) => stats.active = count as u64,
                Ok(IncidentStatus::Responding) => stats.responding = count as u64,
                _ => warn!(%status, "unexpected status on active incident"),
            }
        }

        let resolved: i64 = conn
            .query_row("SELECT COUNT(*) FROM incident_history", [], |row| row.get(0))
            .map_err(db_err)?;
        stats.resolved = resolved as u64;

        Ok(stats)
    }
}

fn query_active(conn: &rusqlite::Connection) -> Result<Vec<Incident>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ACTIVE_COLUMNS} FROM incidents ORDER BY created_at DESC"
        ))
        .map_err(db_err)?;
    let rows = stmt.query_map([], row_to_incident).map_err(db_err)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
}

fn query_history(conn: &rusqlite::Connection, limit: usize) -> Result<Vec<IncidentRecord>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM incident_history
             ORDER BY resolved_at DESC, id DESC LIMIT ?1"
        ))
        .map_err(db_err)?;
    let rows = stmt.query_map(params![limit], row_to_record).map_err(db_err)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
}

fn created_at(entry: &IncidentEntry) -> chrono::DateTime<chrono::Utc> {
    match entry {
        IncidentEntry::Active(incident) => incident.created_at,
        IncidentEntry::Archived(record) => record.created_at,
    }
}

fn parse_identity(idx: usize, s: &str) -> rusqlite::Result<IdentityId> {
    IdentityId::parse(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_incident(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
    let identity_str: String = row.get(0)?;
    let urgency_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let created_at_str: String = row.get(12)?;
    let updated_at_str: String = row.get(13)?;

    Ok(Incident {
        identity_id: parse_identity(0, &identity_str)?,
        location: Location {
            latitude: row.get(1)?,
            longitude: row.get(2)?,
            accuracy: row.get(3)?,
            address: row.get(4)?,
        },
        urgency: parse_enum(5, &urgency_str)?,
        status: parse_enum(6, &status_str)?,
        message: sealed::from_row(row, 7)?,
        encryption_degraded: row.get(11)?,
        created_at: parse_timestamp(12, &created_at_str)?,
        updated_at: parse_timestamp(13, &updated_at_str)?,
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncidentRecord> {
    let identity_str: String = row.get(1)?;
    let urgency_str: String = row.get(6)?;
    let status_str: String = row.get(7)?;
    let created_at_str: String = row.get(13)?;
    let resolved_at_str: String = row.get(16)?;

    Ok(IncidentRecord {
        id: row.get(0)?,
        identity_id: parse_identity(1, &identity_str)?,
        location: Location {
            latitude: row.get(2)?,
            longitude: row.get(3)?,
            accuracy: row.get(4)?,
            address: row.get(5)?,
        },
        urgency: parse_enum(6, &urgency_str)?,
        status: parse_enum(7, &status_str)?,
        message: sealed::from_row(row, 8)?,
        encryption_degraded: row.get(12)?,
        created_at: parse_timestamp(13, &created_at_str)?,
        resolved_by: row.get(14)?,
        resolution_notes: row.get(15)?,
        resolved_at: parse_timestamp(16, &resolved_at_str)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use safewatch_core::types::{RegistrationRequest, RevealState, StoredText, Urgency};
    use safewatch_security::custody::UNREADABLE_MARKER;
    use safewatch_security::{KeyPairProvider, MemoryCustody};

    use super::*;
    use crate::identities::IdentityRegistry;

    fn submission(message: &str) -> IncidentSubmission {
        IncidentSubmission {
            message: message.into(),
            latitude: -1.2921,
            longitude: 36.8219,
            address: Some("Kenyatta Ave".into()),
            accuracy: Some(8.5),
            urgency: None,
        }
    }

    fn memory_store() -> (IncidentStore, Arc<MemoryCustody>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let custody = Arc::new(MemoryCustody::new());
        let store = IncidentStore::new(db, custody.clone());
        (store, custody)
    }

    fn provision(custody: &MemoryCustody) -> IdentityId {
        let id = IdentityId::new();
        let pair = KeyPairProvider::with_bits(1024).unwrap().generate().unwrap();
        custody.insert(id, pair.public_key_pem, pair.private_key_pem).unwrap();
        id
    }

    #[test]
    fn resubmission_keeps_a_single_active_alert() {
        let (store, custody) = memory_store();
        let id = provision(&custody);

        store.submit(&id, &submission("first")).unwrap();
        store.mark_responding(&id).unwrap();
        let second = store.submit(&id, &submission("second")).unwrap();

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, IncidentStatus::Active);
        assert_eq!(active[0].created_at, second.created_at);
        assert_eq!(active[0].urgency, Urgency::High);

        let revealed = store.list_active_revealed(custody.as_ref()).unwrap();
        assert_eq!(revealed[0].text, "second");
        assert_eq!(revealed[0].state, RevealState::Decrypted);
    }

    #[test]
    fn invalid_submissions_are_refused() {
        let (store, custody) = memory_store();
        let id = provision(&custody);

        assert!(matches!(store.submit(&id, &submission("   ")), Err(SafewatchError::Input(_))));
        let mut far = submission("help");
        far.latitude = 91.0;
        assert!(matches!(store.submit(&id, &far), Err(SafewatchError::Input(_))));
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn status_updates() {
        let (store, custody) = memory_store();
        let id = provision(&custody);

        assert!(!store.update_status(&id, IncidentStatus::Responding).unwrap());
        store.submit(&id, &submission("help")).unwrap();
        assert!(store.update_status(&id, IncidentStatus::Responding).unwrap());
        assert_eq!(store.get(&id).unwrap().unwrap().status, IncidentStatus::Responding);
        assert!(matches!(
            store.update_status(&id, IncidentStatus::Resolved),
            Err(SafewatchError::Input(_))
        ));
    }

    #[test]
    fn resolve_archives_atomically() {
        let (store, custody) = memory_store();
        let id = provision(&custody);

        let incident = store.submit(&id, &submission("help")).unwrap();
        assert!(store.resolve(&id, "unit-7", Some("all clear")).unwrap());

        assert!(store.get(&id).unwrap().is_none());
        let history = store.history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].created_at, incident.created_at);
        assert_eq!(history[0].status, IncidentStatus::Resolved);
        assert_eq!(history[0].resolved_by, "unit-7");
        assert_eq!(history[0].resolution_notes.as_deref(), Some("all clear"));
        assert_eq!(history[0].message, incident.message);

        // A second resolve finds nothing and leaves history alone.
        assert!(matches!(store.resolve(&id, "unit-7", None), Err(SafewatchError::NotFound(_))));
        assert_eq!(store.history(10).unwrap().len(), 1);
    }

    #[test]
    fn missing_key_stores_plaintext_with_flag() {
        let (store, custody) = memory_store();
        let stranger = IdentityId::new();

        let incident = store.submit(&stranger, &submission("no key on file")).unwrap();
        assert!(incident.encryption_degraded);
        assert_eq!(incident.message, StoredText::Plain { text: "no key on file".into() });

        let revealed = store.list_active_revealed(custody.as_ref()).unwrap();
        assert_eq!(revealed[0].state, RevealState::Plaintext);
        assert_eq!(revealed[0].text, "no key on file");
    }

    #[test]
    fn one_bad_record_does_not_sink_the_listing() {
        let (store, custody) = memory_store();
        let good = provision(&custody);
        let broken = provision(&custody);

        store.submit(&good, &submission("readable")).unwrap();
        store.submit(&broken, &submission("lost")).unwrap();

        // Swap the broken identity's private key for an unrelated one.
        let public = custody.public_key(&broken).unwrap().unwrap();
        let other = KeyPairProvider::with_bits(1024).unwrap().generate().unwrap();
        custody.insert(broken, public, other.private_key_pem).unwrap();

        let revealed = store.list_active_revealed(custody.as_ref()).unwrap();
        assert_eq!(revealed.len(), 2);
        for entry in revealed {
            if entry.record.identity_id == good {
                assert_eq!(entry.text, "readable");
                assert_eq!(entry.state, RevealState::Decrypted);
            } else {
                assert_eq!(entry.text, UNREADABLE_MARKER);
                assert_eq!(entry.state, RevealState::Unreadable);
            }
        }
    }

    #[test]
    fn stats_and_list_all() {
        let (store, custody) = memory_store();
        let a = provision(&custody);
        let b = provision(&custody);
        let c = provision(&custody);

        store.submit(&a, &submission("a")).unwrap();
        store.submit(&b, &submission("b")).unwrap();
        store.submit(&c, &submission("c")).unwrap();
        store.mark_responding(&b).unwrap();
        store.resolve(&c, "unit-1", None).unwrap();

        assert_eq!(
            store.stats().unwrap(),
            IncidentStats {
                active: 1,
                responding: 1,
                resolved: 1,
            }
        );

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 3);
        let archived = all
            .iter()
            .filter(|e| matches!(e, IncidentEntry::Archived(_)))
            .count();
        assert_eq!(archived, 1);
    }

    #[test]
    fn registered_citizen_end_to_end() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = IdentityRegistry::new(Arc::clone(&db), KeyPairProvider::with_bits(1024).unwrap());
        let vault = Arc::new(registry.vault());
        let store = IncidentStore::new(Arc::clone(&db), vault.clone());

        let citizen = registry
            .register(&RegistrationRequest {
                name: "Wanjiru".into(),
                dob: "1985-06-15".into(),
                phone_number: "+254 700 000 001".into(),
            })
            .unwrap();

        let alert = IncidentSubmission {
            message: "help".into(),
            latitude: 1.0,
            longitude: 2.0,
            address: None,
            accuracy: None,
            urgency: None,
        };
        let incident = store.submit(&citizen.id, &alert).unwrap();
        assert!(incident.message.is_sealed());
        assert!(!incident.encryption_degraded);
        assert_eq!(incident.status, IncidentStatus::Active);

        let live = store.list_active_revealed(vault.as_ref()).unwrap();
        assert_eq!(live[0].text, "help");

        assert!(store.update_status(&citizen.id, IncidentStatus::Responding).unwrap());
        assert_eq!(store.get(&citizen.id).unwrap().unwrap().status, IncidentStatus::Responding);

        assert!(store.resolve(&citizen.id, "officer42", Some("dispatched unit")).unwrap());
        assert!(store.get(&citizen.id).unwrap().is_none());
        assert!(store.list_active().unwrap().is_empty());

        let history = store.history_revealed(5, vault.as_ref()).unwrap();
        assert_eq!(history.len(), 1);
        let record = &history[0].record;
        assert_eq!(record.identity_id, citizen.id);
        assert_eq!(record.status, IncidentStatus::Resolved);
        assert_eq!(record.resolved_by, "officer42");
        assert_eq!(record.resolution_notes.as_deref(), Some("dispatched unit"));
        assert_eq!((record.location.latitude, record.location.longitude), (1.0, 2.0));
        assert_eq!(history[0].text, "help");
        assert_eq!(history[0].state, RevealState::Decrypted);
    }

    #[test]
    fn readers_never_see_a_resolving_alert_twice_or_not_at_all() {
        let (store, custody) = memory_store();
        let store = Arc::new(store);
        let ids: Vec<IdentityId> = (0..4).map(|_| provision(&custody)).collect();
        for id in &ids {
            store.submit(id, &submission("trapped in lift")).unwrap();
        }

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = Arc::clone(&store);
                let done = Arc::clone(&done);
                let ids = ids.clone();
                thread::spawn(move || {
                    let mut snapshots = 0usize;
                    while !done.load(Ordering::Acquire) || snapshots == 0 {
                        let entries = store.list_all().unwrap();
                        for id in &ids {
                            let seen = entries
                                .iter()
                                .filter(|entry| match entry {
                                    IncidentEntry::Active(incident) => incident.identity_id == *id,
                                    IncidentEntry::Archived(record) => record.identity_id == *id,
                                })
                                .count();
                            assert_eq!(seen, 1, "alert {id} seen {seen} times");
                        }
                        // Once the live row is gone the archived copy is already there.
                        for id in &ids {
                            if store.get(id).unwrap().is_none() {
                                assert!(store
                                    .history(usize::MAX)
                                    .unwrap()
                                    .iter()
                                    .any(|record| record.identity_id == *id));
                            }
                        }
                        snapshots += 1;
                    }
                    snapshots
                })
            })
            .collect();

        for (n, id) in ids.iter().enumerate() {
            store.resolve(id, &format!("unit-{n}"), None).unwrap();
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert!(store.list_active().unwrap().is_empty());
        assert_eq!(store.history(10).unwrap().len(), ids.len());
    }
}
