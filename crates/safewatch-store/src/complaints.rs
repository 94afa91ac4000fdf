// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Non-emergency complaints.
//
// Unlike incidents, an identity may have any number of complaints open.
// Descriptions get the same seal-or-degrade treatment as alert messages.

use std::sync::Arc;

use rusqlite::{OptionalExtension, Transaction, params};
use safewatch_core::error::{Result, SafewatchError};
use safewatch_core::types::{
    Complaint, ComplaintId, ComplaintStats, ComplaintStatus, ComplaintSubmission, IdentityId,
    Revealed,
};
use safewatch_security::{EnvelopeCrypto, KeyCustody, PublicKeyDirectory, reveal};
use tracing::{info, instrument};

use crate::db::{
    Database, db_err, now, parse_enum, parse_opt_timestamp, parse_timestamp, timestamp,
};
use crate::sealed;

const COMPLAINT_COLUMNS: &str = "id, owner_id, category, subject, description_plain, ciphertext,
                                 wrapped_key, iv, encryption_degraded, location, urgency, status,
                                 assigned_to, response_notes, created_at, updated_at, resolved_at";

pub struct ComplaintStore {
    db: Arc<Database>,
    directory: Arc<dyn PublicKeyDirectory>,
    crypto: EnvelopeCrypto,
}

impl ComplaintStore {
    pub fn new(db: Arc<Database>, directory: Arc<dyn PublicKeyDirectory>) -> Self {
        Self {
            db,
            directory,
            crypto: EnvelopeCrypto::new(),
        }
    }

    /// File a new complaint in `pending`.
    #[instrument(skip(self, submission), fields(owner = %owner))]
    pub fn file(&self, owner: &IdentityId, submission: &ComplaintSubmission) -> Result<Complaint> {
        submission.validate()?;

        let (description, encryption_degraded) = sealed::seal_or_degrade(
            &self.crypto,
            self.directory.as_ref(),
            owner,
            &submission.description,
        );
        let (plain, ciphertext, wrapped_key, iv) = sealed::columns(&description);

        let filed_at = now();
        let complaint = Complaint {
            id: ComplaintId::new(),
            owner: *owner,
            category: submission.category.trim().to_owned(),
            subject: submission.subject.trim().to_owned(),
            description: description.clone(),
            encryption_degraded,
            location: submission
                .location
                .as_ref()
                .map(|l| l.trim().to_owned())
                .filter(|l| !l.is_empty()),
            urgency: submission.urgency.unwrap_or(ComplaintSubmission::DEFAULT_URGENCY),
            status: ComplaintStatus::Pending,
            assigned_to: None,
            response_notes: None,
            created_at: filed_at,
            updated_at: filed_at,
            resolved_at: None,
        };

        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO complaints (id, owner_id, category, subject, description_plain, ciphertext,
                                     wrapped_key, iv, encryption_degraded, location, urgency,
                                     status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                complaint.id.to_string(),
                owner.to_string(),
                complaint.category,
                complaint.subject,
                plain,
                ciphertext,
                wrapped_key,
                iv,
                encryption_degraded,
                complaint.location,
                complaint.urgency.as_str(),
                complaint.status.as_str(),
                timestamp(&filed_at),
            ],
        )
        .map_err(db_err)?;

        info!(complaint_id = %complaint.id, category = %complaint.category, encryption_degraded, "complaint filed");
        Ok(complaint)
    }

    /// pending -> assigned.
    pub fn assign(&self, id: &ComplaintId, assignee: &str) -> Result<Complaint> {
        let assignee = assignee.trim();
        if assignee.is_empty() {
            return Err(SafewatchError::Input("assignee is required".into()));
        }
        self.transition(id, ComplaintStatus::Assigned, Some(assignee), None)
    }

    /// assigned -> in_progress.
    pub fn start_progress(&self, id: &ComplaintId) -> Result<Complaint> {
        self.transition(id, ComplaintStatus::InProgress, None, None)
    }

    /// assigned | in_progress -> resolved.
    pub fn resolve(&self, id: &ComplaintId, notes: Option<&str>) -> Result<Complaint> {
        self.transition(id, ComplaintStatus::Resolved, None, notes)
    }

    /// pending | assigned | in_progress -> rejected.
    pub fn reject(&self, id: &ComplaintId, notes: Option<&str>) -> Result<Complaint> {
        self.transition(id, ComplaintStatus::Rejected, None, notes)
    }

    #[instrument(skip(self, assignee, notes), fields(complaint_id = %id, to = %next))]
    fn transition(
        &self,
        id: &ComplaintId,
        next: ComplaintStatus,
        assignee: Option<&str>,
        notes: Option<&str>,
    ) -> Result<Complaint> {
        let notes = notes.map(str::trim).filter(|n| !n.is_empty());
        let stamp = timestamp(&now());

        let mut conn = self.db.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM complaints WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(current) = current else {
            return Err(SafewatchError::NotFound(format!("complaint {id}")));
        };
        let current: ComplaintStatus = current.parse()?;
        if !current.can_transition_to(next) {
            return Err(SafewatchError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        let resolved_at = (next == ComplaintStatus::Resolved).then_some(stamp.as_str());
        tx.execute(
            "UPDATE complaints SET
                 status = ?2,
                 updated_at = ?3,
                 assigned_to = COALESCE(?4, assigned_to),
                 response_notes = COALESCE(?5, response_notes),
                 resolved_at = COALESCE(?6, resolved_at)
             WHERE id = ?1",
            params![id.to_string(), next.as_str(), stamp, assignee, notes, resolved_at],
        )
        .map_err(db_err)?;

        let complaint = fetch(&tx, id)?
            .ok_or_else(|| SafewatchError::Internal(format!("complaint {id} vanished mid-update")))?;
        tx.commit().map_err(db_err)?;

        info!(from = %current, "complaint status changed");
        Ok(complaint)
    }

    pub fn get(&self, id: &ComplaintId) -> Result<Option<Complaint>> {
        let conn = self.db.lock()?;
        conn.query_row(
            &format!("SELECT {COMPLAINT_COLUMNS} FROM complaints WHERE id = ?1"),
            params![id.to_string()],
            row_to_complaint,
        )
        .optional()
        .map_err(db_err)
    }

    /// All complaints, optionally filtered by status, newest first.
    pub fn list(&self, status: Option<ComplaintStatus>) -> Result<Vec<Complaint>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COMPLAINT_COLUMNS} FROM complaints
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], row_to_complaint)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn list_for_owner(&self, owner: &IdentityId) -> Result<Vec<Complaint>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COMPLAINT_COLUMNS} FROM complaints WHERE owner_id = ?1
                 ORDER BY created_at DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![owner.to_string()], row_to_complaint)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    /// Complaints with their descriptions opened for a responder.
    pub fn list_revealed(
        &self,
        status: Option<ComplaintStatus>,
        keys: &dyn KeyCustody,
    ) -> Result<Vec<Revealed<Complaint>>> {
        let complaints = self.list(status)?;
        Ok(complaints
            .into_iter()
            .map(|complaint| {
                let (text, state) = reveal(&self.crypto, keys, &complaint.owner, &complaint.description);
                Revealed {
                    record: complaint,
                    text,
                    state,
                }
            })
            .collect())
    }

    pub fn stats(&self) -> Result<ComplaintStats> {
        let conn = self.db.lock()?;
        let mut stats = ComplaintStats::default();

        for (column, target) in [
            ("status", &mut stats.by_status),
            ("category", &mut stats.by_category),
        ] {
            let mut stmt = conn
                .prepare(&format!("SELECT {column}, COUNT(*) FROM complaints GROUP BY {column}"))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(db_err)?;
            for row in rows {
                let (key, count) = row.map_err(db_err)?;
                target.insert(key, count as u64);
            }
        }
        stats.total = stats.by_status.values().sum();

        Ok(stats)
    }
}

fn fetch(tx: &Transaction<'_>, id: &ComplaintId) -> Result<Option<Complaint>> {
    tx.query_row(
        &format!("SELECT {COMPLAINT_COLUMNS} FROM complaints WHERE id = ?1"),
        params![id.to_string()],
        row_to_complaint,
    )
    .optional()
    .map_err(db_err)
}

fn row_to_complaint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Complaint> {
    let id_str: String = row.get(0)?;
    let owner_str: String = row.get(1)?;
    let urgency_str: String = row.get(10)?;
    let status_str: String = row.get(11)?;
    let created_at_str: String = row.get(14)?;
    let updated_at_str: String = row.get(15)?;

    let id = ComplaintId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let owner = IdentityId::parse(&owner_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Complaint {
        id,
        owner,
        category: row.get(2)?,
        subject: row.get(3)?,
        description: sealed::from_row(row, 4)?,
        encryption_degraded: row.get(8)?,
        location: row.get(9)?,
        urgency: parse_enum(10, &urgency_str)?,
        status: parse_enum(11, &status_str)?,
        assigned_to: row.get(12)?,
        response_notes: row.get(13)?,
        created_at: parse_timestamp(14, &created_at_str)?,
        updated_at: parse_timestamp(15, &updated_at_str)?,
        resolved_at: parse_opt_timestamp(16, row.get(16)?)?,
    })
}

#[cfg(test)]
mod tests {
    use safewatch_core::types::{RevealState, Urgency};
    use safewatch_security::{KeyPairProvider, MemoryCustody};

    use super::*;

    fn submission(category: &str) -> ComplaintSubmission {
        ComplaintSubmission {
            category: category.into(),
            subject: "Street light out".into(),
            description: "The light on Moi Ave has been out for a week".into(),
            location: Some("Moi Ave".into()),
            urgency: None,
        }
    }

    fn store_with_owner() -> (ComplaintStore, Arc<MemoryCustody>, IdentityId) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let custody = Arc::new(MemoryCustody::new());
        let owner = IdentityId::new();
        let pair = KeyPairProvider::with_bits(1024).unwrap().generate().unwrap();
        custody.insert(owner, pair.public_key_pem, pair.private_key_pem).unwrap();
        (ComplaintStore::new(db, custody.clone()), custody, owner)
    }

    #[test]
    fn filing_seals_the_description() {
        let (store, custody, owner) = store_with_owner();
        let complaint = store.file(&owner, &submission("infrastructure")).unwrap();

        assert_eq!(complaint.status, ComplaintStatus::Pending);
        assert_eq!(complaint.urgency, Urgency::Medium);
        assert!(complaint.description.is_sealed());

        let fetched = store.get(&complaint.id).unwrap().expect("stored");
        assert_eq!(fetched.description, complaint.description);
        assert_eq!(fetched.created_at, complaint.created_at);

        let revealed = store.list_revealed(None, custody.as_ref()).unwrap();
        assert_eq!(revealed[0].text, "The light on Moi Ave has been out for a week");
        assert_eq!(revealed[0].state, RevealState::Decrypted);
    }

    #[test]
    fn lifecycle_follows_legal_edges() {
        let (store, _, owner) = store_with_owner();
        let id = store.file(&owner, &submission("noise")).unwrap().id;

        assert!(matches!(
            store.start_progress(&id),
            Err(SafewatchError::InvalidTransition { .. })
        ));
        assert!(matches!(store.resolve(&id, None), Err(SafewatchError::InvalidTransition { .. })));

        let assigned = store.assign(&id, "officer-12").unwrap();
        assert_eq!(assigned.status, ComplaintStatus::Assigned);
        assert_eq!(assigned.assigned_to.as_deref(), Some("officer-12"));

        let working = store.start_progress(&id).unwrap();
        assert_eq!(working.status, ComplaintStatus::InProgress);
        assert!(working.resolved_at.is_none());

        let resolved = store.resolve(&id, Some("bulb replaced")).unwrap();
        assert_eq!(resolved.status, ComplaintStatus::Resolved);
        assert_eq!(resolved.response_notes.as_deref(), Some("bulb replaced"));
        assert_eq!(resolved.assigned_to.as_deref(), Some("officer-12"));
        assert!(resolved.resolved_at.is_some());

        match store.reject(&id, Some("too late")) {
            Err(SafewatchError::InvalidTransition { from, to }) => {
                assert_eq!(from, "resolved");
                assert_eq!(to, "rejected");
            }
            other => panic!("expected invalid transition, got {other:?}"),
        }
    }

    #[test]
    fn rejection_from_pending() {
        let (store, _, owner) = store_with_owner();
        let id = store.file(&owner, &submission("noise")).unwrap().id;
        let rejected = store.reject(&id, Some("duplicate")).unwrap();
        assert_eq!(rejected.status, ComplaintStatus::Rejected);
        assert!(rejected.resolved_at.is_none());
    }

    #[test]
    fn unknown_complaint_is_not_found() {
        let (store, _, _) = store_with_owner();
        assert!(matches!(
            store.assign(&ComplaintId::new(), "officer-1"),
            Err(SafewatchError::NotFound(_))
        ));
    }

    #[test]
    fn filters_owner_listing_and_stats() {
        let (store, _, owner) = store_with_owner();
        let other = IdentityId::new();

        let a = store.file(&owner, &submission("noise")).unwrap();
        store.file(&owner, &submission("infrastructure")).unwrap();
        let c = store.file(&other, &submission("noise")).unwrap();
        assert!(c.encryption_degraded);

        store.assign(&a.id, "officer-2").unwrap();

        assert_eq!(store.list(None).unwrap().len(), 3);
        assert_eq!(store.list(Some(ComplaintStatus::Pending)).unwrap().len(), 2);
        assert_eq!(store.list(Some(ComplaintStatus::Assigned)).unwrap().len(), 1);
        assert_eq!(store.list_for_owner(&owner).unwrap().len(), 2);
        assert_eq!(store.list_for_owner(&other).unwrap().len(), 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.get("pending"), Some(&2));
        assert_eq!(stats.by_status.get("assigned"), Some(&1));
        assert_eq!(stats.by_category.get("noise"), Some(&2));
        assert_eq!(stats.by_category.get("infrastructure"), Some(&1));
    }

    #[test]
    fn empty_fields_are_refused() {
        let (store, _, owner) = store_with_owner();
        let mut bad = submission("noise");
        bad.subject = " ".into();
        assert!(matches!(store.file(&owner, &bad), Err(SafewatchError::Input(_))));
    }
}
