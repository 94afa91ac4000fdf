// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Identity registry and key vault.
//
// Registration mints the identity's key pair. The public half lives on the
// `identities` row; the private half goes to `identity_keys` and is only
// reachable through `KeyVault`'s `KeyCustody` implementation.

use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::{OptionalExtension, params};
use safewatch_core::error::{Result, SafewatchError};
use safewatch_core::types::{Identity, IdentityId, Location, RegistrationRequest, Role, normalize_phone};
use safewatch_security::{KeyCustody, KeyPairProvider, PublicKeyDirectory};
use tracing::{debug, info, instrument};

use crate::db::{
    Database, db_err, is_constraint_violation, now, parse_enum, parse_opt_timestamp,
    parse_timestamp, timestamp,
};

/// Longest display name we accept.
pub const MAX_NAME_LEN: usize = 100;

const IDENTITY_COLUMNS: &str = "id, phone_number, name, date_of_birth, public_key, verified,
                                role, last_location, created_at, last_login_at";

/// Registered identities.
pub struct IdentityRegistry {
    db: Arc<Database>,
    keygen: KeyPairProvider,
}

impl IdentityRegistry {
    pub fn new(db: Arc<Database>, keygen: KeyPairProvider) -> Self {
        Self { db, keygen }
    }

    /// Register a new citizen and generate their key pair.
    ///
    /// Fails with `Conflict` if the phone number is already registered.
    #[instrument(skip_all)]
    pub fn register(&self, request: &RegistrationRequest) -> Result<Identity> {
        let name = request.name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(SafewatchError::Input(format!(
                "name must be 1-{MAX_NAME_LEN} characters"
            )));
        }
        let date_of_birth = request.parsed_dob()?;
        let phone_number = normalize_phone(&request.phone_number)?;

        // Cheap duplicate check before the expensive key generation. The
        // UNIQUE constraint below still settles races.
        if self.find_by_phone(&phone_number)?.is_some() {
            return Err(SafewatchError::Conflict("phone number already registered".into()));
        }

        let pair = self.keygen.generate()?;
        let identity = Identity {
            id: IdentityId::new(),
            phone_number,
            name: name.to_owned(),
            date_of_birth,
            public_key_pem: pair.public_key_pem,
            verified: false,
            role: Role::Citizen,
            last_location: None,
            created_at: now(),
            last_login_at: None,
        };

        let mut conn = self.db.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO identities (id, phone_number, name, date_of_birth, public_key,
                                     verified, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
            params![
                identity.id.to_string(),
                identity.phone_number,
                identity.name,
                identity.date_of_birth.to_string(),
                identity.public_key_pem,
                identity.role.as_str(),
                timestamp(&identity.created_at),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                SafewatchError::Conflict("phone number already registered".into())
            } else {
                db_err(e)
            }
        })?;
        tx.execute(
            "INSERT INTO identity_keys (identity_id, private_key) VALUES (?1, ?2)",
            params![identity.id.to_string(), pair.private_key_pem],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        info!(identity_id = %identity.id, "identity registered");
        Ok(identity)
    }

    pub fn get(&self, id: &IdentityId) -> Result<Option<Identity>> {
        let conn = self.db.lock()?;
        conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
            params![id.to_string()],
            row_to_identity,
        )
        .optional()
        .map_err(db_err)
    }

    /// Look up by phone number (normalised first).
    pub fn find_by_phone(&self, phone: &str) -> Result<Option<Identity>> {
        let phone = normalize_phone(phone)?;
        let conn = self.db.lock()?;
        conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE phone_number = ?1"),
            params![phone],
            row_to_identity,
        )
        .optional()
        .map_err(db_err)
    }

    /// Flag the identity as having proven control of its phone number.
    pub fn mark_verified(&self, id: &IdentityId) -> Result<()> {
        self.update_one(id, "UPDATE identities SET verified = 1 WHERE id = ?1", params![id.to_string()])
    }

    /// Stamp a successful login, optionally with the device's location.
    ///
    /// A login proves control of the phone number, so the identity is
    /// marked verified in the same statement.
    #[instrument(skip(self, location), fields(identity_id = %id))]
    pub fn record_login(&self, id: &IdentityId, location: Option<&Location>) -> Result<Identity> {
        let login_at = timestamp(&now());
        match location {
            Some(location) => {
                location.validate()?;
                let json = serde_json::to_string(location)?;
                self.update_one(
                    id,
                    "UPDATE identities SET verified = 1, last_login_at = ?2, last_location = ?3
                     WHERE id = ?1",
                    params![id.to_string(), login_at, json],
                )?;
            }
            None => self.update_one(
                id,
                "UPDATE identities SET verified = 1, last_login_at = ?2 WHERE id = ?1",
                params![id.to_string(), login_at],
            )?,
        }

        debug!("login recorded");
        self.get(id)?
            .ok_or_else(|| SafewatchError::NotFound(format!("identity {id}")))
    }

    pub fn update_location(&self, id: &IdentityId, location: &Location) -> Result<()> {
        location.validate()?;
        let json = serde_json::to_string(location)?;
        self.update_one(
            id,
            "UPDATE identities SET last_location = ?2 WHERE id = ?1",
            params![id.to_string(), json],
        )
    }

    /// Grant a role. Used when provisioning responders.
    #[instrument(skip(self), fields(identity_id = %id, %role))]
    pub fn set_role(&self, id: &IdentityId, role: Role) -> Result<()> {
        self.update_one(
            id,
            "UPDATE identities SET role = ?2 WHERE id = ?1",
            params![id.to_string(), role.as_str()],
        )?;
        info!("role updated");
        Ok(())
    }

    /// The custody handle over this registry's keys.
    pub fn vault(&self) -> KeyVault {
        KeyVault {
            db: Arc::clone(&self.db),
        }
    }

    fn update_one(&self, id: &IdentityId, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        let conn = self.db.lock()?;
        let rows = conn.execute(sql, params).map_err(db_err)?;
        if rows == 0 {
            return Err(SafewatchError::NotFound(format!("identity {id}")));
        }
        Ok(())
    }
}

/// Key custody backed by the registry tables.
#[derive(Clone)]
pub struct KeyVault {
    db: Arc<Database>,
}

impl PublicKeyDirectory for KeyVault {
    fn public_key(&self, identity: &IdentityId) -> Result<Option<String>> {
        let conn = self.db.lock()?;
        conn.query_row(
            "SELECT public_key FROM identities WHERE id = ?1",
            params![identity.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

impl KeyCustody for KeyVault {
    fn private_key(&self, identity: &IdentityId) -> Result<Option<String>> {
        let conn = self.db.lock()?;
        conn.query_row(
            "SELECT private_key FROM identity_keys WHERE identity_id = ?1",
            params![identity.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    let id_str: String = row.get(0)?;
    let dob_str: String = row.get(3)?;
    let role_str: String = row.get(6)?;
    let location_json: Option<String> = row.get(7)?;
    let created_at_str: String = row.get(8)?;

    let id = IdentityId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let date_of_birth = dob_str.parse::<NaiveDate>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_location = location_json
        .map(|json| serde_json::from_str::<Location>(&json))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Identity {
        id,
        phone_number: row.get(1)?,
        name: row.get(2)?,
        date_of_birth,
        public_key_pem: row.get(4)?,
        verified: row.get(5)?,
        role: parse_enum(6, &role_str)?,
        last_location,
        created_at: parse_timestamp(8, &created_at_str)?,
        last_login_at: parse_opt_timestamp(9, row.get(9)?)?,
    })
}
