// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer. Initialises every backend subsystem and exposes the
// calls the transport layer makes on behalf of citizens and responders.
//
// All stores share one `Database`. The `AuditLog` is `Send` but not `Sync`,
// so it is wrapped in a `Mutex`. Every call is a short synchronous SQLite
// operation; async callers should go through `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use rand::rngs::OsRng;
use safewatch_core::error::{Result, SafewatchError};
use safewatch_core::types::{
    Complaint, ComplaintId, ComplaintStats, ComplaintStatus, ComplaintSubmission, IdentityId,
    Identity, Incident, IncidentRecord, IncidentStats, IncidentStatus, IncidentSubmission,
    Location, RegistrationRequest, Revealed, Role, normalize_phone,
};
use safewatch_core::SafewatchConfig;
use safewatch_security::audit::AuditEntry;
use safewatch_security::{
    AuditLog, Claims, IssuedToken, KeyPairProvider, TokenIssuer, TokenSubject, fingerprint,
    subject_fingerprint,
};
use safewatch_store::{
    ComplaintStore, Database, IdentityRegistry, IncidentStore, KeyVault, OtpAuthenticator,
    OtpIssued, OtpPolicy,
};
use tracing::{error, info, warn};

use super::data_dir;

const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "safewatch.db";
const AUDIT_FILE: &str = "audit.db";

/// Bytes of entropy in a generated token secret.
const TOKEN_SECRET_BYTES: usize = 32;

/// Shared application services.
///
/// Responder reads hand the key vault to the stores only after the caller's
/// claims have passed `require_role(Responder)`.
pub struct AppServices {
    db: Arc<Database>,
    identities: IdentityRegistry,
    vault: Arc<KeyVault>,
    otp: OtpAuthenticator,
    tokens: TokenIssuer,
    incidents: IncidentStore,
    complaints: ComplaintStore,
    audit_log: Option<Mutex<AuditLog>>,
    config: SafewatchConfig,
    data_dir: Option<PathBuf>,
}

#[allow(dead_code)]
impl AppServices {
    /// Initialise all services in the default data directory.
    pub fn init() -> Result<Self> {
        let dir = data_dir::data_dir()?;
        Self::open(&dir)
    }

    /// Initialise all services in `dir`.
    ///
    /// Loads `config.json` (defaults if absent or unreadable), generates and
    /// persists a token secret on first start, and opens both databases.
    pub fn open(dir: &Path) -> Result<Self> {
        info!(path = %dir.display(), "initialising app services");

        let mut config = load_config(dir).unwrap_or_default();
        if config.token_secret.is_empty() {
            config.token_secret = generate_secret();
            persist_config(dir, &config)?;
            info!("generated new token secret");
        }

        let db = Database::open(dir.join(DATABASE_FILE))?;
        let audit_log = if config.audit_enabled {
            Some(AuditLog::open(dir.join(AUDIT_FILE))?)
        } else {
            None
        };

        Self::assemble(db, audit_log, config, Some(dir.to_path_buf()))
    }

    /// Services over in-memory databases. Nothing touches the filesystem.
    pub fn in_memory(mut config: SafewatchConfig) -> Result<Self> {
        if config.token_secret.is_empty() {
            config.token_secret = generate_secret();
        }
        let db = Database::open_in_memory()?;
        let audit_log = if config.audit_enabled {
            Some(AuditLog::open_in_memory()?)
        } else {
            None
        };
        Self::assemble(db, audit_log, config, None)
    }

    fn assemble(
        db: Database,
        audit_log: Option<AuditLog>,
        config: SafewatchConfig,
        data_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let secret = hex::decode(config.token_secret.trim())
            .map_err(|e| SafewatchError::Input(format!("token secret is not hex: {e}")))?;
        let tokens = TokenIssuer::new(&secret, &config.token_issuer, &config.token_audience)?;

        let db = Arc::new(db);
        let identities =
            IdentityRegistry::new(Arc::clone(&db), KeyPairProvider::with_bits(config.key_bits)?);
        let vault = Arc::new(identities.vault());
        let otp = OtpAuthenticator::new(Arc::clone(&db), OtpPolicy::from_config(&config)?)?;
        let incidents = IncidentStore::new(Arc::clone(&db), vault.clone());
        let complaints = ComplaintStore::new(Arc::clone(&db), vault.clone());

        info!(audit = audit_log.is_some(), "app services initialised");
        Ok(Self {
            db,
            identities,
            vault,
            otp,
            tokens,
            incidents,
            complaints,
            audit_log: audit_log.map(Mutex::new),
            config,
            data_dir,
        })
    }

    // -- Registration and login ---------------------------------------------

    /// Register a citizen and mint their key pair.
    pub fn register(&self, request: &RegistrationRequest) -> Result<Identity> {
        let result = self.identities.register(request);
        self.audit_result("register", "phone", &request.phone_number, &result);
        result
    }

    /// Issue a one-time code for `phone`. Delivery is the caller's job.
    pub fn request_otp(&self, phone: &str) -> Result<OtpIssued> {
        let result = self.otp.generate(phone);
        self.audit_result("otp_issued", "phone", phone, &result);
        result
    }

    /// Exchange a valid one-time code for a session token.
    ///
    /// Marks the identity verified and records the login (and location, if
    /// the device sent one). A refused location or an unknown number leaves
    /// the code unspent.
    pub fn login(&self, phone: &str, code: &str, location: Option<&Location>) -> Result<IssuedToken> {
        let result = self.login_inner(phone, code, location);
        self.audit_result("login", "phone", phone, &result);
        result
    }

    fn login_inner(&self, phone: &str, code: &str, location: Option<&Location>) -> Result<IssuedToken> {
        // Everything that can refuse the login runs before the code is spent.
        if let Some(location) = location {
            location.validate()?;
        }
        let identity = self
            .identities
            .find_by_phone(phone)?
            .ok_or_else(|| SafewatchError::NotFound("no identity registered for this number".into()))?;

        self.otp.validate(phone, code)?;
        let identity = self.identities.record_login(&identity.id, location)?;

        let subject = TokenSubject {
            identity_id: identity.id,
            name: identity.name.clone(),
            phone: identity.phone_number.clone(),
            verified: identity.verified,
            role: identity.role,
            key_fingerprint: fingerprint(&identity.public_key_pem),
        };
        self.tokens.issue(&subject, self.config.token_ttl())
    }

    /// Verify an `Authorization` header value.
    pub fn authenticate(&self, bearer: &str) -> Result<Claims> {
        self.tokens.verify_bearer(bearer)
    }

    /// Grant `role` to an identity. Admins only.
    pub fn grant_role(&self, caller: &Claims, identity: &IdentityId, role: Role) -> Result<()> {
        caller.require_role(Role::Admin)?;
        let result = self.identities.set_role(identity, role);
        self.audit_result("grant_role", "identity", &identity.to_string(), &result);
        result
    }

    // -- Incidents -----------------------------------------------------------

    /// Raise or replace the caller's active alert.
    pub fn submit_incident(&self, caller: &Claims, submission: &IncidentSubmission) -> Result<Incident> {
        let identity = caller.identity_id()?;
        let incident = self.incidents.submit(&identity, submission)?;
        if incident.encryption_degraded {
            self.audit("plaintext_fallback", "identity", &identity.to_string(), false, Some("incident"));
        }
        Ok(incident)
    }

    /// The caller's own active alert, still sealed.
    pub fn my_incident(&self, caller: &Claims) -> Result<Option<Incident>> {
        self.incidents.get(&caller.identity_id()?)
    }

    pub fn set_incident_status(
        &self,
        caller: &Claims,
        identity: &IdentityId,
        status: IncidentStatus,
    ) -> Result<bool> {
        caller.require_role(Role::Responder)?;
        self.incidents.update_status(identity, status)
    }

    /// Archive an identity's alert, recording the caller as resolver.
    pub fn resolve_incident(
        &self,
        caller: &Claims,
        identity: &IdentityId,
        notes: Option<&str>,
    ) -> Result<bool> {
        caller.require_role(Role::Responder)?;
        let result = self.incidents.resolve(identity, &caller.sub, notes);
        self.audit_result("incident_resolved", "identity", &identity.to_string(), &result);
        result
    }

    pub fn active_incidents(&self, caller: &Claims) -> Result<Vec<Revealed<Incident>>> {
        caller.require_role(Role::Responder)?;
        self.incidents.list_active_revealed(self.vault.as_ref())
    }

    pub fn incident_history(&self, caller: &Claims, limit: usize) -> Result<Vec<Revealed<IncidentRecord>>> {
        caller.require_role(Role::Responder)?;
        self.incidents.history_revealed(limit, self.vault.as_ref())
    }

    pub fn incident_stats(&self, caller: &Claims) -> Result<IncidentStats> {
        caller.require_role(Role::Responder)?;
        self.incidents.stats()
    }

    // -- Complaints ----------------------------------------------------------

    pub fn file_complaint(&self, caller: &Claims, submission: &ComplaintSubmission) -> Result<Complaint> {
        let identity = caller.identity_id()?;
        let complaint = self.complaints.file(&identity, submission)?;
        if complaint.encryption_degraded {
            self.audit("plaintext_fallback", "identity", &identity.to_string(), false, Some("complaint"));
        }
        Ok(complaint)
    }

    /// The caller's own complaints, descriptions still sealed.
    pub fn my_complaints(&self, caller: &Claims) -> Result<Vec<Complaint>> {
        self.complaints.list_for_owner(&caller.identity_id()?)
    }

    pub fn assign_complaint(&self, caller: &Claims, id: &ComplaintId, assignee: &str) -> Result<Complaint> {
        caller.require_role(Role::Responder)?;
        self.complaints.assign(id, assignee)
    }

    pub fn start_complaint(&self, caller: &Claims, id: &ComplaintId) -> Result<Complaint> {
        caller.require_role(Role::Responder)?;
        self.complaints.start_progress(id)
    }

    pub fn resolve_complaint(&self, caller: &Claims, id: &ComplaintId, notes: Option<&str>) -> Result<Complaint> {
        caller.require_role(Role::Responder)?;
        self.complaints.resolve(id, notes)
    }

    pub fn reject_complaint(&self, caller: &Claims, id: &ComplaintId, notes: Option<&str>) -> Result<Complaint> {
        caller.require_role(Role::Responder)?;
        self.complaints.reject(id, notes)
    }

    pub fn complaints(
        &self,
        caller: &Claims,
        status: Option<ComplaintStatus>,
    ) -> Result<Vec<Revealed<Complaint>>> {
        caller.require_role(Role::Responder)?;
        self.complaints.list_revealed(status, self.vault.as_ref())
    }

    pub fn complaint_stats(&self, caller: &Claims) -> Result<ComplaintStats> {
        caller.require_role(Role::Responder)?;
        self.complaints.stats()
    }

    // -- Maintenance ---------------------------------------------------------

    /// Purge expired one-time codes. Called periodically by the daemon.
    pub fn sweep_expired_otps(&self) -> Result<usize> {
        self.otp.cleanup_expired()
    }

    pub fn config(&self) -> &SafewatchConfig {
        &self.config
    }

    /// Path to the data directory, if services are on disk.
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Close the database. Consumes the services.
    pub fn shutdown(self) -> Result<()> {
        let Self {
            db,
            identities,
            vault,
            otp,
            incidents,
            complaints,
            ..
        } = self;
        drop((identities, vault, otp, incidents, complaints));

        match Arc::try_unwrap(db) {
            Ok(db) => db.close(),
            Err(_) => {
                warn!("database still shared at shutdown, leaving it to drop");
                Ok(())
            }
        }
    }

    // -- Audit Trail ---------------------------------------------------------

    /// Record an audit entry. `value` is fingerprinted, never stored raw.
    fn audit(&self, action: &str, kind: &str, value: &str, success: bool, details: Option<&str>) {
        let Some(audit_log) = &self.audit_log else {
            return;
        };
        // Phones are fingerprinted in canonical form so every spelling of a
        // number lands on the same subject.
        let value = match kind {
            "phone" => normalize_phone(value).unwrap_or_else(|_| value.to_owned()),
            _ => value.to_owned(),
        };
        let subject = subject_fingerprint(kind, &value);
        if let Ok(log) = audit_log.lock()
            && let Err(e) = log.record(action, &subject, success, details)
        {
            error!(error = %e, "failed to record audit entry");
        }
    }

    fn audit_result<T>(&self, action: &str, kind: &str, value: &str, result: &Result<T>) {
        match result {
            Ok(_) => self.audit(action, kind, value, true, None),
            Err(e) => self.audit(action, kind, value, false, Some(&e.to_string())),
        }
    }

    /// Audit entries for a phone number. Admins only.
    pub fn audit_entries_for_phone(&self, caller: &Claims, phone: &str) -> Result<Vec<AuditEntry>> {
        caller.require_role(Role::Admin)?;
        let subject = subject_fingerprint("phone", &normalize_phone(phone)?);
        self.with_audit_log(|log| log.entries_for_subject(&subject))
    }

    /// Most recent audit entries. Admins only.
    pub fn recent_audit_entries(&self, caller: &Claims, limit: u32) -> Result<Vec<AuditEntry>> {
        caller.require_role(Role::Admin)?;
        self.with_audit_log(|log| log.recent_entries(limit))
    }

    fn with_audit_log<T>(&self, f: impl FnOnce(&AuditLog) -> Result<Vec<T>>) -> Result<Vec<T>> {
        let Some(audit_log) = &self.audit_log else {
            return Ok(Vec::new());
        };
        let log = audit_log
            .lock()
            .map_err(|_| SafewatchError::Internal("audit lock poisoned".into()))?;
        f(&log)
    }
}

// -- Config file persistence -------------------------------------------------

fn load_config(data_dir: &Path) -> Option<SafewatchConfig> {
    let path = data_dir.join(CONFIG_FILE);
    let data = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&data) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "config unreadable, using defaults");
            None
        }
    }
}

fn persist_config(data_dir: &Path, config: &SafewatchConfig) -> Result<()> {
    let path = data_dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json)?;
    Ok(())
}

fn generate_secret() -> String {
    let mut secret = [0u8; TOKEN_SECRET_BYTES];
    OsRng.fill_bytes(&mut secret);
    hex::encode(secret)
}
