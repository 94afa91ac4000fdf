// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for Safewatch.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SafewatchError};

/// Unique identifier for a registered citizen or responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub Uuid);

impl IdentityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the hyphenated form stored in the database and in token subjects.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SafewatchError::Input(format!("malformed identity id: {e}")))
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a complaint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComplaintId(pub Uuid);

impl ComplaintId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SafewatchError::Input(format!("malformed complaint id: {e}")))
    }
}

impl Default for ComplaintId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ComplaintId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Defines a closed string-backed enum with `as_str`, `Display`, and `FromStr`.
///
/// The string forms are what the database stores and what the transport
/// layer sends, so they must never change once released.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = SafewatchError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(SafewatchError::Input(format!(
                        "unknown {} value: {other}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

string_enum! {
    /// Authorization scope carried in a bearer token.
    Role {
        Citizen => "citizen",
        Responder => "responder",
        /// Satisfies every role requirement.
        Admin => "admin",
    }
}

string_enum! {
    /// How urgently a report needs attention.
    Urgency {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

string_enum! {
    /// Lifecycle of an active alert.
    ///
    /// `Resolved` only ever appears on archived history rows; it is reached
    /// through `IncidentStore::resolve`, never through a status update.
    IncidentStatus {
        Active => "active",
        Responding => "responding",
        Resolved => "resolved",
    }
}

string_enum! {
    /// Lifecycle of a complaint.
    ComplaintStatus {
        Pending => "pending",
        Assigned => "assigned",
        InProgress => "in_progress",
        Resolved => "resolved",
        Rejected => "rejected",
    }
}

impl ComplaintStatus {
    /// Whether the complaint has left the working queue for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected)
    }

    /// The legal edges of the complaint lifecycle.
    pub fn can_transition_to(&self, next: ComplaintStatus) -> bool {
        use ComplaintStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Assigned, InProgress)
                | (Assigned, Resolved)
                | (InProgress, Resolved)
                | (Pending, Rejected)
                | (Assigned, Rejected)
                | (InProgress, Rejected)
        )
    }

    /// Every status from which `next` may be entered.
    pub fn predecessors(next: ComplaintStatus) -> Vec<ComplaintStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

/// Geographic position of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported GPS accuracy in metres.
    pub accuracy: Option<f64>,
    pub address: Option<String>,
}

impl Location {
    pub fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(SafewatchError::Input(format!(
                "latitude out of range: {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(SafewatchError::Input(format!(
                "longitude out of range: {}",
                self.longitude
            )));
        }
        if let Some(accuracy) = self.accuracy
            && (!accuracy.is_finite() || accuracy < 0.0)
        {
            return Err(SafewatchError::Input(format!("invalid accuracy: {accuracy}")));
        }
        Ok(())
    }
}

/// The three artifacts of an envelope-encrypted text, base64-encoded.
///
/// The fields only exist together: there is no way to hold a ciphertext
/// without its wrapped key and IV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ciphertext: String,
    pub wrapped_key: String,
    pub iv: String,
}

/// Free text as it sits at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredText {
    Plain { text: String },
    Sealed { envelope: Envelope },
}

impl StoredText {
    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Sealed { .. })
    }
}

/// How a stored text was turned back into something displayable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealState {
    /// Decrypted with the owner's private key.
    Decrypted,
    /// Stored unencrypted in the first place.
    Plaintext,
    /// Decryption failed; `text` holds a marker instead of content.
    Unreadable,
}

/// A record paired with its displayable text, for responder reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revealed<T> {
    pub record: T,
    pub text: String,
    pub state: RevealState,
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Registration payload from the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub name: String,
    /// Date of birth as `YYYY-MM-DD`.
    pub dob: String,
    pub phone_number: String,
}

impl RegistrationRequest {
    pub fn parsed_dob(&self) -> Result<NaiveDate> {
        let dob = NaiveDate::parse_from_str(self.dob.trim(), "%Y-%m-%d")
            .map_err(|e| SafewatchError::Input(format!("date of birth: {e}")))?;
        if dob > Utc::now().date_naive() {
            return Err(SafewatchError::Input("date of birth is in the future".into()));
        }
        Ok(dob)
    }
}

/// A registered person, as shown to citizens.
///
/// Never carries the private key; that lives behind key custody.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub phone_number: String,
    pub name: String,
    pub date_of_birth: NaiveDate,
    pub public_key_pem: String,
    pub verified: bool,
    pub role: Role,
    pub last_location: Option<Location>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Normalise a phone number to `+<digits>` or `<digits>`.
///
/// Spaces, dashes, dots and parentheses are dropped. Anything else, or a
/// digit count outside 7..=15 (E.164), is rejected.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let (plus, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let mut digits = String::with_capacity(rest.len());
    for ch in rest.chars() {
        match ch {
            '0'..='9' => digits.push(ch),
            ' ' | '-' | '.' | '(' | ')' => {}
            other => {
                return Err(SafewatchError::Input(format!(
                    "phone number contains '{other}'"
                )));
            }
        }
    }

    if !(7..=15).contains(&digits.len()) {
        return Err(SafewatchError::Input(format!(
            "phone number must have 7-15 digits, got {}",
            digits.len()
        )));
    }

    Ok(if plus { format!("+{digits}") } else { digits })
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

/// Emergency alert payload from the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentSubmission {
    pub message: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub accuracy: Option<f64>,
    pub urgency: Option<Urgency>,
}

impl IncidentSubmission {
    /// Alerts default to high urgency when the client does not say.
    pub const DEFAULT_URGENCY: Urgency = Urgency::High;

    pub fn location(&self) -> Location {
        Location {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            address: self
                .address
                .as_ref()
                .map(|a| a.trim().to_owned())
                .filter(|a| !a.is_empty()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.message.trim().is_empty() {
            return Err(SafewatchError::Input("alert message is empty".into()));
        }
        self.location().validate()
    }
}

/// The single active alert of an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub identity_id: IdentityId,
    pub location: Location,
    pub urgency: Urgency,
    pub status: IncidentStatus,
    pub message: StoredText,
    /// Set when the message could not be encrypted and was kept in plaintext.
    pub encryption_degraded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An archived, resolved alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: i64,
    pub identity_id: IdentityId,
    pub location: Location,
    pub urgency: Urgency,
    pub status: IncidentStatus,
    pub message: StoredText,
    pub encryption_degraded: bool,
    /// Creation time of the original alert.
    pub created_at: DateTime<Utc>,
    pub resolved_by: String,
    pub resolution_notes: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// An alert in either of its two lives, as returned by `list_all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IncidentEntry {
    Active(Incident),
    Archived(IncidentRecord),
}

/// Alert counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentStats {
    pub active: u64,
    pub responding: u64,
    pub resolved: u64,
}

impl IncidentStats {
    pub fn open(&self) -> u64 {
        self.active + self.responding
    }
}

// ---------------------------------------------------------------------------
// Complaints
// ---------------------------------------------------------------------------

/// Complaint payload from the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintSubmission {
    pub category: String,
    pub subject: String,
    pub description: String,
    pub location: Option<String>,
    pub urgency: Option<Urgency>,
}

impl ComplaintSubmission {
    pub const DEFAULT_URGENCY: Urgency = Urgency::Medium;

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("category", &self.category),
            ("subject", &self.subject),
            ("description", &self.description),
        ] {
            if value.trim().is_empty() {
                return Err(SafewatchError::Input(format!("complaint {field} is empty")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Complaint {
    pub id: ComplaintId,
    pub owner: IdentityId,
    pub category: String,
    pub subject: String,
    pub description: StoredText,
    pub encryption_degraded: bool,
    pub location: Option<String>,
    pub urgency: Urgency,
    pub status: ComplaintStatus,
    pub assigned_to: Option<String>,
    pub response_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Complaint counts, keyed by the status / category strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplaintStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_category: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalisation() {
        assert_eq!(normalize_phone(" +1 (234) 567-890 ").unwrap(), "+1234567890");
        assert_eq!(normalize_phone("0712345678").unwrap(), "0712345678");
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("+12345abc90").is_err());
        assert!(normalize_phone("").is_err());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in ComplaintStatus::ALL {
            assert_eq!(status.as_str().parse::<ComplaintStatus>().unwrap(), *status);
        }
        assert!("closed".parse::<IncidentStatus>().is_err());
        assert_eq!("in_progress".parse::<ComplaintStatus>().unwrap(), ComplaintStatus::InProgress);
    }

    #[test]
    fn complaint_lifecycle_edges() {
        use ComplaintStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Resolved));
        assert!(!Pending.can_transition_to(Resolved));
        assert!(!Resolved.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Pending));
        assert_eq!(ComplaintStatus::predecessors(Resolved), vec![Assigned, InProgress]);
    }

    #[test]
    fn submission_validation() {
        let mut submission = IncidentSubmission {
            message: "help".into(),
            latitude: 1.0,
            longitude: 2.0,
            address: Some("  ".into()),
            accuracy: None,
            urgency: None,
        };
        assert!(submission.validate().is_ok());
        assert!(submission.location().address.is_none());

        submission.latitude = 91.0;
        assert!(matches!(submission.validate(), Err(SafewatchError::Input(_))));

        submission.latitude = 0.0;
        submission.message = "   ".into();
        assert!(submission.validate().is_err());
    }

    #[test]
    fn registration_payload_uses_camel_case() {
        let req: RegistrationRequest = serde_json::from_str(
            r#"{"name":"Ada","dob":"1990-04-01","phoneNumber":"+1234567890"}"#,
        )
        .unwrap();
        assert_eq!(req.phone_number, "+1234567890");
        assert_eq!(req.parsed_dob().unwrap(), NaiveDate::from_ymd_opt(1990, 4, 1).unwrap());

        let bad = RegistrationRequest {
            dob: "01/04/1990".into(),
            ..req
        };
        assert!(bad.parsed_dob().is_err());
    }
}
