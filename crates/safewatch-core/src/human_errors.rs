// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// User-facing rejections.
//
// Every error is mapped to a plain-language message and, where one exists, a
// hint the client can act on (attempts left, seconds to wait). The transport
// layer picks its status code from `RejectionKind`; not-found and
// authorization failures never share a kind.

use serde::Serialize;

use crate::error::SafewatchError;

/// Broad class of a rejection, as the transport layer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The request itself was malformed.
    BadRequest,
    /// Credentials (code or token) missing, wrong, or stale.
    Unauthorized,
    /// Authenticated, but the role does not allow this.
    Forbidden,
    /// The record does not exist.
    NotFound,
    /// The request clashes with existing state.
    Conflict,
    /// Slow down and retry later.
    TooManyRequests,
    /// Our fault.
    Internal,
}

/// A rejection ready to be shown to a citizen or responder.
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub message: String,
    pub hint: Option<String>,
    /// Attempts left on the current one-time code, if relevant.
    pub remaining_attempts: Option<u32>,
    /// Seconds until a new code may be requested, if relevant.
    pub retry_after_secs: Option<u64>,
}

impl Rejection {
    fn new(kind: RejectionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: None,
            remaining_attempts: None,
            retry_after_secs: None,
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Convert a `SafewatchError` into a `Rejection`.
///
/// Internal details (database messages, crypto library errors) are kept out
/// of the user-facing text.
pub fn rejection_for(err: &SafewatchError) -> Rejection {
    use RejectionKind::*;

    match err {
        SafewatchError::Input(detail) => {
            Rejection::new(BadRequest, "Some of the details you entered aren't valid.").hint(detail.clone())
        }

        SafewatchError::RateLimited { retry_after_secs } => Rejection {
            retry_after_secs: Some(*retry_after_secs),
            ..Rejection::new(TooManyRequests, "A code was already sent to this number.")
                .hint(format!("Please wait {retry_after_secs} seconds before asking for a new one."))
        },

        SafewatchError::OtpExpired => Rejection::new(Unauthorized, "That code has expired.")
            .hint("Request a new code and try again."),

        SafewatchError::AttemptsExceeded => {
            Rejection::new(Unauthorized, "Too many incorrect codes were entered.")
                .hint("Request a new code to continue.")
        }

        SafewatchError::OtpMismatch { remaining_attempts } => Rejection {
            remaining_attempts: Some(*remaining_attempts),
            ..Rejection::new(Unauthorized, "That code isn't correct.").hint(
                if *remaining_attempts == 0 {
                    "No attempts left. Request a new code.".to_owned()
                } else {
                    format!("You have {remaining_attempts} attempt(s) left.")
                },
            )
        },

        SafewatchError::ExpiredToken => Rejection::new(Unauthorized, "Your session has expired.")
            .hint("Please sign in again."),

        SafewatchError::InvalidToken(_) => {
            Rejection::new(Unauthorized, "You need to sign in to do that.")
        }

        SafewatchError::Forbidden(_) => {
            Rejection::new(Forbidden, "You don't have permission to do that.")
        }

        SafewatchError::NotFound(what) => {
            Rejection::new(NotFound, "We couldn't find what you asked for.").hint(what.clone())
        }

        SafewatchError::Conflict(detail) => {
            Rejection::new(Conflict, "That already exists.").hint(detail.clone())
        }

        SafewatchError::InvalidTransition { from, to } => Rejection::new(
            Conflict,
            "That change isn't allowed at this stage.",
        )
        .hint(format!("A record that is {from} cannot become {to}.")),

        SafewatchError::KeyGeneration(_)
        | SafewatchError::Encryption(_)
        | SafewatchError::Unwrap(_)
        | SafewatchError::Decryption(_)
        | SafewatchError::IntegrityMismatch { .. } => {
            Rejection::new(Internal, "There was a security problem handling your data.")
                .hint("Please try again. If this keeps happening, contact support.")
        }

        SafewatchError::Database(_)
        | SafewatchError::Io(_)
        | SafewatchError::Serialization(_)
        | SafewatchError::Internal(_) => {
            Rejection::new(Internal, "Something went wrong on our side.")
                .hint("Please try again in a moment.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_carries_remaining_attempts() {
        let rejection = rejection_for(&SafewatchError::OtpMismatch { remaining_attempts: 2 });
        assert_eq!(rejection.kind, RejectionKind::Unauthorized);
        assert_eq!(rejection.remaining_attempts, Some(2));
        assert!(rejection.hint.unwrap().contains('2'));
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let rejection = rejection_for(&SafewatchError::RateLimited { retry_after_secs: 42 });
        assert_eq!(rejection.kind, RejectionKind::TooManyRequests);
        assert_eq!(rejection.retry_after_secs, Some(42));
    }

    #[test]
    fn not_found_is_distinct_from_auth_failures() {
        let missing = rejection_for(&SafewatchError::NotFound("incident".into()));
        let forbidden = rejection_for(&SafewatchError::Forbidden("admin only".into()));
        let expired = rejection_for(&SafewatchError::ExpiredToken);
        assert_eq!(missing.kind, RejectionKind::NotFound);
        assert_eq!(forbidden.kind, RejectionKind::Forbidden);
        assert_eq!(expired.kind, RejectionKind::Unauthorized);
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let rejection = rejection_for(&SafewatchError::Database("no such table: incidents".into()));
        assert_eq!(rejection.kind, RejectionKind::Internal);
        assert!(!rejection.message.contains("incidents"));
        assert!(!rejection.hint.unwrap_or_default().contains("incidents"));
    }
}
