// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SHA-256 fingerprints for integrity checks and pseudonymous log subjects.

use safewatch_core::error::SafewatchError;
use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of `data` and return it as a lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify that `data` matches the expected SHA-256 hex digest.
///
/// The comparison is case-insensitive on the hex text.
pub fn verify_hash(data: &[u8], expected_hex: &str) -> Result<(), SafewatchError> {
    let actual = hash_bytes(data);
    if actual.eq_ignore_ascii_case(expected_hex.trim()) {
        Ok(())
    } else {
        Err(SafewatchError::IntegrityMismatch {
            expected: expected_hex.to_owned(),
            actual,
        })
    }
}

/// Fingerprint a personal identifier (phone number, identity id) so that it
/// can be written to logs and the audit trail without the raw value.
///
/// `kind` separates namespaces: the same string hashed as a phone and as an
/// identity id yields different fingerprints.
pub fn subject_fingerprint(kind: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_known_value() {
        // SHA-256("hello"), checked against coreutils sha256sum.
        let expected = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert_eq!(hash_bytes(b"hello"), expected);
    }

    #[test]
    fn verify_accepts_uppercase_hex() {
        let digest = hash_bytes(b"safewatch").to_ascii_uppercase();
        assert!(verify_hash(b"safewatch", &digest).is_ok());
    }

    #[test]
    fn verify_mismatched_hash() {
        match verify_hash(b"a", "0000") {
            Err(SafewatchError::IntegrityMismatch { expected, actual }) => {
                assert_eq!(expected, "0000");
                assert_eq!(actual, hash_bytes(b"a"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn subject_kinds_are_separated() {
        let as_phone = subject_fingerprint("phone", "+1234567890");
        let as_id = subject_fingerprint("identity", "+1234567890");
        assert_ne!(as_phone, as_id);
        assert_eq!(as_phone, subject_fingerprint("phone", "+1234567890"));
        assert_ne!(as_phone, hash_bytes(b"+1234567890"));
    }
}
