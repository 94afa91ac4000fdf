// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! safewatch-security: cryptographic foundation for Safewatch.
//!
//! Per-identity RSA key pairs, envelope encryption of free text, the key
//! custody boundary through which private keys are released, HS256 bearer
//! tokens, SHA-256 fingerprints, and the append-only audit trail.

pub mod audit;
pub mod custody;
pub mod envelope;
pub mod integrity;
pub mod keys;
pub mod token;

pub use audit::AuditLog;
pub use custody::{KeyCustody, MemoryCustody, PublicKeyDirectory, reveal};
pub use envelope::EnvelopeCrypto;
pub use integrity::{hash_bytes, subject_fingerprint, verify_hash};
pub use keys::{KeyPair, KeyPairProvider, fingerprint};
pub use token::{Claims, IssuedToken, TokenIssuer, TokenSubject};
