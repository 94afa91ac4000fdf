// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Safewatch.

use thiserror::Error;

/// Top-level error type for all Safewatch operations.
#[derive(Debug, Error)]
pub enum SafewatchError {
    // -- Input --
    #[error("invalid input: {0}")]
    Input(String),

    // -- Cryptography --
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("key unwrap failed: {0}")]
    Unwrap(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    // -- One-time codes --
    #[error("a code was already sent; retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("one-time code expired")]
    OtpExpired,

    #[error("too many incorrect attempts")]
    AttemptsExceeded,

    #[error("incorrect code; {remaining_attempts} attempt(s) remaining")]
    OtpMismatch { remaining_attempts: u32 },

    // -- Tokens and authorization --
    #[error("token expired")]
    ExpiredToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    // -- Records --
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("illegal status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SafewatchError>;
