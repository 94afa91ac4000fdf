// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Safewatch Store: SQLite persistence for identities, one-time codes,
// emergency alerts and complaints. Every store shares one `Database` handle.
//
// All methods are synchronous because `rusqlite` does not support async
// natively. In an async context, wrap calls in `tokio::task::spawn_blocking`.

pub mod complaints;
pub mod db;
pub mod identities;
pub mod incidents;
pub mod otp;
mod sealed;

pub use complaints::ComplaintStore;
pub use db::Database;
pub use identities::{IdentityRegistry, KeyVault};
pub use incidents::IncidentStore;
pub use otp::{OtpAuthenticator, OtpIssued, OtpPolicy};
