// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Persistent service settings.
///
/// Durations are stored as whole seconds so the JSON file stays readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafewatchConfig {
    /// RSA modulus size for newly registered identities.
    pub key_bits: usize,
    /// Lifetime of a one-time code.
    pub otp_ttl_secs: u64,
    /// Wrong guesses allowed before a code is burned.
    pub otp_max_attempts: u32,
    /// Number of digits in a one-time code.
    pub otp_digits: u32,
    /// Lifetime of a citizen session token.
    pub token_ttl_secs: u64,
    /// `iss` claim stamped on every token.
    pub token_issuer: String,
    /// `aud` claim stamped on every token.
    pub token_audience: String,
    /// HMAC secret for token signing (hex). Generated on first start when empty.
    pub token_secret: String,
    /// How often the daemon purges expired one-time codes.
    pub otp_sweep_interval_secs: u64,
    /// Enable audit trail logging.
    pub audit_enabled: bool,
}

impl SafewatchConfig {
    pub fn otp_ttl(&self) -> Duration {
        Duration::from_secs(self.otp_ttl_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn otp_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.otp_sweep_interval_secs.max(1))
    }
}

impl Default for SafewatchConfig {
    fn default() -> Self {
        Self {
            key_bits: 2048,
            otp_ttl_secs: 5 * 60,
            otp_max_attempts: 3,
            otp_digits: 6,
            token_ttl_secs: 24 * 60 * 60,
            token_issuer: "safewatch".into(),
            token_audience: "safewatch-clients".into(),
            token_secret: String::new(),
            otp_sweep_interval_secs: 60,
            audit_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_session_policy() {
        let config = SafewatchConfig::default();
        assert_eq!(config.otp_ttl(), Duration::from_secs(300));
        assert_eq!(config.otp_max_attempts, 3);
        assert_eq!(config.token_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.key_bits, 2048);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: SafewatchConfig =
            serde_json::from_str(r#"{"otp_max_attempts": 5}"#).expect("parse");
        assert_eq!(config.otp_max_attempts, 5);
        assert_eq!(config.otp_digits, 6);
        assert!(config.token_secret.is_empty());
    }
}
