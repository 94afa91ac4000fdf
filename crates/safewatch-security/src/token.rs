// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Signed, time-limited, role-scoped bearer tokens (HS256 JWT).

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use safewatch_core::error::{Result, SafewatchError};
use safewatch_core::types::{IdentityId, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Minimum HMAC secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// The claims embedded in every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Identity id.
    pub sub: String,
    pub name: String,
    pub phone: String,
    pub verified: bool,
    pub role: Role,
    /// SHA-256 fingerprint of the identity's public key.
    pub key_fingerprint: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

impl Claims {
    pub fn identity_id(&self) -> Result<IdentityId> {
        IdentityId::parse(&self.sub).map_err(|_| SafewatchError::InvalidToken("malformed subject".into()))
    }

    /// Succeed only when the token carries `role`. Admins pass every check.
    pub fn require_role(&self, role: Role) -> Result<()> {
        if self.role == role || self.role == Role::Admin {
            Ok(())
        } else {
            Err(SafewatchError::Forbidden(format!(
                "requires {role} role, token carries {}",
                self.role
            )))
        }
    }
}

/// Who a token is being issued to.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub identity_id: IdentityId,
    pub name: String,
    pub phone: String,
    pub verified: bool,
    pub role: Role,
    pub key_fingerprint: String,
}

/// A freshly minted token together with the claims it carries.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

/// Issues and verifies tokens for one deployment.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
}

impl TokenIssuer {
    /// Build an issuer from a raw HMAC secret of at least
    /// [`MIN_SECRET_LEN`] bytes.
    pub fn new(secret: &[u8], issuer: impl Into<String>, audience: impl Into<String>) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SafewatchError::Input(format!(
                "token secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            audience: audience.into(),
        })
    }

    /// Mint a token valid for `ttl` from now.
    #[instrument(skip_all, fields(role = %subject.role, ttl_secs = ttl.as_secs()))]
    pub fn issue(&self, subject: &TokenSubject, ttl: Duration) -> Result<IssuedToken> {
        let ttl_secs = i64::try_from(ttl.as_secs())
            .map_err(|_| SafewatchError::Input("token lifetime too large".into()))?;
        let iat = Utc::now().timestamp();

        let claims = Claims {
            sub: subject.identity_id.to_string(),
            name: subject.name.clone(),
            phone: subject.phone.clone(),
            verified: subject.verified,
            role: subject.role,
            key_fingerprint: subject.key_fingerprint.clone(),
            iat,
            exp: iat.saturating_add(ttl_secs),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SafewatchError::Internal(format!("token signing failed: {e}")))?;

        debug!(exp = claims.exp, "token issued");
        Ok(IssuedToken { token, claims })
    }

    /// Check signature, issuer, audience and expiry, then return the claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        jsonwebtoken::decode::<Claims>(token.trim(), &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => SafewatchError::ExpiredToken,
                _ => SafewatchError::InvalidToken(e.to_string()),
            })
    }

    /// Verify the value of an `Authorization` header (`Bearer <token>`).
    pub fn verify_bearer(&self, header_value: &str) -> Result<Claims> {
        let token = header_value
            .trim()
            .strip_prefix("Bearer ")
            .ok_or_else(|| SafewatchError::InvalidToken("missing bearer scheme".into()))?;
        self.verify(token)
    }
}
