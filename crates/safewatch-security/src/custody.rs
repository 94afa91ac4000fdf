// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Key custody boundary.
//
// Stores are constructed with a `PublicKeyDirectory`, which is enough to
// seal text. Opening it needs a `KeyCustody`, which the service layer hands
// out only on paths that have already checked the caller's role.

use std::collections::HashMap;
use std::sync::RwLock;

use safewatch_core::error::{Result, SafewatchError};
use safewatch_core::types::{IdentityId, RevealState, StoredText};
use tracing::warn;

use crate::envelope::EnvelopeCrypto;

/// Marker shown in place of text that could not be decrypted.
pub const UNREADABLE_MARKER: &str = "[unable to decrypt message]";

/// Lookup of identity public keys.
pub trait PublicKeyDirectory: Send + Sync {
    /// The SPKI PEM public key of `identity`, if one is on file.
    fn public_key(&self, identity: &IdentityId) -> Result<Option<String>>;
}

/// Release of identity private keys, for authorized decrypt paths only.
pub trait KeyCustody: PublicKeyDirectory {
    /// The PKCS#8 PEM private key of `identity`, if one is on file.
    fn private_key(&self, identity: &IdentityId) -> Result<Option<String>>;
}

/// Turn stored text back into something a responder can read.
///
/// Failures never propagate: a record whose key is missing or whose envelope
/// does not open is reported as `Unreadable` with a marker text, so one bad
/// record cannot sink a whole listing.
pub fn reveal(
    crypto: &EnvelopeCrypto,
    keys: &dyn KeyCustody,
    owner: &IdentityId,
    stored: &StoredText,
) -> (String, RevealState) {
    match stored {
        StoredText::Plain { text } => (text.clone(), RevealState::Plaintext),
        StoredText::Sealed { envelope } => {
            let opened = keys.private_key(owner).and_then(|key| {
                let key = key.ok_or_else(|| {
                    SafewatchError::NotFound(format!("private key for identity {owner}"))
                })?;
                crypto.decrypt(envelope, &key)
            });
            match opened {
                Ok(text) => (text, RevealState::Decrypted),
                Err(e) => {
                    warn!(error = %e, "stored text could not be decrypted");
                    (UNREADABLE_MARKER.to_owned(), RevealState::Unreadable)
                }
            }
        }
    }
}

/// In-memory custody, for tests and tooling.
#[derive(Default)]
pub struct MemoryCustody {
    keys: RwLock<HashMap<IdentityId, (String, String)>>,
}

impl MemoryCustody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: IdentityId, public_key_pem: String, private_key_pem: String) -> Result<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| SafewatchError::Internal("key map lock poisoned".into()))?;
        keys.insert(identity, (public_key_pem, private_key_pem));
        Ok(())
    }
}

impl PublicKeyDirectory for MemoryCustody {
    fn public_key(&self, identity: &IdentityId) -> Result<Option<String>> {
        let keys = self
            .keys
            .read()
            .map_err(|_| SafewatchError::Internal("key map lock poisoned".into()))?;
        Ok(keys.get(identity).map(|(public, _)| public.clone()))
    }
}

impl KeyCustody for MemoryCustody {
    fn private_key(&self, identity: &IdentityId) -> Result<Option<String>> {
        let keys = self
            .keys
            .read()
            .map_err(|_| SafewatchError::Internal("key map lock poisoned".into()))?;
        Ok(keys.get(identity).map(|(_, private)| private.clone()))
    }
}
