// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sealing free text on the way in, and mapping it to and from the four
// storage columns (plaintext, ciphertext, wrapped key, IV).

use rusqlite::types::Type;
use safewatch_core::error::SafewatchError;
use safewatch_core::types::{Envelope, IdentityId, StoredText};
use safewatch_security::{EnvelopeCrypto, PublicKeyDirectory};
use tracing::warn;

/// Seal `text` for `owner`, or keep it plain if that is impossible.
///
/// Returns the stored form and whether sealing was skipped. A missing key
/// or a failed encryption never rejects the submission; the record is
/// flagged instead, so an emergency report is never lost for a crypto
/// reason.
pub(crate) fn seal_or_degrade(
    crypto: &EnvelopeCrypto,
    directory: &dyn PublicKeyDirectory,
    owner: &IdentityId,
    text: &str,
) -> (StoredText, bool) {
    let sealed = directory.public_key(owner).and_then(|key| {
        let key = key.ok_or_else(|| SafewatchError::NotFound(format!("public key for identity {owner}")))?;
        crypto.encrypt(text, &key)
    });

    match sealed {
        Ok(envelope) => (StoredText::Sealed { envelope }, false),
        Err(e) => {
            warn!(error = %e, "storing text unencrypted");
            (StoredText::Plain { text: text.to_owned() }, true)
        }
    }
}

/// Column values for a stored text: `(plaintext, ciphertext, wrapped_key, iv)`.
pub(crate) fn columns(stored: &StoredText) -> (Option<&str>, Option<&str>, Option<&str>, Option<&str>) {
    match stored {
        StoredText::Plain { text } => (Some(text.as_str()), None, None, None),
        StoredText::Sealed { envelope } => (
            None,
            Some(envelope.ciphertext.as_str()),
            Some(envelope.wrapped_key.as_str()),
            Some(envelope.iv.as_str()),
        ),
    }
}

/// Rebuild a stored text from its four columns, starting at `first_idx`.
pub(crate) fn from_row(row: &rusqlite::Row<'_>, first_idx: usize) -> rusqlite::Result<StoredText> {
    let plain: Option<String> = row.get(first_idx)?;
    let ciphertext: Option<String> = row.get(first_idx + 1)?;
    let wrapped_key: Option<String> = row.get(first_idx + 2)?;
    let iv: Option<String> = row.get(first_idx + 3)?;

    match (plain, ciphertext, wrapped_key, iv) {
        (None, Some(ciphertext), Some(wrapped_key), Some(iv)) => Ok(StoredText::Sealed {
            envelope: Envelope {
                ciphertext,
                wrapped_key,
                iv,
            },
        }),
        (Some(text), None, None, None) => Ok(StoredText::Plain { text }),
        _ => Err(rusqlite::Error::FromSqlConversionFailure(
            first_idx,
            Type::Text,
            Box::new(SafewatchError::Internal("incomplete envelope columns".into())),
        )),
    }
}

#[cfg(test)]
mod tests {
    use safewatch_security::{KeyPairProvider, MemoryCustody};

    use super::*;

    #[test]
    fn missing_key_degrades_to_plaintext() {
        let custody = MemoryCustody::new();
        let (stored, degraded) =
            seal_or_degrade(&EnvelopeCrypto::new(), &custody, &IdentityId::new(), "help");
        assert!(degraded);
        assert_eq!(stored, StoredText::Plain { text: "help".into() });
    }

    #[test]
    fn known_key_seals() {
        let custody = MemoryCustody::new();
        let owner = IdentityId::new();
        let pair = KeyPairProvider::with_bits(1024).unwrap().generate().unwrap();
        custody.insert(owner, pair.public_key_pem, pair.private_key_pem).unwrap();

        let (stored, degraded) = seal_or_degrade(&EnvelopeCrypto::new(), &custody, &owner, "help");
        assert!(!degraded);
        assert!(stored.is_sealed());
        assert_eq!(columns(&stored).0, None);
    }
}
