// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Envelope encryption of free text under an identity's RSA key pair.
//
// Each call mints a fresh 256-bit data key and a fresh 128-bit IV. The text
// is sealed with AES-256-GCM (16-byte nonce, tag appended to the ciphertext)
// and the data key is wrapped with RSA-OAEP, SHA-256 for both the OAEP hash
// and MGF1. The three artifacts travel as base64 text in an `Envelope`.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::Oaep;
use safewatch_core::error::{Result, SafewatchError};
use safewatch_core::types::Envelope;
use sha2::Sha256;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::keys::{parse_private_key, parse_public_key};

/// Data key length in bytes (AES-256).
pub const DATA_KEY_LEN: usize = 32;

/// IV length in bytes.
pub const IV_LEN: usize = 16;

/// AES-256-GCM with a 128-bit nonce.
type DataCipher = AesGcm<Aes256, U16>;

/// Stateless hybrid encryptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCrypto;

impl EnvelopeCrypto {
    pub fn new() -> Self {
        Self
    }

    /// Seal `plaintext` for the holder of the private key matching
    /// `recipient_public_key_pem`.
    #[instrument(skip_all, fields(plaintext_len = plaintext.len()))]
    pub fn encrypt(&self, plaintext: &str, recipient_public_key_pem: &str) -> Result<Envelope> {
        if plaintext.is_empty() {
            return Err(SafewatchError::Input("refusing to encrypt empty text".into()));
        }

        let public = parse_public_key(recipient_public_key_pem)?;

        let mut data_key = Zeroizing::new([0u8; DATA_KEY_LEN]);
        OsRng.fill_bytes(&mut data_key[..]);
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = DataCipher::new(GenericArray::from_slice(&data_key[..]));
        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&iv[..]), plaintext.as_bytes())
            .map_err(|_| SafewatchError::Encryption("symmetric seal failed".into()))?;

        let wrapped_key = public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &data_key[..])
            .map_err(|e| SafewatchError::Encryption(format!("key wrap failed: {e}")))?;

        debug!(ciphertext_len = ciphertext.len(), "text sealed");
        Ok(Envelope {
            ciphertext: BASE64.encode(ciphertext),
            wrapped_key: BASE64.encode(wrapped_key),
            iv: BASE64.encode(iv),
        })
    }

    /// Open an envelope with the recipient's PKCS#8 private key.
    ///
    /// Fails with `Unwrap` when the data key cannot be recovered (wrong or
    /// corrupted key material) and with `Decryption` when the ciphertext or
    /// IV does not authenticate.
    #[instrument(skip_all, fields(ciphertext_len = envelope.ciphertext.len()))]
    pub fn decrypt(&self, envelope: &Envelope, recipient_private_key_pem: &str) -> Result<String> {
        let private = parse_private_key(recipient_private_key_pem)?;

        let wrapped_key = BASE64
            .decode(envelope.wrapped_key.trim())
            .map_err(|e| SafewatchError::Unwrap(format!("wrapped key encoding: {e}")))?;
        let data_key = Zeroizing::new(
            private
                .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
                .map_err(|_| SafewatchError::Unwrap("data key did not unwrap".into()))?,
        );
        if data_key.len() != DATA_KEY_LEN {
            return Err(SafewatchError::Unwrap(format!(
                "unwrapped key is {} bytes, expected {DATA_KEY_LEN}",
                data_key.len()
            )));
        }

        let iv = BASE64
            .decode(envelope.iv.trim())
            .map_err(|e| SafewatchError::Decryption(format!("IV encoding: {e}")))?;
        if iv.len() != IV_LEN {
            return Err(SafewatchError::Decryption(format!(
                "IV is {} bytes, expected {IV_LEN}",
                iv.len()
            )));
        }
        let ciphertext = BASE64
            .decode(envelope.ciphertext.trim())
            .map_err(|e| SafewatchError::Decryption(format!("ciphertext encoding: {e}")))?;

        let cipher = DataCipher::new(GenericArray::from_slice(&data_key[..]));
        let plaintext = cipher
            .decrypt(GenericArray::from_slice(&iv[..]), ciphertext.as_slice())
            .map_err(|_| SafewatchError::Decryption("ciphertext failed authentication".into()))?;

        let text = String::from_utf8(plaintext)
            .map_err(|_| SafewatchError::Decryption("plaintext is not UTF-8".into()))?;

        debug!(plaintext_len = text.len(), "text opened");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use super::*;
    use crate::keys::{KeyPair, KeyPairProvider, MIN_KEY_BITS};

    /// Key generation dominates test time, so two pairs are shared.
    fn pairs() -> &'static (KeyPair, KeyPair) {
        static PAIRS: OnceLock<(KeyPair, KeyPair)> = OnceLock::new();
        PAIRS.get_or_init(|| {
            let provider = KeyPairProvider::with_bits(MIN_KEY_BITS).unwrap();
            (provider.generate().unwrap(), provider.generate().unwrap())
        })
    }

    #[test]
    fn round_trip() {
        let (pair, _) = pairs();
        let crypto = EnvelopeCrypto::new();
        let message = "Intruder at 14 Elm Street, back door forced, please hurry";

        let envelope = crypto.encrypt(message, &pair.public_key_pem).expect("encrypt");
        assert!(!envelope.ciphertext.contains("Intruder"));

        let opened = crypto.decrypt(&envelope, &pair.private_key_pem).expect("decrypt");
        assert_eq!(opened, message);
    }

    #[test]
    fn artifacts_have_expected_sizes() {
        let (pair, _) = pairs();
        let envelope = EnvelopeCrypto::new().encrypt("help", &pair.public_key_pem).unwrap();

        assert_eq!(BASE64.decode(&envelope.iv).unwrap().len(), IV_LEN);
        assert_eq!(BASE64.decode(&envelope.wrapped_key).unwrap().len(), MIN_KEY_BITS / 8);
        // Four bytes of text plus the 16-byte tag.
        assert_eq!(BASE64.decode(&envelope.ciphertext).unwrap().len(), 4 + 16);
    }

    #[test]
    fn fresh_key_material_every_call() {
        let (pair, _) = pairs();
        let crypto = EnvelopeCrypto::new();
        let a = crypto.encrypt("same text", &pair.public_key_pem).unwrap();
        let b = crypto.encrypt("same text", &pair.public_key_pem).unwrap();

        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.wrapped_key, b.wrapped_key);
    }

    #[test]
    fn empty_plaintext_is_rejected() {
        let (pair, _) = pairs();
        let result = EnvelopeCrypto::new().encrypt("", &pair.public_key_pem);
        assert!(matches!(result, Err(SafewatchError::Input(_))));
    }

    #[test]
    fn wrong_private_key_never_yields_plaintext() {
        let (alice, mallory) = pairs();
        let crypto = EnvelopeCrypto::new();
        let envelope = crypto.encrypt("for alice only", &alice.public_key_pem).unwrap();

        match crypto.decrypt(&envelope, &mallory.private_key_pem) {
            Err(SafewatchError::Unwrap(_)) | Err(SafewatchError::Decryption(_)) => {}
            other => panic!("expected unwrap/decryption failure, got {other:?}"),
        }
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (pair, _) = pairs();
        let crypto = EnvelopeCrypto::new();
        let mut envelope = crypto.encrypt("tamper with me", &pair.public_key_pem).unwrap();

        let mut bytes = BASE64.decode(&envelope.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        envelope.ciphertext = BASE64.encode(bytes);

        assert!(matches!(
            crypto.decrypt(&envelope, &pair.private_key_pem),
            Err(SafewatchError::Decryption(_))
        ));
    }

    #[test]
    fn swapped_iv_fails_authentication() {
        let (pair, _) = pairs();
        let crypto = EnvelopeCrypto::new();
        let a = crypto.encrypt("first", &pair.public_key_pem).unwrap();
        let b = crypto.encrypt("second", &pair.public_key_pem).unwrap();
        let mixed = Envelope { iv: b.iv, ..a };

        assert!(matches!(
            crypto.decrypt(&mixed, &pair.private_key_pem),
            Err(SafewatchError::Decryption(_))
        ));
    }

    #[test]
    fn corrupted_wrapped_key_fails_unwrap() {
        let (pair, _) = pairs();
        let crypto = EnvelopeCrypto::new();
        let mut envelope = crypto.encrypt("payload", &pair.public_key_pem).unwrap();
        envelope.wrapped_key = "not base64 at all!".into();

        assert!(matches!(
            crypto.decrypt(&envelope, &pair.private_key_pem),
            Err(SafewatchError::Unwrap(_))
        ));
    }

    #[test]
    fn garbage_public_key_is_an_input_error() {
        let result = EnvelopeCrypto::new().encrypt("hello", "-----BEGIN PUBLIC KEY-----\nnope\n");
        assert!(matches!(result, Err(SafewatchError::Input(_))));
    }
}
