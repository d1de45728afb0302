//! Field-level encryption for per-user SQLite columns.
//!
//! Any column whose name begins with `encrypted__` is ciphertext at rest.
//! The key is derived deterministically from the user id
//! (`SHA-256("userdata_encryption_" + user_id)`), so no key material is
//! stored next to the data. AES-256-GCM with a random 12-byte nonce,
//! base64-wrapped with a version prefix.
//!
//! Plaintext fallback is explicit at the type level: [`StoredField`]
//! distinguishes encrypted payloads from legacy plaintext rows written
//! before encryption was enabled, instead of hiding the difference in a
//! decrypt-and-hope path.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Error, Result};

/// Version prefix identifying encrypted field payloads.
const FIELD_PREFIX: &str = "mira1:";

/// Nonce size for AES-256-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// A field value as read from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredField {
    /// Versioned AES-256-GCM payload.
    Encrypted(String),
    /// Legacy plaintext written before encryption (migration path).
    Plaintext(String),
}

impl StoredField {
    /// Classifies a raw stored string.
    #[must_use]
    pub fn classify(raw: &str) -> Self {
        if raw.starts_with(FIELD_PREFIX) {
            Self::Encrypted(raw.to_string())
        } else {
            Self::Plaintext(raw.to_string())
        }
    }
}

/// Per-user field encryptor.
pub struct FieldEncryptor {
    cipher: Aes256Gcm,
}

impl FieldEncryptor {
    /// Derives the user's field key and builds the cipher.
    #[must_use]
    pub fn for_user(user_id: Uuid) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"userdata_encryption_");
        hasher.update(user_id.to_string().as_bytes());
        let digest = hasher.finalize();

        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypts a field value into the versioned wire form.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::op("field_encrypt", "AES-GCM encryption failed"))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);

        Ok(format!("{FIELD_PREFIX}{}", BASE64.encode(payload)))
    }

    /// Decrypts a stored field.
    ///
    /// Plaintext fallbacks pass through unchanged; they are re-encrypted on
    /// the next write.
    pub fn decrypt(&self, field: &StoredField) -> Result<String> {
        match field {
            StoredField::Plaintext(value) => Ok(value.clone()),
            StoredField::Encrypted(wire) => {
                let encoded = wire
                    .strip_prefix(FIELD_PREFIX)
                    .ok_or_else(|| Error::op("field_decrypt", "missing version prefix"))?;
                let payload = BASE64
                    .decode(encoded)
                    .map_err(|e| Error::op("field_decrypt", format!("bad base64: {e}")))?;
                if payload.len() <= NONCE_SIZE {
                    return Err(Error::op("field_decrypt", "payload too short"));
                }

                let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
                let nonce = Nonce::from_slice(nonce_bytes);
                let plaintext = self
                    .cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|_| Error::op("field_decrypt", "AES-GCM authentication failed"))?;

                String::from_utf8(plaintext)
                    .map_err(|e| Error::op("field_decrypt", format!("invalid UTF-8: {e}")))
            }
        }
    }

    /// Decrypts a raw stored string, classifying it first.
    pub fn decrypt_raw(&self, raw: &str) -> Result<String> {
        self.decrypt(&StoredField::classify(raw))
    }
}

/// Whether a column participates in field encryption.
#[must_use]
pub fn is_encrypted_column(column: &str) -> bool {
    column.starts_with("encrypted__")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let encryptor = FieldEncryptor::for_user(Uuid::new_v4());
        let wire = encryptor.encrypt("the user's secret note").unwrap();
        assert!(wire.starts_with(FIELD_PREFIX));
        assert_eq!(encryptor.decrypt_raw(&wire).unwrap(), "the user's secret note");
    }

    #[test]
    fn test_plaintext_fallback_passes_through() {
        let encryptor = FieldEncryptor::for_user(Uuid::new_v4());
        assert_eq!(
            encryptor.decrypt_raw("legacy plaintext value").unwrap(),
            "legacy plaintext value"
        );
    }

    #[test]
    fn test_key_is_per_user() {
        let user_a = FieldEncryptor::for_user(Uuid::new_v4());
        let user_b = FieldEncryptor::for_user(Uuid::new_v4());
        let wire = user_a.encrypt("private").unwrap();
        assert!(user_b.decrypt_raw(&wire).is_err());
    }

    #[test]
    fn test_key_is_deterministic() {
        let user = Uuid::new_v4();
        let wire = FieldEncryptor::for_user(user).encrypt("stable").unwrap();
        // A fresh encryptor for the same user decrypts it.
        assert_eq!(
            FieldEncryptor::for_user(user).decrypt_raw(&wire).unwrap(),
            "stable"
        );
    }

    #[test]
    fn test_nonce_varies() {
        let encryptor = FieldEncryptor::for_user(Uuid::new_v4());
        let a = encryptor.encrypt("same input").unwrap();
        let b = encryptor.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let encryptor = FieldEncryptor::for_user(Uuid::new_v4());
        let wire = encryptor.encrypt("integrity").unwrap();
        let mut tampered = wire.clone();
        tampered.pop();
        tampered.push('A');
        assert!(encryptor.decrypt_raw(&tampered).is_err());
    }

    #[test]
    fn test_column_predicate() {
        assert!(is_encrypted_column("encrypted__content"));
        assert!(!is_encrypted_column("content"));
    }
}
