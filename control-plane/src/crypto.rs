//! PBKDF2-HMAC-SHA256 key derivation plus
//! AES-256-GCM for encrypting provider credentials and TOTP secrets at
//! rest. Salts are fixed and domain-separated per use rather than random:
//! the goal is a deterministic per-purpose key, not a per-secret one.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{EngineError, Result};

const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

pub enum KeyDomain {
    TotpEncryption,
    CertCredential,
}

impl KeyDomain {
    fn salt(&self) -> &'static [u8] {
        match self {
            KeyDomain::TotpEncryption => b"totp-encryption-salt",
            KeyDomain::CertCredential => b"cert-credential-salt",
        }
    }
}

#[derive(Clone)]
pub struct CredCrypto {
    /// The long-term secret (e.g. the `jwt_secret` setting) everything is
    /// derived from.
    master_secret: String,
}

impl CredCrypto {
    pub fn new(master_secret: impl Into<String>) -> Self {
        Self {
            master_secret: master_secret.into(),
        }
    }

    fn derive_key(&self, domain: KeyDomain) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2::<Hmac<Sha256>>(
            self.master_secret.as_bytes(),
            domain.salt(),
            PBKDF2_ITERATIONS,
            &mut key,
        )
        .expect("32-byte output is always valid for HMAC-SHA256");
        key
    }

    /// JSON-serializes `payload`, encrypts it, and returns the
    /// `iv(16):tag(16):ct` hex envelope.
    pub fn encrypt<T: serde::Serialize>(&self, domain: KeyDomain, payload: &T) -> Result<String> {
        let plaintext = serde_json::to_vec(payload)?;
        let key_bytes = self.derive_key(domain);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ct_and_tag = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| EngineError::Internal(format!("encryption failed: {e}")))?;
        // aes-gcm appends the 16-byte tag to the ciphertext.
        let (ct, tag) = ct_and_tag.split_at(ct_and_tag.len() - TAG_LEN);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(tag),
            hex::encode(ct)
        ))
    }

    /// Parses the `iv:tag:ct` envelope and decrypts it back to `T`.
    /// Rejects any payload that doesn't split into exactly three hex
    /// fields.
    pub fn decrypt<T: serde::de::DeserializeOwned>(
        &self,
        domain: KeyDomain,
        envelope: &str,
    ) -> Result<T> {
        let parts: Vec<&str> = envelope.split(':').collect();
        if parts.len() != 3 {
            return Err(EngineError::InvalidInput(
                "credential envelope must have exactly three hex fields".into(),
            ));
        }
        let iv = hex::decode(parts[0])
            .map_err(|e| EngineError::InvalidInput(format!("invalid iv hex: {e}")))?;
        let tag = hex::decode(parts[1])
            .map_err(|e| EngineError::InvalidInput(format!("invalid tag hex: {e}")))?;
        let ct = hex::decode(parts[2])
            .map_err(|e| EngineError::InvalidInput(format!("invalid ciphertext hex: {e}")))?;
        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(EngineError::InvalidInput(
                "credential envelope field lengths are invalid".into(),
            ));
        }

        let key_bytes = self.derive_key(domain);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&iv);

        let mut ct_and_tag = ct;
        ct_and_tag.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(nonce, ct_and_tag.as_ref())
            .map_err(|_| EngineError::InvalidInput("credential decryption failed".into()))?;

        serde_json::from_slice(&plaintext).map_err(EngineError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        api_key: String,
        secret: String,
    }

    #[test]
    fn round_trips_through_encrypt_decrypt() {
        let crypto = CredCrypto::new("super-secret-value");
        let payload = Payload {
            api_key: "k-123".into(),
            secret: "s-456".into(),
        };
        let envelope = crypto.encrypt(KeyDomain::CertCredential, &payload).unwrap();
        let parts: Vec<&str> = envelope.split(':').collect();
        assert_eq!(parts.len(), 3);
        let back: Payload = crypto.decrypt(KeyDomain::CertCredential, &envelope).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let crypto = CredCrypto::new("super-secret-value");
        let payload = Payload {
            api_key: "k".into(),
            secret: "s".into(),
        };
        let mut envelope = crypto.encrypt(KeyDomain::CertCredential, &payload).unwrap();
        let last = envelope.pop().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        envelope.push(flipped);
        let result: Result<Payload> = crypto.decrypt(KeyDomain::CertCredential, &envelope);
        assert!(result.is_err());
    }

    #[test]
    fn envelope_must_have_exactly_three_fields() {
        let crypto = CredCrypto::new("secret");
        let result: Result<Payload> = crypto.decrypt(KeyDomain::CertCredential, "aa:bb");
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn domains_derive_different_keys() {
        let crypto = CredCrypto::new("secret");
        assert_ne!(
            crypto.derive_key(KeyDomain::TotpEncryption),
            crypto.derive_key(KeyDomain::CertCredential)
        );
    }
}
