//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation. Persisted
//! ciphertexts use [`AeadEnvelope`], a small versioned JSON record.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};
use serde::{Deserialize, Serialize};

use crate::keys::KEY_LENGTH;
use teamvault_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Algorithm label written into envelopes.
pub const ALGORITHM: &str = "xchacha20poly1305_ietf";

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Encrypt plaintext under a fresh random nonce.
///
/// # Postconditions
/// - Returns (nonce, ciphertext || tag)
/// - `associated_data` is authenticated but not encrypted
///
/// # Errors
/// - Returns error if key length is incorrect
pub fn encrypt(
    key: &[u8],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&nonce);

    let ciphertext = encrypt_with_nonce(key, &nonce_bytes, plaintext, associated_data)?;
    Ok((nonce_bytes, ciphertext))
}

/// Encrypt plaintext with a specific nonce.
///
/// # Warning
/// Using the same nonce twice with the same key completely breaks security.
/// Only [`encrypt`] should be used for persisted data.
pub fn encrypt_with_nonce(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
}

/// Decrypt and authenticate ciphertext.
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if ciphertext is too short
/// - Returns error if authentication fails (tampered data, wrong key or wrong associated data)
pub fn decrypt(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Crypto("Decryption failed".to_string()))
}

/// Versioned AEAD record: `{v, alg, nonce_b64, cipher_b64, ad_b64?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeadEnvelope {
    pub v: u32,
    pub alg: String,
    pub nonce_b64: String,
    pub cipher_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_b64: Option<String>,
}

impl AeadEnvelope {
    /// Envelope format version written by this build.
    pub const VERSION: u32 = 1;

    /// Encrypt `plaintext`, optionally binding `associated_data`.
    pub fn seal(key: &[u8], plaintext: &[u8], associated_data: Option<&[u8]>) -> Result<Self> {
        let (nonce, ciphertext) = encrypt(key, plaintext, associated_data.unwrap_or_default())?;
        Ok(Self {
            v: Self::VERSION,
            alg: ALGORITHM.to_string(),
            nonce_b64: STANDARD.encode(nonce),
            cipher_b64: STANDARD.encode(ciphertext),
            ad_b64: associated_data.map(|ad| STANDARD.encode(ad)),
        })
    }

    /// Decode the associated data carried by the envelope.
    pub fn associated_data(&self) -> Result<Option<Vec<u8>>> {
        self.ad_b64
            .as_deref()
            .map(|ad| {
                STANDARD
                    .decode(ad)
                    .map_err(|e| Error::Serialization(format!("Invalid associated data: {}", e)))
            })
            .transpose()
    }

    /// Authenticate and decrypt.
    ///
    /// # Errors
    /// - `UnsupportedVersion` if the envelope is newer than this build
    /// - `Crypto` on unknown algorithm, malformed fields or authentication failure
    pub fn open(&self, key: &[u8]) -> Result<Vec<u8>> {
        if self.v != Self::VERSION {
            return Err(Error::UnsupportedVersion {
                found: self.v,
                supported: Self::VERSION,
            });
        }
        if self.alg != ALGORITHM {
            return Err(Error::Crypto(format!("Unsupported algorithm '{}'", self.alg)));
        }

        let nonce_bytes = STANDARD
            .decode(&self.nonce_b64)
            .map_err(|_| Error::Crypto("Malformed nonce".to_string()))?;
        let nonce: [u8; NONCE_SIZE] = nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("Malformed nonce".to_string()))?;
        let ciphertext = STANDARD
            .decode(&self.cipher_b64)
            .map_err(|_| Error::Crypto("Malformed ciphertext".to_string()))?;
        let associated_data = self
            .associated_data()
            .map_err(|_| Error::Crypto("Malformed associated data".to_string()))?
            .unwrap_or_default();

        decrypt(key, &nonce, &ciphertext, &associated_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Hello, World!";

        let (nonce, ciphertext) = encrypt(&key, plaintext, b"").unwrap();
        let decrypted = decrypt(&key, &nonce, &ciphertext, b"").unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_ciphertext_size() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Test message";

        let (_, ciphertext) = encrypt(&key, plaintext, b"").unwrap();

        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);
    }

    #[test]
    fn test_different_nonce_each_time() {
        let key = [42u8; KEY_LENGTH];

        let (n1, ct1) = encrypt(&key, b"Same plaintext", b"").unwrap();
        let (n2, ct2) = encrypt(&key, b"Same plaintext", b"").unwrap();

        assert_ne!(n1, n2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (nonce, ciphertext) = encrypt(&[1u8; KEY_LENGTH], b"Secret data", b"").unwrap();
        assert!(decrypt(&[2u8; KEY_LENGTH], &nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_wrong_associated_data_fails() {
        let key = [5u8; KEY_LENGTH];
        let (nonce, ciphertext) = encrypt(&key, b"data", b"vault:a").unwrap();
        assert!(decrypt(&key, &nonce, &ciphertext, b"vault:b").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_LENGTH];

        let (nonce, mut ciphertext) = encrypt(&key, b"Important data", b"").unwrap();
        ciphertext[5] ^= 0xFF;

        assert!(decrypt(&key, &nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(encrypt(&[0u8; 16], b"data", b"").is_err());
    }

    #[test]
    fn test_encrypt_with_nonce_is_deterministic() {
        let key = [42u8; KEY_LENGTH];
        let nonce = [1u8; NONCE_SIZE];

        let ct1 = encrypt_with_nonce(&key, &nonce, b"Deterministic", b"").unwrap();
        let ct2 = encrypt_with_nonce(&key, &nonce, b"Deterministic", b"").unwrap();

        assert_eq!(ct1, ct2);
        assert_eq!(decrypt(&key, &nonce, &ct1, b"").unwrap(), b"Deterministic");
    }

    #[test]
    fn test_envelope_roundtrip_with_ad() {
        let key = [9u8; KEY_LENGTH];
        let envelope = AeadEnvelope::seal(&key, b"payload", Some(b"ctx")).unwrap();

        assert_eq!(envelope.v, 1);
        assert_eq!(envelope.alg, ALGORITHM);
        assert_eq!(envelope.associated_data().unwrap().unwrap(), b"ctx");
        assert_eq!(envelope.open(&key).unwrap(), b"payload");
    }

    #[test]
    fn test_envelope_without_ad_omits_field() {
        let envelope = AeadEnvelope::seal(&[9u8; KEY_LENGTH], b"payload", None).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("ad_b64").is_none());
        assert!(json.get("nonce_b64").is_some());
    }

    #[test]
    fn test_envelope_swapped_ad_fails() {
        let key = [9u8; KEY_LENGTH];
        let mut envelope = AeadEnvelope::seal(&key, b"payload", Some(b"vault:a")).unwrap();
        envelope.ad_b64 = Some(STANDARD.encode(b"vault:b"));
        assert!(envelope.open(&key).is_err());
    }

    #[test]
    fn test_envelope_future_version_rejected() {
        let key = [9u8; KEY_LENGTH];
        let mut envelope = AeadEnvelope::seal(&key, b"payload", None).unwrap();
        envelope.v = 2;
        assert!(matches!(
            envelope.open(&key),
            Err(Error::UnsupportedVersion { found: 2, supported: 1 })
        ));
    }

    #[test]
    fn test_envelope_unknown_algorithm_rejected() {
        let key = [9u8; KEY_LENGTH];
        let mut envelope = AeadEnvelope::seal(&key, b"payload", None).unwrap();
        envelope.alg = "aes256gcm".to_string();
        assert!(envelope.open(&key).is_err());
    }
}
