//! Long-term identity keys and their passphrase-protected bundle.
//!
//! Every user owns an Ed25519 signing keypair and an X25519 encryption
//! keypair. The secret halves travel to the server only inside a
//! [`KeyBundle`]: Argon2id(passphrase) → XChaCha20-Poly1305 over
//! `{sign_sk_b64, enc_sk_b64, sign_pk_b64, enc_pk_b64}`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crypto_box::{PublicKey, SecretKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::aead::AeadEnvelope;
use crate::kdf::{derive_key, KdfParams};
use crate::keys::Salt;
use teamvault_common::{Error, Result};

/// Name of the only supported KDF.
pub const KDF_NAME: &str = "argon2id";

/// Public half of an identity, as published to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    pub sign_public_key: [u8; 32],
    pub enc_public_key: [u8; 32],
}

impl PublicIdentity {
    /// Encryption public key as a sealed-box recipient.
    pub fn enc_key(&self) -> PublicKey {
        PublicKey::from(self.enc_public_key)
    }

    /// Parse public keys received from the server.
    pub fn from_slices(sign_public_key: &[u8], enc_public_key: &[u8]) -> Result<Self> {
        let sign_public_key: [u8; 32] = sign_public_key
            .try_into()
            .map_err(|_| Error::InvalidInput("Signing public key must be 32 bytes".to_string()))?;
        let enc_public_key: [u8; 32] = enc_public_key.try_into().map_err(|_| {
            Error::InvalidInput("Encryption public key must be 32 bytes".to_string())
        })?;
        Ok(Self {
            sign_public_key,
            enc_public_key,
        })
    }
}

/// Decrypted identity keypairs. Secrets zeroize on drop.
pub struct IdentityKeys {
    sign: SigningKey,
    enc: SecretKey,
}

impl IdentityKeys {
    /// Generate fresh signing and encryption keypairs.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            sign: SigningKey::generate(&mut rng),
            enc: SecretKey::generate(&mut rng),
        }
    }

    /// Public halves.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            sign_public_key: self.sign.verifying_key().to_bytes(),
            enc_public_key: *self.enc.public_key().as_bytes(),
        }
    }

    /// Encryption public key.
    pub fn enc_public_key(&self) -> PublicKey {
        self.enc.public_key()
    }

    /// Encryption secret key.
    pub fn enc_secret_key(&self) -> &SecretKey {
        &self.enc
    }

    /// Produce a detached Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.sign.sign(message).to_bytes()
    }
}

impl fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKeys([REDACTED])")
    }
}

/// Verify a detached signature against a signing public key.
pub fn verify_signature(sign_public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let verifying = VerifyingKey::from_bytes(sign_public_key)
        .map_err(|_| Error::Crypto("Invalid signing public key".to_string()))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| Error::Crypto("Malformed signature".to_string()))?;
    verifying
        .verify(message, &signature)
        .map_err(|_| Error::Crypto("Signature verification failed".to_string()))
}

/// KDF section of a key bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfSpec {
    pub name: String,
    pub salt_b64: String,
    #[serde(flatten)]
    pub params: KdfParams,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct BundlePlaintext {
    sign_sk_b64: String,
    enc_sk_b64: String,
    sign_pk_b64: String,
    enc_pk_b64: String,
}

/// Passphrase-protected identity secrets: `{v, kdf, enc}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub v: u32,
    pub kdf: KdfSpec,
    pub enc: AeadEnvelope,
}

impl KeyBundle {
    /// Bundle format version written by this build.
    pub const VERSION: u32 = 1;

    /// Encrypt identity secrets under a passphrase.
    ///
    /// # Errors
    /// - Empty password or invalid KDF parameters
    pub fn seal(keys: &IdentityKeys, password: &[u8], params: &KdfParams) -> Result<Self> {
        let salt = Salt::generate();
        let master_key = derive_key(password, &salt, params)?;
        let public = keys.public();

        let plaintext = BundlePlaintext {
            sign_sk_b64: STANDARD.encode(keys.sign.to_bytes()),
            enc_sk_b64: STANDARD.encode(keys.enc.to_bytes()),
            sign_pk_b64: STANDARD.encode(public.sign_public_key),
            enc_pk_b64: STANDARD.encode(public.enc_public_key),
        };
        let json = Zeroizing::new(serde_json::to_vec(&plaintext)?);
        let enc = AeadEnvelope::seal(master_key.as_bytes(), &json, None)?;

        Ok(Self {
            v: Self::VERSION,
            kdf: KdfSpec {
                name: KDF_NAME.to_string(),
                salt_b64: salt.to_base64(),
                params: *params,
            },
            enc,
        })
    }

    /// Decrypt identity secrets.
    ///
    /// Every failure after the format checks (bad salt, bad parameters, KDF
    /// failure, AEAD failure, malformed or inconsistent plaintext) is reported
    /// as [`Error::Credential`].
    ///
    /// # Errors
    /// - `UnsupportedVersion` for a bundle newer than this build
    /// - `InvalidInput` for an unknown KDF
    /// - `Credential` otherwise
    pub fn open(&self, password: &[u8]) -> Result<IdentityKeys> {
        if self.v != Self::VERSION {
            return Err(Error::UnsupportedVersion {
                found: self.v,
                supported: Self::VERSION,
            });
        }
        if self.kdf.name != KDF_NAME {
            return Err(Error::InvalidInput(format!(
                "Unsupported KDF '{}'",
                self.kdf.name
            )));
        }

        self.open_inner(password).map_err(|_| Error::Credential)
    }

    fn open_inner(&self, password: &[u8]) -> Result<IdentityKeys> {
        let salt = Salt::from_base64(&self.kdf.salt_b64)?;
        let master_key = derive_key(password, &salt, &self.kdf.params)?;
        let json = Zeroizing::new(self.enc.open(master_key.as_bytes())?);
        let plaintext: BundlePlaintext = serde_json::from_slice(&json)?;

        let sign_sk = decode_32(&plaintext.sign_sk_b64)?;
        let enc_sk = decode_32(&plaintext.enc_sk_b64)?;
        let keys = IdentityKeys {
            sign: SigningKey::from_bytes(&sign_sk),
            enc: SecretKey::from(*enc_sk),
        };

        let public = keys.public();
        if *decode_32(&plaintext.sign_pk_b64)? != public.sign_public_key
            || *decode_32(&plaintext.enc_pk_b64)? != public.enc_public_key
        {
            return Err(Error::Crypto("Bundle public keys do not match secrets".to_string()));
        }
        Ok(keys)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn decode_32(encoded: &str) -> Result<Zeroizing<[u8; 32]>> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|e| Error::Serialization(e.to_string()))?,
    );
    let mut out = Zeroizing::new([0u8; 32]);
    if bytes.len() != 32 {
        return Err(Error::Serialization("Expected 32-byte key".to_string()));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams {
            iterations: 1,
            memory_size: 64,
            parallelism: 1,
            hash_length: 32,
        }
    }

    #[test]
    fn test_bundle_roundtrip() {
        let keys = IdentityKeys::generate();
        let bundle = KeyBundle::seal(&keys, b"CorrectHorse1", &fast()).unwrap();

        let opened = bundle.open(b"CorrectHorse1").unwrap();
        assert_eq!(opened.public(), keys.public());
    }

    #[test]
    fn test_wrong_password_is_credential_error() {
        let bundle = KeyBundle::seal(&IdentityKeys::generate(), b"CorrectHorse1", &fast()).unwrap();
        assert!(matches!(bundle.open(b"wrong-pass"), Err(Error::Credential)));
    }

    #[test]
    fn test_corrupt_salt_and_params_are_credential_errors() {
        let bundle = KeyBundle::seal(&IdentityKeys::generate(), b"pw", &fast()).unwrap();

        let mut bad_salt = bundle.clone();
        bad_salt.kdf.salt_b64 = "!!".to_string();
        assert!(matches!(bad_salt.open(b"pw"), Err(Error::Credential)));

        let mut bad_params = bundle.clone();
        bad_params.kdf.params.hash_length = 16;
        assert!(matches!(bad_params.open(b"pw"), Err(Error::Credential)));
    }

    #[test]
    fn test_bundle_wire_format() {
        let bundle = KeyBundle::seal(&IdentityKeys::generate(), b"pw", &fast()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&bundle.to_json().unwrap()).unwrap();

        assert_eq!(value["v"], 1);
        assert_eq!(value["kdf"]["name"], "argon2id");
        assert!(value["kdf"]["salt_b64"].is_string());
        assert_eq!(value["kdf"]["iterations"], 1);
        assert_eq!(value["kdf"]["memorySize"], 64);
        assert_eq!(value["kdf"]["parallelism"], 1);
        assert_eq!(value["kdf"]["hashLength"], 32);
        assert_eq!(value["enc"]["alg"], "xchacha20poly1305_ietf");
    }

    #[test]
    fn test_future_bundle_version_rejected() {
        let mut bundle = KeyBundle::seal(&IdentityKeys::generate(), b"pw", &fast()).unwrap();
        bundle.v = 2;
        assert!(matches!(
            bundle.open(b"pw"),
            Err(Error::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = IdentityKeys::generate();
        let public = keys.public();
        let signature = keys.sign(b"grant:v1:bob");

        verify_signature(&public.sign_public_key, b"grant:v1:bob", &signature).unwrap();
        assert!(verify_signature(&public.sign_public_key, b"grant:v1:eve", &signature).is_err());
    }

    #[test]
    fn test_public_identity_from_slices() {
        let public = IdentityKeys::generate().public();
        let parsed =
            PublicIdentity::from_slices(&public.sign_public_key, &public.enc_public_key).unwrap();
        assert_eq!(parsed, public);
        assert!(PublicIdentity::from_slices(&[0u8; 31], &public.enc_public_key).is_err());
    }
}
