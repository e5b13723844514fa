//! Cryptographic primitives for TeamVault.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Identity keypairs (Ed25519 signing, X25519 encryption) and their
//!   passphrase-protected bundle
//! - Sealed-box wrapping of vault keys for a recipient
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod wrap;

pub use aead::AeadEnvelope;
pub use crypto_box::{PublicKey, SecretKey};
pub use identity::{verify_signature, IdentityKeys, KdfSpec, KeyBundle, PublicIdentity};
pub use kdf::{derive_key, KdfParams};
pub use keys::{MasterKey, Salt, VaultKey};
pub use wrap::{unwrap_key, wrap_key};
