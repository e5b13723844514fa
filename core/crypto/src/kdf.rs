//! Key derivation using Argon2id.
//!
//! Argon2id is a memory-hard password hashing function that provides
//! resistance to both GPU and time-memory trade-off attacks. Parameters are
//! persisted with the salt so that changing the defaults never orphans an
//! existing key bundle.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use teamvault_common::{Error, Result};

/// Upper bound on memory cost (4 GiB), so a hostile bundle cannot exhaust the host.
const MAX_MEMORY_KIB: u32 = 4 * 1024 * 1024;
const MAX_ITERATIONS: u32 = 64;
const MAX_PARALLELISM: u32 = 16;

/// Parameters for Argon2id key derivation.
///
/// Serialized with the field names of the persisted key bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    /// Number of passes over memory.
    pub iterations: u32,
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_size: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
    /// Output length in bytes.
    pub hash_length: u32,
}

impl KdfParams {
    /// Create parameters suitable for interactive use.
    ///
    /// These parameters provide a balance between security and usability,
    /// targeting approximately 0.5-1 second of derivation time.
    pub fn interactive() -> Self {
        Self {
            iterations: 3,
            memory_size: 65536, // 64 MiB
            parallelism: 4,
            hash_length: KEY_LENGTH as u32,
        }
    }

    /// Create parameters suitable for sensitive data.
    ///
    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self {
            iterations: 4,
            memory_size: 262144, // 256 MiB
            parallelism: 4,
            hash_length: KEY_LENGTH as u32,
        }
    }

    /// Create moderate parameters for mobile devices.
    pub fn moderate() -> Self {
        Self {
            iterations: 3,
            memory_size: 32768, // 32 MiB
            parallelism: 2,
            hash_length: KEY_LENGTH as u32,
        }
    }

    /// Look up a preset by name.
    pub fn from_preset(name: &str) -> Result<Self> {
        match name {
            "interactive" => Ok(Self::interactive()),
            "moderate" => Ok(Self::moderate()),
            "sensitive" => Ok(Self::sensitive()),
            other => Err(Error::InvalidInput(format!(
                "Unknown KDF preset '{}'. Use: interactive, moderate, or sensitive",
                other
            ))),
        }
    }

    /// Check the parameters are within the accepted range.
    pub fn validate(&self) -> Result<()> {
        if self.hash_length != KEY_LENGTH as u32 {
            return Err(Error::InvalidInput(format!(
                "KDF output length must be {}",
                KEY_LENGTH
            )));
        }
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(Error::InvalidInput("KDF iterations out of range".to_string()));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(Error::InvalidInput("KDF parallelism out of range".to_string()));
        }
        if self.memory_size < 8 * self.parallelism || self.memory_size > MAX_MEMORY_KIB {
            return Err(Error::InvalidInput("KDF memory size out of range".to_string()));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive a master key from a password and salt using Argon2id.
///
/// # Preconditions
/// - `password` must not be empty
/// - `params` must pass [`KdfParams::validate`]
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - Returns error if password is empty
/// - Returns error if Argon2id parameters are invalid or memory cannot be allocated
///
/// # Security
/// - Password is not stored or logged
/// - Memory is zeroized after derivation
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }
    params.validate()?;

    let argon2_params = Params::new(
        params.memory_size,
        params.iterations,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(password, salt.as_bytes(), &mut key_bytes)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(MasterKey::from_bytes(key_bytes))
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

    fn salt(byte: u8) -> Salt {
        Salt::from_bytes(vec![byte; 16]).unwrap()
    }

    #[test]
    fn test_derive_key_deterministic() {
        let password = b"test-password-123";
        let params = KdfParams::moderate();

        let key1 = derive_key(password, &salt(42), &params).unwrap();
        let key2 = derive_key(password, &salt(42), &params).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_salt() {
        let password = b"test-password-123";

        let key1 = derive_key(password, &salt(1), &fast()).unwrap();
        let key2 = derive_key(password, &salt(2), &fast()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_params() {
        let mut other = fast();
        other.iterations = 2;

        let key1 = derive_key(b"pw", &salt(9), &fast()).unwrap();
        let key2 = derive_key(b"pw", &salt(9), &other).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_empty_password_fails() {
        assert!(derive_key(b"", &Salt::generate(), &fast()).is_err());
    }

    #[test]
    fn test_out_of_range_params_rejected() {
        let mut params = fast();
        params.memory_size = u32::MAX;
        assert!(derive_key(b"pw", &salt(3), &params).is_err());

        let mut params = fast();
        params.hash_length = 64;
        assert!(params.validate().is_err());

        let mut params = fast();
        params.iterations = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_params_serialize_with_bundle_names() {
        let json = serde_json::to_value(KdfParams::interactive()).unwrap();
        assert_eq!(json["memorySize"], 65536);
        assert_eq!(json["hashLength"], 32);
        assert_eq!(json["iterations"], 3);
        assert_eq!(json["parallelism"], 4);
    }

    #[test]
    fn test_presets() {
        assert_eq!(KdfParams::from_preset("moderate").unwrap(), KdfParams::moderate());
        assert!(KdfParams::from_preset("turbo").is_err());
        for preset in [KdfParams::interactive(), KdfParams::moderate(), KdfParams::sensitive()] {
            preset.validate().unwrap();
        }
    }
}
