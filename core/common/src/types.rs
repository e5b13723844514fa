//! Common types used throughout TeamVault.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroize;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an id from a string.
            ///
            /// # Errors
            /// - Returns error if id is empty or longer than 128 bytes
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.is_empty() {
                    return Err(crate::Error::InvalidInput(
                        concat!($label, " cannot be empty").to_string(),
                    ));
                }
                if id.len() > 128 {
                    return Err(crate::Error::InvalidInput(
                        concat!($label, " is too long").to_string(),
                    ));
                }
                Ok(Self(id))
            }

            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Unique identifier for a vault.
    VaultId,
    "VaultId"
);
string_id!(
    /// Unique identifier for a user.
    UserId,
    "UserId"
);
string_id!(
    /// Unique identifier for a team.
    TeamId,
    "TeamId"
);
string_id!(
    /// Server-assigned identifier of an uploaded blob.
    BlobId,
    "BlobId"
);

/// Generation counter of a vault or team key.
pub type KeyEpoch = u32;

/// Kind of vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultKind {
    Personal,
    Team,
}

/// Role of a user inside a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Viewer,
    Editor,
    Admin,
    Owner,
}

impl TeamRole {
    /// Whether this role may upload snapshots to the team vault.
    pub fn can_write(&self) -> bool {
        *self >= TeamRole::Editor
    }

    /// Whether this role may invite, remove members and rotate the team key.
    pub fn can_manage(&self) -> bool {
        *self >= TeamRole::Admin
    }

    /// Permission conferred on the team vault.
    pub fn permission(&self) -> Permission {
        if self.can_write() {
            Permission::Write
        } else {
            Permission::Read
        }
    }
}

/// Access level carried by a share grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
}

/// Sealed-box ciphertext of a symmetric key, addressed to one recipient.
///
/// Opaque to the server. Serialized as standard base64.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey(Vec<u8>);

impl WrappedKey {
    /// Wrap raw sealed bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the sealed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode as base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Decode from base64.
    pub fn from_base64(encoded: &str) -> crate::Result<Self> {
        STANDARD
            .decode(encoded)
            .map(Self)
            .map_err(|e| crate::Error::Serialization(format!("Invalid wrapped key: {}", e)))
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedKey({} bytes)", self.0.len())
    }
}

impl Serialize for WrappedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for WrappedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// BLAKE2b-256 digest of a blob, unpadded base64.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash a blob.
    pub fn of(bytes: &[u8]) -> Self {
        use blake2::digest::consts::U32;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(bytes);
        Self(STANDARD_NO_PAD.encode(hasher.finalize()))
    }

    /// Wrap a hash string received from a client.
    pub fn from_string(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Check that `bytes` hash to this value.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Self::of(bytes) == *self
    }

    /// Get the encoded digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SensitiveBytes {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_id_creation() {
        let id = VaultId::new("test-vault").unwrap();
        assert_eq!(id.as_str(), "test-vault");
    }

    #[test]
    fn test_ids_reject_empty() {
        assert!(VaultId::new("").is_err());
        assert!(UserId::new("").is_err());
        assert!(TeamId::new("x".repeat(200)).is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(TeamId::generate(), TeamId::generate());
    }

    #[test]
    fn test_role_ordering() {
        assert!(TeamRole::Owner.can_manage());
        assert!(TeamRole::Admin.can_manage());
        assert!(!TeamRole::Editor.can_manage());
        assert!(TeamRole::Editor.can_write());
        assert!(!TeamRole::Viewer.can_write());
        assert_eq!(TeamRole::Viewer.permission(), Permission::Read);
    }

    #[test]
    fn test_wrapped_key_json_is_base64() {
        let key = WrappedKey::from_bytes(vec![1, 2, 3, 250]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"AQID+g==\"");
        let back: WrappedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_content_hash_detects_change() {
        let hash = ContentHash::of(b"blob");
        assert!(hash.matches(b"blob"));
        assert!(!hash.matches(b"blob!"));
    }

    #[test]
    fn test_sensitive_bytes_debug_redacts() {
        let secret = SensitiveBytes::from("hunter2");
        assert_eq!(format!("{:?}", secret), "SensitiveBytes([REDACTED; 7 bytes])");
    }
}
