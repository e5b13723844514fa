//! Common error types for TeamVault.

use thiserror::Error;

/// Top-level error type for TeamVault operations.
///
/// The first five variants form the recovery taxonomy: each one maps to a
/// distinct policy (no retry, one re-fetch, skip the vault, surface, abort).
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong passphrase, missing identity or tampered key bundle.
    ///
    /// Always rendered with the same message so callers cannot tell the cases apart.
    #[error("Incorrect credentials")]
    Credential,

    /// A sealed key could not be opened with the caller's keypair.
    #[error("Key mismatch: {0}")]
    KeyMismatch(String),

    /// AEAD failure while opening a vault snapshot.
    #[error("Snapshot for vault {vault_id} is corrupt: {reason}")]
    SnapshotCorrupt { vault_id: String, reason: String },

    /// Network or storage failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Revoked/expired session or insufficient role.
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A versioned payload is newer than this build understands.
    #[error("Unsupported format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A member was revoked but the key rotation that should follow failed.
    ///
    /// The revocation stands; the member can still open anything sealed
    /// under the old key until a rotation succeeds.
    #[error("Member {member} was revoked but the team key was not rotated: {reason}")]
    RevokedWithoutRotation { member: String, reason: String },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is transient.
    ///
    /// Only the event stream reconnect loop acts on this; snapshot saves never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }

    /// Whether the failure came from authentication or authorization.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Credential | Error::Authorization(_))
    }

    /// Shorthand for a snapshot failure on a given vault.
    pub fn snapshot_corrupt(vault_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SnapshotCorrupt {
            vault_id: vault_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
