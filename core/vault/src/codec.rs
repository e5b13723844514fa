//! Snapshot blob encoding.
//!
//! Blob layout: `{v:1, kind:"vault_snapshot", enc:<AeadEnvelope>}`. The
//! envelope's associated data is `vault:{vault_id}:epoch:{epoch}`, so a blob
//! replayed into another vault or key epoch is rejected.

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use teamvault_common::{Error, KeyEpoch, Result, VaultId};
use teamvault_crypto::{AeadEnvelope, VaultKey};

use crate::model::Snapshot;

/// `kind` marker of snapshot blobs.
pub const SNAPSHOT_KIND: &str = "vault_snapshot";

/// Outer blob format version written by this build.
pub const BLOB_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct BlobHeader {
    v: u32,
    kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotBlob {
    v: u32,
    kind: String,
    enc: AeadEnvelope,
}

/// Associated data binding a blob to one vault and key epoch.
pub fn associated_data(vault_id: &VaultId, epoch: KeyEpoch) -> Vec<u8> {
    format!("vault:{}:epoch:{}", vault_id, epoch).into_bytes()
}

/// Encrypts and decrypts vault snapshots.
pub struct SnapshotCodec;

impl SnapshotCodec {
    /// Serialize and encrypt a snapshot.
    ///
    /// # Preconditions
    /// - `snapshot` passes [`Snapshot::validate`]
    pub fn encrypt(key: &VaultKey, snapshot: &Snapshot, associated_data: Option<&[u8]>) -> Result<Vec<u8>> {
        snapshot.validate()?;
        let plaintext = Zeroizing::new(serde_json::to_vec(snapshot)?);
        let blob = SnapshotBlob {
            v: BLOB_VERSION,
            kind: SNAPSHOT_KIND.to_string(),
            enc: AeadEnvelope::seal(key.as_bytes(), &plaintext, associated_data)?,
        };
        Ok(serde_json::to_vec(&blob)?)
    }

    /// Decrypt and validate a snapshot blob.
    ///
    /// # Errors
    /// - `UnsupportedVersion` if the blob or its payload is from a newer format
    /// - `Serialization` if the blob is not a snapshot blob
    /// - `Crypto` if the associated data differs from `expected_associated_data`
    ///   or authentication fails
    /// - `InvalidInput` if the decrypted payload fails validation
    pub fn decrypt(
        key: &VaultKey,
        blob: &[u8],
        expected_associated_data: Option<&[u8]>,
    ) -> Result<Snapshot> {
        // Version gate before anything else is parsed.
        let header: BlobHeader = serde_json::from_slice(blob)?;
        if header.v != BLOB_VERSION {
            return Err(Error::UnsupportedVersion {
                found: header.v,
                supported: BLOB_VERSION,
            });
        }
        if header.kind != SNAPSHOT_KIND {
            return Err(Error::Serialization(format!(
                "expected a {} blob, found '{}'",
                SNAPSHOT_KIND, header.kind
            )));
        }

        let blob: SnapshotBlob = serde_json::from_slice(blob)?;
        if let Some(expected) = expected_associated_data {
            if blob.enc.associated_data()?.as_deref() != Some(expected) {
                return Err(Error::Crypto("associated data mismatch".to_string()));
            }
        }

        let plaintext = Zeroizing::new(blob.enc.open(key.as_bytes())?);
        let snapshot: Snapshot = serde_json::from_slice(&plaintext)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Encrypt a snapshot bound to `vault_id` at `epoch`.
    pub fn seal_for(
        vault_id: &VaultId,
        epoch: KeyEpoch,
        key: &VaultKey,
        snapshot: &Snapshot,
    ) -> Result<Vec<u8>> {
        Self::encrypt(key, snapshot, Some(&associated_data(vault_id, epoch)))
    }

    /// Decrypt the latest blob of `vault_id`.
    ///
    /// Authentication, binding and payload failures all become
    /// `SnapshotCorrupt` for that vault; a newer format stays
    /// `UnsupportedVersion`.
    pub fn open_for(
        vault_id: &VaultId,
        epoch: KeyEpoch,
        key: &VaultKey,
        blob: &[u8],
    ) -> Result<Snapshot> {
        Self::decrypt(key, blob, Some(&associated_data(vault_id, epoch))).map_err(|e| match e {
            Error::UnsupportedVersion { .. } => e,
            other => {
                debug!(vault = %vault_id, error = %other, "snapshot failed to open");
                Error::snapshot_corrupt(vault_id.as_str(), other.to_string())
            }
        })
    }
}
