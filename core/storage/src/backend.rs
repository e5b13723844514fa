//! Server interface consumed by vault clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::Subscription;
use crate::session::SessionToken;
use teamvault_common::{
    BlobId, ContentHash, Error, KeyEpoch, Permission, Result, TeamId, TeamRole, UserId, VaultId,
    VaultKind, WrappedKey,
};

/// Largest wrapped key the server accepts. A sealed 32-byte key is 80 bytes.
pub const MAX_WRAPPED_KEY_LEN: usize = 256;

/// Public half of a user's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeys {
    pub user_id: UserId,
    pub sign_public_key: Vec<u8>,
    pub enc_public_key: Vec<u8>,
}

/// Identity record as stored by the server. The bundle is opaque ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub sign_public_key: Vec<u8>,
    pub enc_public_key: Vec<u8>,
    pub encrypted_bundle: Vec<u8>,
}

impl IdentityRecord {
    /// Reject records whose key fields are obviously malformed.
    pub fn validate(&self) -> Result<()> {
        if self.sign_public_key.len() != 32 || self.enc_public_key.len() != 32 {
            return Err(Error::InvalidInput(
                "public keys must be 32 bytes".to_string(),
            ));
        }
        if self.encrypted_bundle.is_empty() {
            return Err(Error::InvalidInput("empty key bundle".to_string()));
        }
        Ok(())
    }
}

/// Who a new vault belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum VaultOwner {
    User(UserId),
    Team(TeamId),
}

/// A vault the caller can open, with its key wrapped for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultDescriptor {
    pub id: VaultId,
    pub kind: VaultKind,
    pub owner: VaultOwner,
    pub team_id: Option<TeamId>,
    /// Number of snapshots uploaded so far.
    pub version: u64,
    /// Epoch of `wrapped_key_for_caller`.
    pub key_epoch: KeyEpoch,
    pub wrapped_key_for_caller: WrappedKey,
    pub permission: Permission,
}

/// Recipient side of a share grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum ShareTarget {
    User(UserId),
    Team(TeamId),
}

/// Request to grant access to a vault.
///
/// A user grant carries exactly one wrap for that user. A team grant carries
/// one wrap per current team member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewShareGrant {
    pub vault_id: VaultId,
    pub target: ShareTarget,
    pub permission: Permission,
    /// Epoch of the wrapped key; must be the vault's current one.
    pub key_epoch: KeyEpoch,
    pub wraps: Vec<(UserId, WrappedKey)>,
}

/// Request to invite a user into a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMembership {
    pub team_id: TeamId,
    pub user_id: UserId,
    pub role: TeamRole,
    /// Epoch of the wrapped team key; must be the team vault's current one.
    pub key_epoch: KeyEpoch,
    pub wrapped_key: WrappedKey,
}

/// Lifecycle state of a membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    Invited,
    Active,
    Revoked,
}

/// A membership as listed to team members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipInfo {
    pub team_id: TeamId,
    pub user_id: UserId,
    pub role: TeamRole,
    pub state: MembershipState,
    /// Newest epoch this member holds a wrap for.
    pub key_epoch: KeyEpoch,
    pub invited_at: DateTime<Utc>,
    pub joined_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// A user holding a wrap of a vault key through a share grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRecipient {
    pub user_id: UserId,
    pub via_team: Option<TeamId>,
    pub permission: Permission,
}

/// Everything needed to move a team to a new key epoch in one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamKeyRotation {
    pub team_id: TeamId,
    pub new_epoch: KeyEpoch,
    /// One wrap of the new key for every remaining member and grant recipient.
    pub wraps: Vec<(UserId, WrappedKey)>,
    /// Current snapshot re-encrypted under the new key, if any exists.
    pub snapshot: Option<NewBlob>,
}

/// Snapshot bytes with their content hash and the key epoch they were sealed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBlob {
    pub bytes: Vec<u8>,
    pub content_hash: ContentHash,
    pub key_epoch: KeyEpoch,
}

impl NewBlob {
    pub fn new(bytes: Vec<u8>, key_epoch: KeyEpoch) -> Self {
        let content_hash = ContentHash::of(&bytes);
        Self {
            bytes,
            content_hash,
            key_epoch,
        }
    }
}

pub(crate) fn validate_wrapped_key(wrapped: &WrappedKey) -> Result<()> {
    let len = wrapped.as_bytes().len();
    if len == 0 || len > MAX_WRAPPED_KEY_LEN {
        return Err(Error::InvalidInput(format!(
            "wrapped key length {} out of range",
            len
        )));
    }
    Ok(())
}

/// Storage and transport collaborator for vault clients.
///
/// Every call is authenticated by a session token. Implementations must
/// check authorization before mutating anything, so a rejected call leaves
/// no partial state behind.
#[async_trait]
pub trait VaultBackend: Send + Sync {
    /// Store the caller's identity. Fails with `AlreadyExists` if one is set.
    async fn publish_identity(&self, session: &SessionToken, record: IdentityRecord)
        -> Result<()>;

    /// Fetch the caller's own identity record, if any.
    async fn fetch_identity(&self, session: &SessionToken) -> Result<Option<IdentityRecord>>;

    /// Discard the caller's identity and every wrap addressed to it.
    async fn reset_identity(&self, session: &SessionToken) -> Result<()>;

    /// Fetch any user's public keys.
    async fn public_keys(&self, session: &SessionToken, user_id: &UserId) -> Result<PublicKeys>;

    /// Create a vault.
    ///
    /// # Preconditions
    /// - For `VaultOwner::User`, the owner is the caller and has no personal vault yet
    /// - For `VaultOwner::Team`, the team id is fresh; the caller becomes its owner
    ///
    /// # Postconditions
    /// - `wrapped_key` is stored as the creator's wrap at epoch 0
    async fn create_vault(
        &self,
        session: &SessionToken,
        owner: VaultOwner,
        wrapped_key: WrappedKey,
    ) -> Result<VaultId>;

    /// Every vault the caller can currently open.
    async fn list_accessible_vaults(&self, session: &SessionToken) -> Result<Vec<VaultDescriptor>>;

    /// Append a snapshot blob.
    ///
    /// # Errors
    /// - `Authorization` without write permission on the vault
    /// - `InvalidInput` if `content_hash` does not match `bytes`
    /// - `Conflict` if the blob was sealed at an epoch other than the vault's current one
    async fn upload_blob(
        &self,
        session: &SessionToken,
        vault_id: &VaultId,
        blob: NewBlob,
    ) -> Result<BlobId>;

    /// Latest blob by insertion order, or `None` before the first upload.
    async fn fetch_latest_blob(
        &self,
        session: &SessionToken,
        vault_id: &VaultId,
    ) -> Result<Option<Vec<u8>>>;

    /// Grant access to a vault. Managers only.
    ///
    /// # Errors
    /// - `Conflict` if `key_epoch` is not the vault's current epoch
    async fn create_share_grant(&self, session: &SessionToken, grant: NewShareGrant) -> Result<()>;

    async fn team_members(&self, session: &SessionToken, team_id: &TeamId)
        -> Result<Vec<MembershipInfo>>;

    /// Non-revoked grant recipients of a vault. Managers only.
    async fn grant_recipients(
        &self,
        session: &SessionToken,
        vault_id: &VaultId,
    ) -> Result<Vec<GrantRecipient>>;

    /// Invite a user. Owners and admins only; nobody may grant a role above their own.
    ///
    /// # Errors
    /// - `Conflict` if `key_epoch` is not the team vault's current epoch
    async fn create_team_membership(
        &self,
        session: &SessionToken,
        membership: NewMembership,
    ) -> Result<()>;

    /// Accept the caller's pending invitation.
    async fn accept_membership(&self, session: &SessionToken, team_id: &TeamId) -> Result<()>;

    /// Revoke a member. Existing wraps stay on record.
    async fn revoke_membership(
        &self,
        session: &SessionToken,
        team_id: &TeamId,
        user_id: &UserId,
    ) -> Result<()>;

    /// Move a team to a new key epoch atomically.
    async fn rotate_team_key(&self, session: &SessionToken, rotation: TeamKeyRotation)
        -> Result<()>;

    /// Open an access-filtered change-event stream.
    async fn subscribe(&self, session: &SessionToken) -> Result<Subscription>;
}
