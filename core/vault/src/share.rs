//! Distributing vault keys to users and teams.
//!
//! Sharing only ever wraps an existing vault key for new recipients. It never
//! reads or re-encrypts vault contents.

use futures::future::try_join_all;
use std::sync::Arc;
use tracing::info;

use teamvault_common::{
    Error, KeyEpoch, Permission, Result, TeamId, TeamRole, UserId, VaultId, WrappedKey,
};
use teamvault_crypto::{wrap_key, PublicIdentity, PublicKey, VaultKey};
use teamvault_storage::{
    MembershipState, NewMembership, NewShareGrant, SessionToken, ShareTarget, VaultBackend,
};

/// Issues share grants and team memberships.
pub struct ShareProtocol {
    backend: Arc<dyn VaultBackend>,
}

impl ShareProtocol {
    pub fn new(backend: Arc<dyn VaultBackend>) -> Self {
        Self { backend }
    }

    /// Encryption public key of `user_id`, as published.
    ///
    /// # Errors
    /// - `NotFound` if the user has no identity
    pub async fn recipient_key(&self, session: &SessionToken, user_id: &UserId) -> Result<PublicKey> {
        let keys = self.backend.public_keys(session, user_id).await?;
        let identity = PublicIdentity::from_slices(&keys.sign_public_key, &keys.enc_public_key)?;
        Ok(identity.enc_key())
    }

    async fn wrap_for(
        &self,
        session: &SessionToken,
        user_id: &UserId,
        key: &VaultKey,
    ) -> Result<(UserId, WrappedKey)> {
        let public = self.recipient_key(session, user_id).await?;
        Ok((user_id.clone(), wrap_key(&public, key)?))
    }

    /// Give one user access to a vault. `key` must be the vault key at `key_epoch`.
    ///
    /// # Errors
    /// - `Conflict` if the vault has moved past `key_epoch`
    pub async fn share_with_user(
        &self,
        session: &SessionToken,
        vault_id: &VaultId,
        key: &VaultKey,
        key_epoch: KeyEpoch,
        user_id: &UserId,
        permission: Permission,
    ) -> Result<()> {
        let wrap = self.wrap_for(session, user_id, key).await?;
        self.backend
            .create_share_grant(
                session,
                NewShareGrant {
                    vault_id: vault_id.clone(),
                    target: ShareTarget::User(user_id.clone()),
                    permission,
                    key_epoch,
                    wraps: vec![wrap],
                },
            )
            .await?;
        info!(vault = %vault_id, recipient = %user_id, ?permission, "vault shared with user");
        Ok(())
    }

    /// Give every active member of a team access to a vault.
    ///
    /// # Errors
    /// - `InvalidInput` if the team has no active members
    /// - `Authorization` if the caller cannot see the team or manage the vault
    /// - `Conflict` if the vault has moved past `key_epoch`
    pub async fn share_with_team(
        &self,
        session: &SessionToken,
        vault_id: &VaultId,
        key: &VaultKey,
        key_epoch: KeyEpoch,
        team_id: &TeamId,
        permission: Permission,
    ) -> Result<()> {
        let members = self.backend.team_members(session, team_id).await?;
        let active: Vec<UserId> = members
            .into_iter()
            .filter(|m| m.state == MembershipState::Active)
            .map(|m| m.user_id)
            .collect();
        if active.is_empty() {
            return Err(Error::InvalidInput(format!(
                "team {} has no active members",
                team_id
            )));
        }

        let wraps = try_join_all(active.iter().map(|user| self.wrap_for(session, user, key))).await?;
        self.backend
            .create_share_grant(
                session,
                NewShareGrant {
                    vault_id: vault_id.clone(),
                    target: ShareTarget::Team(team_id.clone()),
                    permission,
                    key_epoch,
                    wraps,
                },
            )
            .await?;
        info!(vault = %vault_id, team = %team_id, members = active.len(), "vault shared with team");
        Ok(())
    }

    /// Invite a user into a team, wrapping the team's vault key at `key_epoch` for them.
    ///
    /// # Errors
    /// - `Conflict` if the team key was rotated past `key_epoch`
    pub async fn invite(
        &self,
        session: &SessionToken,
        team_id: &TeamId,
        team_key: &VaultKey,
        key_epoch: KeyEpoch,
        user_id: &UserId,
        role: TeamRole,
    ) -> Result<()> {
        let (_, wrapped_key) = self.wrap_for(session, user_id, team_key).await?;
        self.backend
            .create_team_membership(
                session,
                NewMembership {
                    team_id: team_id.clone(),
                    user_id: user_id.clone(),
                    role,
                    key_epoch,
                    wrapped_key,
                },
            )
            .await
    }

    pub async fn accept(&self, session: &SessionToken, team_id: &TeamId) -> Result<()> {
        self.backend.accept_membership(session, team_id).await
    }

    /// Revoke a member. Keys already unwrapped by that member stay valid
    /// until the team key is rotated.
    pub async fn revoke(&self, session: &SessionToken, team_id: &TeamId, user_id: &UserId) -> Result<()> {
        self.backend.revoke_membership(session, team_id, user_id).await
    }
}
