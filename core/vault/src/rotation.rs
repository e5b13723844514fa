//! Team key rotation.
//!
//! Rotation generates a fresh team vault key, re-encrypts the current
//! snapshot under it, wraps it for everyone who keeps access and submits the
//! lot in one backend call that bumps the key epoch. Wraps of older epochs
//! stay on record but no longer open the latest snapshot.

use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use teamvault_common::{Error, KeyEpoch, Result, TeamId, UserId, VaultId};
use teamvault_crypto::{wrap_key, VaultKey};
use teamvault_storage::{MembershipState, NewBlob, SessionToken, TeamKeyRotation, VaultBackend};

use crate::codec::SnapshotCodec;
use crate::model::Snapshot;
use crate::share::ShareProtocol;

/// The team vault being rotated, as the caller currently sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamVaultRef {
    pub team_id: TeamId,
    pub vault_id: VaultId,
    pub key_epoch: KeyEpoch,
}

/// Result of a successful rotation.
#[derive(Debug, Clone)]
pub struct RotatedKey {
    pub epoch: KeyEpoch,
    pub key: VaultKey,
}

/// Rotates team keys.
pub struct KeyRotation {
    backend: Arc<dyn VaultBackend>,
    share: ShareProtocol,
}

impl KeyRotation {
    pub fn new(backend: Arc<dyn VaultBackend>) -> Self {
        Self {
            share: ShareProtocol::new(backend.clone()),
            backend,
        }
    }

    /// Move `team` to a new key epoch.
    ///
    /// # Preconditions
    /// - The caller is an active owner or admin of the team
    /// - `snapshot` is the vault's current content, or `None` if it has none
    ///
    /// # Postconditions
    /// - Every non-revoked member and every live grant recipient holds a wrap
    ///   of the new key at `key_epoch + 1`
    /// - The latest snapshot is sealed under the new key and epoch
    ///
    /// # Errors
    /// - `Conflict` if another rotation or membership change raced this one
    /// - `Authorization` if the caller may not manage the team
    pub async fn rotate_team_key(
        &self,
        session: &SessionToken,
        team: &TeamVaultRef,
        snapshot: Option<&Snapshot>,
    ) -> Result<RotatedKey> {
        let members = self.backend.team_members(session, &team.team_id).await?;
        let recipients = self.backend.grant_recipients(session, &team.vault_id).await?;
        let holders: BTreeSet<UserId> = members
            .into_iter()
            .filter(|m| m.state != MembershipState::Revoked)
            .map(|m| m.user_id)
            .chain(recipients.into_iter().map(|r| r.user_id))
            .collect();

        let public_keys = try_join_all(
            holders
                .iter()
                .map(|user| self.share.recipient_key(session, user)),
        )
        .await?;

        let key = VaultKey::generate();
        let epoch = team.key_epoch + 1;
        let wraps = holders
            .into_iter()
            .zip(public_keys.iter())
            .map(|(user, public)| Ok((user, wrap_key(public, &key)?)))
            .collect::<Result<Vec<_>>>()?;
        let snapshot = match snapshot {
            Some(snapshot) => Some(NewBlob::new(
                SnapshotCodec::seal_for(&team.vault_id, epoch, &key, snapshot)?,
                epoch,
            )),
            None => None,
        };

        let holders = wraps.len();
        self.backend
            .rotate_team_key(
                session,
                TeamKeyRotation {
                    team_id: team.team_id.clone(),
                    new_epoch: epoch,
                    wraps,
                    snapshot,
                },
            )
            .await?;
        info!(team = %team.team_id, epoch, holders, "team key rotated");
        Ok(RotatedKey { epoch, key })
    }

    /// Revoke a member, then rotate so the member's copy of the key opens
    /// nothing written afterwards.
    ///
    /// # Errors
    /// - Any revocation error, with nothing changed
    /// - `RevokedWithoutRotation` if the revocation went through but the
    ///   rotation did not; calling [`Self::rotate_team_key`] again finishes the job
    pub async fn remove_member(
        &self,
        session: &SessionToken,
        team: &TeamVaultRef,
        user_id: &UserId,
        snapshot: Option<&Snapshot>,
    ) -> Result<RotatedKey> {
        self.share.revoke(session, &team.team_id, user_id).await?;
        self.rotate_team_key(session, team, snapshot)
            .await
            .map_err(|e| {
                warn!(team = %team.team_id, member = %user_id, error = %e, "member revoked but key rotation failed");
                Error::RevokedWithoutRotation {
                    member: user_id.to_string(),
                    reason: e.to_string(),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamvault_common::TeamRole;
    use teamvault_crypto::{unwrap_key, IdentityKeys};
    use teamvault_storage::{IdentityRecord, MemoryBackend, VaultOwner};

    use crate::model::Entry;

    struct User {
        id: UserId,
        session: SessionToken,
        keys: IdentityKeys,
    }

    async fn enroll(backend: &MemoryBackend, name: &str) -> User {
        let id = UserId::new(name).unwrap();
        backend.register_user(&id).await.unwrap();
        let session = backend.login(&id).await.unwrap();
        let keys = IdentityKeys::generate();
        let public = keys.public();
        backend
            .publish_identity(
                &session,
                IdentityRecord {
                    sign_public_key: public.sign_public_key.to_vec(),
                    enc_public_key: public.enc_public_key.to_vec(),
                    encrypted_bundle: vec![1],
                },
            )
            .await
            .unwrap();
        User { id, session, keys }
    }

    async fn team_with_bob(backend: &Arc<MemoryBackend>) -> (User, User, TeamVaultRef, VaultKey) {
        let alice = enroll(backend, "alice").await;
        let bob = enroll(backend, "bob").await;
        let team_id = TeamId::new("ops").unwrap();
        let key = VaultKey::generate();
        let vault_id = backend
            .create_vault(
                &alice.session,
                VaultOwner::Team(team_id.clone()),
                wrap_key(&alice.keys.enc_public_key(), &key).unwrap(),
            )
            .await
            .unwrap();
        let share = ShareProtocol::new(backend.clone());
        share
            .invite(&alice.session, &team_id, &key, 0, &bob.id, TeamRole::Editor)
            .await
            .unwrap();
        share.accept(&bob.session, &team_id).await.unwrap();
        (
            alice,
            bob,
            TeamVaultRef {
                team_id,
                vault_id,
                key_epoch: 0,
            },
            key,
        )
    }

    #[tokio::test]
    async fn test_remove_member_rotates_for_the_rest() {
        let backend = Arc::new(MemoryBackend::new());
        let (alice, bob, team, old_key) = team_with_bob(&backend).await;
        let mut snapshot = Snapshot::default();
        snapshot.upsert_entry(Entry::new("db", "root", "s3cret", alice.id.clone()));

        let rotation = KeyRotation::new(backend.clone());
        let rotated = rotation
            .remove_member(&alice.session, &team, &bob.id, Some(&snapshot))
            .await
            .unwrap();
        assert_eq!(rotated.epoch, 1);
        assert_ne!(rotated.key, old_key);

        let listed = backend.list_accessible_vaults(&alice.session).await.unwrap();
        let descriptor = listed.iter().find(|v| v.id == team.vault_id).unwrap();
        assert_eq!(descriptor.key_epoch, 1);
        let key = unwrap_key(
            &alice.keys.enc_public_key(),
            alice.keys.enc_secret_key(),
            &descriptor.wrapped_key_for_caller,
        )
        .unwrap();
        assert_eq!(key, rotated.key);

        let blob = backend
            .fetch_latest_blob(&alice.session, &team.vault_id)
            .await
            .unwrap()
            .unwrap();
        let opened = SnapshotCodec::open_for(&team.vault_id, 1, &key, &blob).unwrap();
        assert_eq!(opened.entries.len(), 1);
        // The removed member's old key no longer opens the latest snapshot.
        assert!(SnapshotCodec::open_for(&team.vault_id, 0, &old_key, &blob).is_err());

        assert!(backend.list_accessible_vaults(&bob.session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_epoch_conflicts() {
        let backend = Arc::new(MemoryBackend::new());
        let (alice, _bob, team, _) = team_with_bob(&backend).await;
        let rotation = KeyRotation::new(backend.clone());
        rotation
            .rotate_team_key(&alice.session, &team, None)
            .await
            .unwrap();

        // Still believes the team is at epoch 0.
        let result = rotation.rotate_team_key(&alice.session, &team, None).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_failed_rotation_after_revoke_is_reported() {
        let backend = Arc::new(MemoryBackend::new());
        let (alice, bob, team, _) = team_with_bob(&backend).await;
        let rotation = KeyRotation::new(backend.clone());
        rotation
            .rotate_team_key(&alice.session, &team, None)
            .await
            .unwrap();

        // The revoke lands, the rotation from the stale epoch does not.
        let result = rotation
            .remove_member(&alice.session, &team, &bob.id, None)
            .await;
        match result {
            Err(Error::RevokedWithoutRotation { member, reason }) => {
                assert_eq!(member, "bob");
                assert!(reason.contains("epoch"));
            }
            other => panic!("expected RevokedWithoutRotation, got {:?}", other),
        }
        assert!(backend.list_accessible_vaults(&bob.session).await.unwrap().is_empty());

        let current = TeamVaultRef { key_epoch: 1, ..team };
        let rotated = rotation
            .rotate_team_key(&alice.session, &current, None)
            .await
            .unwrap();
        assert_eq!(rotated.epoch, 2);
    }

    #[tokio::test]
    async fn test_failed_revoke_is_not_wrapped() {
        let backend = Arc::new(MemoryBackend::new());
        let (alice, bob, team, _) = team_with_bob(&backend).await;
        let rotation = KeyRotation::new(backend.clone());

        let result = rotation
            .remove_member(&bob.session, &team, &alice.id, None)
            .await;
        assert!(matches!(result, Err(Error::Authorization(_))));
    }

    #[tokio::test]
    async fn test_editor_cannot_rotate() {
        let backend = Arc::new(MemoryBackend::new());
        let (_alice, bob, team, _) = team_with_bob(&backend).await;
        let rotation = KeyRotation::new(backend.clone());

        let result = rotation.rotate_team_key(&bob.session, &team, None).await;
        assert!(matches!(result, Err(Error::Authorization(_))));
    }
}
