//! Server-side records and the access rules evaluated over them.
//!
//! The same rules gate direct reads (`list_accessible_vaults`,
//! `fetch_latest_blob`) and per-subscriber event filtering, so a user never
//! hears about a resource they could not read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::backend::{
    GrantRecipient, IdentityRecord, MembershipInfo, MembershipState, VaultDescriptor, VaultOwner,
};
use teamvault_common::{
    BlobId, Error, KeyEpoch, Permission, Resource, Result, TeamId, TeamRole, UserId, VaultId,
    VaultKind, WrappedKey,
};

/// A wrapped key tagged with the key epoch it seals.
#[derive(Debug, Clone)]
pub(crate) struct EpochWrap {
    pub epoch: KeyEpoch,
    pub wrapped: WrappedKey,
}

#[derive(Debug, Clone)]
pub(crate) struct VaultRecord {
    pub owner: VaultOwner,
    pub key_epoch: KeyEpoch,
    pub creator_wraps: Vec<EpochWrap>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl VaultRecord {
    pub fn kind(&self) -> VaultKind {
        match self.owner {
            VaultOwner::User(_) => VaultKind::Personal,
            VaultOwner::Team(_) => VaultKind::Team,
        }
    }

    pub fn team_id(&self) -> Option<&TeamId> {
        match &self.owner {
            VaultOwner::Team(team_id) => Some(team_id),
            VaultOwner::User(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TeamRecord {
    pub vault_id: VaultId,
}

#[derive(Debug, Clone)]
pub(crate) struct MembershipRecord {
    pub role: TeamRole,
    pub wraps: Vec<EpochWrap>,
    pub invited_at: DateTime<Utc>,
    pub joined_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl MembershipRecord {
    pub fn state(&self) -> MembershipState {
        match (self.joined_at, self.revoked_at) {
            (_, Some(_)) => MembershipState::Revoked,
            (Some(_), None) => MembershipState::Active,
            (None, None) => MembershipState::Invited,
        }
    }

    pub fn latest_wrap(&self) -> Option<&EpochWrap> {
        self.wraps.iter().max_by_key(|w| w.epoch)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GrantRecord {
    pub vault_id: VaultId,
    pub recipient: UserId,
    pub via_team: Option<TeamId>,
    pub permission: Permission,
    pub wraps: Vec<EpochWrap>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub(crate) struct BlobRecord {
    pub id: BlobId,
    pub bytes: Vec<u8>,
}

/// Every table the server keeps. Revocation flags records rather than removing them.
#[derive(Debug, Default)]
pub struct ServerState {
    pub(crate) users: HashMap<UserId, DateTime<Utc>>,
    pub(crate) identities: HashMap<UserId, IdentityRecord>,
    pub(crate) vaults: HashMap<VaultId, VaultRecord>,
    pub(crate) personal_vaults: HashMap<UserId, VaultId>,
    pub(crate) teams: HashMap<TeamId, TeamRecord>,
    pub(crate) memberships: HashMap<(TeamId, UserId), MembershipRecord>,
    pub(crate) grants: Vec<GrantRecord>,
    pub(crate) blobs: HashMap<VaultId, Vec<BlobRecord>>,
}

impl ServerState {
    /// Role of `user_id` in `team_id`, only while the membership is active.
    pub fn active_role(&self, user_id: &UserId, team_id: &TeamId) -> Option<TeamRole> {
        self.memberships
            .get(&(team_id.clone(), user_id.clone()))
            .filter(|m| m.state() == MembershipState::Active)
            .map(|m| m.role)
    }

    fn live_grants<'a>(
        &'a self,
        user_id: &'a UserId,
        vault_id: &'a VaultId,
    ) -> impl Iterator<Item = &'a GrantRecord> + 'a {
        self.grants.iter().filter(move |g| {
            &g.vault_id == vault_id
                && &g.recipient == user_id
                && g.revoked_at.is_none()
                && g
                    .via_team
                    .as_ref()
                    .map_or(true, |team_id| self.active_role(user_id, team_id).is_some())
        })
    }

    /// Strongest permission `user_id` holds on `vault_id`, if any.
    pub fn vault_permission(&self, user_id: &UserId, vault_id: &VaultId) -> Option<Permission> {
        let vault = self.vaults.get(vault_id)?;
        if vault.retired_at.is_some() {
            return None;
        }

        let direct = match &vault.owner {
            VaultOwner::User(owner) if owner == user_id => Some(Permission::Write),
            VaultOwner::User(_) => None,
            VaultOwner::Team(team_id) => self.active_role(user_id, team_id).map(|r| r.permission()),
        };
        let granted = self.live_grants(user_id, vault_id).map(|g| g.permission).max();
        direct.max(granted)
    }

    /// Whether `user_id` may share or rotate the key of `vault_id`.
    pub fn can_manage_vault(&self, user_id: &UserId, vault_id: &VaultId) -> bool {
        match self.vaults.get(vault_id) {
            Some(vault) if vault.retired_at.is_none() => match &vault.owner {
                VaultOwner::User(owner) => owner == user_id,
                VaultOwner::Team(team_id) => self
                    .active_role(user_id, team_id)
                    .is_some_and(|r| r.can_manage()),
            },
            _ => false,
        }
    }

    /// Fail with `Conflict` unless `epoch` is the current key epoch of `vault_id`.
    ///
    /// Anything sealed or wrapped under a retired epoch would be unreadable
    /// to members who only hold the newest key.
    pub fn require_current_epoch(&self, vault_id: &VaultId, epoch: KeyEpoch) -> Result<()> {
        let current = self
            .vaults
            .get(vault_id)
            .map(|v| v.key_epoch)
            .ok_or_else(|| Error::NotFound(format!("vault {}", vault_id)))?;
        if epoch != current {
            return Err(Error::Conflict(format!(
                "vault {} is at key epoch {}, not {}",
                vault_id, current, epoch
            )));
        }
        Ok(())
    }

    /// The single access check used for reads and event filtering.
    pub fn can_access(&self, user_id: &UserId, resource: &Resource) -> bool {
        match resource {
            Resource::Vault(vault_id) => self.vault_permission(user_id, vault_id).is_some(),
            Resource::Team(team_id) => self.active_role(user_id, team_id).is_some(),
            Resource::User(other) => other == user_id,
        }
    }

    /// Newest wrap of the vault key addressed to `user_id`.
    fn wrap_for(&self, user_id: &UserId, vault_id: &VaultId) -> Option<EpochWrap> {
        let vault = self.vaults.get(vault_id)?;
        let mut candidates: Vec<&EpochWrap> = Vec::new();

        match &vault.owner {
            VaultOwner::User(owner) if owner == user_id => {
                candidates.extend(vault.creator_wraps.iter());
            }
            VaultOwner::Team(team_id) if self.active_role(user_id, team_id).is_some() => {
                if let Some(m) = self.memberships.get(&(team_id.clone(), user_id.clone())) {
                    candidates.extend(m.wraps.iter());
                }
            }
            _ => {}
        }
        for grant in self.live_grants(user_id, vault_id) {
            candidates.extend(grant.wraps.iter());
        }

        candidates.into_iter().max_by_key(|w| w.epoch).cloned()
    }

    /// Descriptors for every vault `user_id` can open, ordered by vault id.
    pub fn accessible_vaults(&self, user_id: &UserId) -> Vec<VaultDescriptor> {
        let mut descriptors: Vec<VaultDescriptor> = self
            .vaults
            .iter()
            .filter_map(|(vault_id, vault)| {
                let permission = self.vault_permission(user_id, vault_id)?;
                let wrap = self.wrap_for(user_id, vault_id)?;
                Some(VaultDescriptor {
                    id: vault_id.clone(),
                    kind: vault.kind(),
                    owner: vault.owner.clone(),
                    team_id: vault.team_id().cloned(),
                    version: self.blobs.get(vault_id).map_or(0, |b| b.len() as u64),
                    key_epoch: wrap.epoch,
                    wrapped_key_for_caller: wrap.wrapped,
                    permission,
                })
            })
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub fn membership_infos(&self, team_id: &TeamId) -> Vec<MembershipInfo> {
        let mut infos: Vec<MembershipInfo> = self
            .memberships
            .iter()
            .filter(|((t, _), _)| t == team_id)
            .map(|((t, u), m)| MembershipInfo {
                team_id: t.clone(),
                user_id: u.clone(),
                role: m.role,
                state: m.state(),
                key_epoch: m.latest_wrap().map_or(0, |w| w.epoch),
                invited_at: m.invited_at,
                joined_at: m.joined_at,
                revoked_at: m.revoked_at,
            })
            .collect();
        infos.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        infos
    }

    pub fn grant_recipients(&self, vault_id: &VaultId) -> Vec<GrantRecipient> {
        self.grants
            .iter()
            .filter(|g| &g.vault_id == vault_id && g.revoked_at.is_none())
            .map(|g| GrantRecipient {
                user_id: g.recipient.clone(),
                via_team: g.via_team.clone(),
                permission: g.permission,
            })
            .collect()
    }
}

/// Per-event authorization consulted by the event broker.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn can_access(&self, user_id: &UserId, resource: &Resource) -> bool;
}

/// [`AccessPolicy`] reading live server state.
#[derive(Clone)]
pub struct StateAccessPolicy {
    state: Arc<RwLock<ServerState>>,
}

impl StateAccessPolicy {
    pub fn new(state: Arc<RwLock<ServerState>>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl AccessPolicy for StateAccessPolicy {
    async fn can_access(&self, user_id: &UserId, resource: &Resource) -> bool {
        self.state.read().await.can_access(user_id, resource)
    }
}
