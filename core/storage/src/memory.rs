//! In-memory server for tests, demos and local development.
//!
//! Implements [`VaultBackend`] over [`ServerState`], with a [`SessionGuard`]
//! in front of every call and a [`SyncEventBroker`] behind every mutation.
//! All data is lost on drop.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::access::{
    BlobRecord, EpochWrap, GrantRecord, MembershipRecord, ServerState, StateAccessPolicy,
    TeamRecord, VaultRecord,
};
use crate::backend::{
    validate_wrapped_key, GrantRecipient, IdentityRecord, MembershipInfo, MembershipState,
    NewBlob, NewMembership, NewShareGrant, PublicKeys, ShareTarget, TeamKeyRotation, VaultBackend,
    VaultDescriptor, VaultOwner,
};
use crate::broker::{BrokerConfig, Subscription, SyncEventBroker};
use crate::session::{SessionConfig, SessionGuard, SessionToken};
use teamvault_common::{
    BlobId, ChangeEvent, Error, EventKind, Permission, Result, TeamId, TeamRole,
    UserId, VaultId, WrappedKey,
};

/// In-memory [`VaultBackend`].
pub struct MemoryBackend {
    state: Arc<RwLock<ServerState>>,
    sessions: Arc<SessionGuard>,
    broker: Arc<SyncEventBroker>,
    available: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty server with default session and broker settings.
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default(), BrokerConfig::default())
    }

    pub fn with_config(session_config: SessionConfig, broker_config: BrokerConfig) -> Self {
        let state = Arc::new(RwLock::new(ServerState::default()));
        let sessions = Arc::new(SessionGuard::new(session_config));
        let policy = Arc::new(StateAccessPolicy::new(state.clone()));
        let broker = SyncEventBroker::new(policy, sessions.clone(), broker_config);
        Self {
            state,
            sessions,
            broker,
            available: AtomicBool::new(true),
        }
    }

    /// Add a user account. Stands in for the directory service.
    pub async fn register_user(&self, user_id: &UserId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.users.contains_key(user_id) {
            return Err(Error::AlreadyExists(format!("user {}", user_id)));
        }
        state.users.insert(user_id.clone(), Utc::now());
        info!(user = %user_id, "user registered");
        Ok(())
    }

    /// Open a session for a registered user.
    pub async fn login(&self, user_id: &UserId) -> Result<SessionToken> {
        self.ensure_available()?;
        if !self.state.read().await.users.contains_key(user_id) {
            return Err(Error::Authorization("unknown user".to_string()));
        }
        self.sessions.issue(user_id.clone()).await
    }

    pub fn sessions(&self) -> &Arc<SessionGuard> {
        &self.sessions
    }

    pub fn broker(&self) -> &Arc<SyncEventBroker> {
        &self.broker
    }

    /// Simulate losing or regaining the network. While unavailable every
    /// call fails with `Transport`; going down also drops all subscribers.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.broker.disconnect_all();
        }
        info!(available, "backend availability changed");
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Transport("server unreachable".to_string()))
        }
    }

    async fn authenticate(&self, session: &SessionToken) -> Result<UserId> {
        self.ensure_available()?;
        self.sessions.validate(session).await
    }

    /// Publish after the state lock has been released; the broker reads state.
    async fn emit(&self, events: Vec<ChangeEvent>) {
        for event in events {
            if let Err(e) = self.broker.publish(event).await {
                warn!(error = %e, "dropping malformed change event");
            }
        }
    }
}

fn team_event(kind: EventKind, actor: &UserId, team_id: &TeamId, member: &UserId) -> ChangeEvent {
    ChangeEvent::new(kind, actor.clone())
        .with_team(team_id.clone())
        .with_member(member.clone())
}

#[async_trait]
impl VaultBackend for MemoryBackend {
    async fn publish_identity(&self, session: &SessionToken, record: IdentityRecord) -> Result<()> {
        let user_id = self.authenticate(session).await?;
        record.validate()?;

        let mut state = self.state.write().await;
        if state.identities.contains_key(&user_id) {
            return Err(Error::AlreadyExists(format!("identity for {}", user_id)));
        }
        state.identities.insert(user_id.clone(), record);
        info!(user = %user_id, "identity published");
        Ok(())
    }

    async fn fetch_identity(&self, session: &SessionToken) -> Result<Option<IdentityRecord>> {
        let user_id = self.authenticate(session).await?;
        Ok(self.state.read().await.identities.get(&user_id).cloned())
    }

    async fn reset_identity(&self, session: &SessionToken) -> Result<()> {
        let user_id = self.authenticate(session).await?;
        let now = Utc::now();
        {
            let mut state = self.state.write().await;
            if state.identities.remove(&user_id).is_none() {
                return Err(Error::NotFound(format!("identity for {}", user_id)));
            }
            if let Some(vault_id) = state.personal_vaults.remove(&user_id) {
                if let Some(vault) = state.vaults.get_mut(&vault_id) {
                    vault.retired_at = Some(now);
                }
            }
            for grant in state.grants.iter_mut().filter(|g| g.recipient == user_id) {
                grant.revoked_at.get_or_insert(now);
            }
            for ((_, member), record) in state.memberships.iter_mut() {
                if member == &user_id {
                    record.revoked_at.get_or_insert(now);
                }
            }
        }
        warn!(user = %user_id, "identity reset; prior wraps are unrecoverable");
        self.emit(vec![ChangeEvent::new(EventKind::IdentityReset, user_id)])
            .await;
        Ok(())
    }

    async fn public_keys(&self, session: &SessionToken, user_id: &UserId) -> Result<PublicKeys> {
        self.authenticate(session).await?;
        let state = self.state.read().await;
        let identity = state
            .identities
            .get(user_id)
            .ok_or_else(|| Error::NotFound(format!("identity for {}", user_id)))?;
        Ok(PublicKeys {
            user_id: user_id.clone(),
            sign_public_key: identity.sign_public_key.clone(),
            enc_public_key: identity.enc_public_key.clone(),
        })
    }

    async fn create_vault(
        &self,
        session: &SessionToken,
        owner: VaultOwner,
        wrapped_key: WrappedKey,
    ) -> Result<VaultId> {
        let user_id = self.authenticate(session).await?;
        validate_wrapped_key(&wrapped_key)?;
        let vault_id = VaultId::generate();
        let now = Utc::now();
        let wrap = EpochWrap {
            epoch: 0,
            wrapped: wrapped_key,
        };

        let events = {
            let mut state = self.state.write().await;
            let events = match &owner {
                VaultOwner::User(owner_id) => {
                    if owner_id != &user_id {
                        return Err(Error::Authorization(
                            "cannot create a personal vault for another user".to_string(),
                        ));
                    }
                    if state.personal_vaults.contains_key(&user_id) {
                        return Err(Error::AlreadyExists(format!(
                            "personal vault for {}",
                            user_id
                        )));
                    }
                    state.personal_vaults.insert(user_id.clone(), vault_id.clone());
                    vec![ChangeEvent::new(EventKind::VaultCreate, user_id.clone())
                        .with_vault(vault_id.clone())]
                }
                VaultOwner::Team(team_id) => {
                    if state.teams.contains_key(team_id) {
                        return Err(Error::AlreadyExists(format!("team {}", team_id)));
                    }
                    state.teams.insert(
                        team_id.clone(),
                        TeamRecord {
                            vault_id: vault_id.clone(),
                        },
                    );
                    state.memberships.insert(
                        (team_id.clone(), user_id.clone()),
                        MembershipRecord {
                            role: TeamRole::Owner,
                            wraps: vec![wrap.clone()],
                            invited_at: now,
                            joined_at: Some(now),
                            revoked_at: None,
                        },
                    );
                    vec![
                        ChangeEvent::new(EventKind::TeamCreate, user_id.clone())
                            .with_team(team_id.clone()),
                        ChangeEvent::new(EventKind::VaultCreate, user_id.clone())
                            .with_vault(vault_id.clone())
                            .with_team(team_id.clone()),
                    ]
                }
            };
            state.vaults.insert(
                vault_id.clone(),
                VaultRecord {
                    owner: owner.clone(),
                    key_epoch: 0,
                    creator_wraps: vec![wrap],
                    retired_at: None,
                },
            );
            events
        };

        info!(vault = %vault_id, owner = ?owner, "vault created");
        self.emit(events).await;
        Ok(vault_id)
    }

    async fn list_accessible_vaults(&self, session: &SessionToken) -> Result<Vec<VaultDescriptor>> {
        let user_id = self.authenticate(session).await?;
        Ok(self.state.read().await.accessible_vaults(&user_id))
    }

    async fn upload_blob(
        &self,
        session: &SessionToken,
        vault_id: &VaultId,
        blob: NewBlob,
    ) -> Result<BlobId> {
        let user_id = self.authenticate(session).await?;
        if !blob.content_hash.matches(&blob.bytes) {
            return Err(Error::InvalidInput("content hash mismatch".to_string()));
        }

        let blob_id = BlobId::generate();
        let event = {
            let mut state = self.state.write().await;
            if state.vault_permission(&user_id, vault_id) != Some(Permission::Write) {
                return Err(Error::Authorization(format!(
                    "no write access to vault {}",
                    vault_id
                )));
            }
            state.require_current_epoch(vault_id, blob.key_epoch)?;
            let team_id = state.vaults.get(vault_id).and_then(|v| v.team_id().cloned());
            state
                .blobs
                .entry(vault_id.clone())
                .or_default()
                .push(BlobRecord {
                    id: blob_id.clone(),
                    bytes: blob.bytes,
                });

            let event = ChangeEvent::new(EventKind::VaultUpdate, user_id).with_vault(vault_id.clone());
            match team_id {
                Some(team_id) => event.with_team(team_id),
                None => event,
            }
        };

        debug!(vault = %vault_id, blob = %blob_id, "blob stored");
        self.emit(vec![event]).await;
        Ok(blob_id)
    }

    async fn fetch_latest_blob(
        &self,
        session: &SessionToken,
        vault_id: &VaultId,
    ) -> Result<Option<Vec<u8>>> {
        let user_id = self.authenticate(session).await?;
        let state = self.state.read().await;
        if state.vault_permission(&user_id, vault_id).is_none() {
            return Err(Error::Authorization(format!(
                "no access to vault {}",
                vault_id
            )));
        }
        Ok(state
            .blobs
            .get(vault_id)
            .and_then(|blobs| blobs.last())
            .map(|blob| blob.bytes.clone()))
    }

    async fn create_share_grant(&self, session: &SessionToken, grant: NewShareGrant) -> Result<()> {
        let user_id = self.authenticate(session).await?;
        if grant.wraps.is_empty() {
            return Err(Error::InvalidInput("share grant carries no wraps".to_string()));
        }
        for (_, wrapped) in &grant.wraps {
            validate_wrapped_key(wrapped)?;
        }

        let event = {
            let mut state = self.state.write().await;
            if !state.can_manage_vault(&user_id, &grant.vault_id) {
                return Err(Error::Authorization(format!(
                    "cannot share vault {}",
                    grant.vault_id
                )));
            }
            state.require_current_epoch(&grant.vault_id, grant.key_epoch)?;
            let epoch = grant.key_epoch;

            let via_team = match &grant.target {
                ShareTarget::User(recipient) => {
                    if grant.wraps.len() != 1 || &grant.wraps[0].0 != recipient {
                        return Err(Error::InvalidInput(
                            "a user grant carries exactly one wrap for that user".to_string(),
                        ));
                    }
                    if !state.identities.contains_key(recipient) {
                        return Err(Error::NotFound(format!("identity for {}", recipient)));
                    }
                    None
                }
                ShareTarget::Team(team_id) => {
                    if !state.teams.contains_key(team_id) {
                        return Err(Error::NotFound(format!("team {}", team_id)));
                    }
                    let active: HashSet<UserId> = state
                        .membership_infos(team_id)
                        .into_iter()
                        .filter(|m| m.state == MembershipState::Active)
                        .map(|m| m.user_id)
                        .collect();
                    let wrapped: HashSet<UserId> =
                        grant.wraps.iter().map(|(u, _)| u.clone()).collect();
                    if wrapped != active || wrapped.len() != grant.wraps.len() {
                        return Err(Error::InvalidInput(
                            "a team grant carries one wrap per active member".to_string(),
                        ));
                    }
                    Some(team_id.clone())
                }
            };

            for (recipient, wrapped) in grant.wraps {
                state.grants.push(GrantRecord {
                    vault_id: grant.vault_id.clone(),
                    recipient,
                    via_team: via_team.clone(),
                    permission: grant.permission,
                    wraps: vec![EpochWrap { epoch, wrapped }],
                    revoked_at: None,
                });
            }

            let event = ChangeEvent::new(EventKind::ShareGrantCreate, user_id)
                .with_vault(grant.vault_id.clone());
            match grant.target {
                ShareTarget::User(recipient) => event.with_member(recipient),
                ShareTarget::Team(team_id) => event.with_team(team_id),
            }
        };

        info!(vault = ?event.vault_id, "share grant created");
        self.emit(vec![event]).await;
        Ok(())
    }

    async fn team_members(
        &self,
        session: &SessionToken,
        team_id: &TeamId,
    ) -> Result<Vec<MembershipInfo>> {
        let user_id = self.authenticate(session).await?;
        let state = self.state.read().await;
        if state.active_role(&user_id, team_id).is_none() {
            return Err(Error::Authorization(format!("not a member of team {}", team_id)));
        }
        Ok(state.membership_infos(team_id))
    }

    async fn grant_recipients(
        &self,
        session: &SessionToken,
        vault_id: &VaultId,
    ) -> Result<Vec<GrantRecipient>> {
        let user_id = self.authenticate(session).await?;
        let state = self.state.read().await;
        if !state.can_manage_vault(&user_id, vault_id) {
            return Err(Error::Authorization(format!(
                "cannot manage vault {}",
                vault_id
            )));
        }
        Ok(state.grant_recipients(vault_id))
    }

    async fn create_team_membership(
        &self,
        session: &SessionToken,
        membership: NewMembership,
    ) -> Result<()> {
        let user_id = self.authenticate(session).await?;
        validate_wrapped_key(&membership.wrapped_key)?;
        let team_id = membership.team_id.clone();

        {
            let mut state = self.state.write().await;
            let caller_role = state
                .active_role(&user_id, &team_id)
                .filter(|r| r.can_manage())
                .ok_or_else(|| {
                    Error::Authorization(format!("cannot invite into team {}", team_id))
                })?;
            if membership.role > caller_role {
                return Err(Error::Authorization(format!(
                    "cannot grant role {:?} as {:?}",
                    membership.role, caller_role
                )));
            }
            if !state.identities.contains_key(&membership.user_id) {
                return Err(Error::NotFound(format!(
                    "identity for {}",
                    membership.user_id
                )));
            }
            let key = (team_id.clone(), membership.user_id.clone());
            if state
                .memberships
                .get(&key)
                .is_some_and(|m| m.state() != MembershipState::Revoked)
            {
                return Err(Error::AlreadyExists(format!(
                    "membership of {} in {}",
                    membership.user_id, team_id
                )));
            }
            let vault_id = state
                .teams
                .get(&team_id)
                .map(|t| t.vault_id.clone())
                .ok_or_else(|| Error::NotFound(format!("team {}", team_id)))?;
            state.require_current_epoch(&vault_id, membership.key_epoch)?;
            let epoch = membership.key_epoch;

            // A re-invitation after revocation starts a fresh record.
            state.memberships.insert(
                key,
                MembershipRecord {
                    role: membership.role,
                    wraps: vec![EpochWrap {
                        epoch,
                        wrapped: membership.wrapped_key,
                    }],
                    invited_at: Utc::now(),
                    joined_at: None,
                    revoked_at: None,
                },
            );
        }

        info!(team = %team_id, member = %membership.user_id, role = ?membership.role, "member invited");
        self.emit(vec![team_event(
            EventKind::TeamMemberInvite,
            &user_id,
            &team_id,
            &membership.user_id,
        )])
        .await;
        Ok(())
    }

    async fn accept_membership(&self, session: &SessionToken, team_id: &TeamId) -> Result<()> {
        let user_id = self.authenticate(session).await?;
        {
            let mut state = self.state.write().await;
            let record = state
                .memberships
                .get_mut(&(team_id.clone(), user_id.clone()))
                .filter(|m| m.state() == MembershipState::Invited)
                .ok_or_else(|| Error::NotFound(format!("pending invitation to {}", team_id)))?;
            record.joined_at = Some(Utc::now());
        }

        info!(team = %team_id, member = %user_id, "invitation accepted");
        self.emit(vec![team_event(
            EventKind::TeamMemberJoin,
            &user_id,
            team_id,
            &user_id,
        )])
        .await;
        Ok(())
    }

    async fn revoke_membership(
        &self,
        session: &SessionToken,
        team_id: &TeamId,
        member: &UserId,
    ) -> Result<()> {
        let user_id = self.authenticate(session).await?;
        {
            let mut state = self.state.write().await;
            let caller_role = state
                .active_role(&user_id, team_id)
                .filter(|r| r.can_manage())
                .ok_or_else(|| {
                    Error::Authorization(format!("cannot remove members of {}", team_id))
                })?;
            let record = state
                .memberships
                .get_mut(&(team_id.clone(), member.clone()))
                .filter(|m| m.state() != MembershipState::Revoked)
                .ok_or_else(|| Error::NotFound(format!("membership of {} in {}", member, team_id)))?;
            if record.role == TeamRole::Owner && caller_role != TeamRole::Owner {
                return Err(Error::Authorization(
                    "only an owner can remove an owner".to_string(),
                ));
            }
            record.revoked_at = Some(Utc::now());
        }

        info!(team = %team_id, member = %member, "member revoked");
        self.emit(vec![team_event(
            EventKind::TeamMemberRemove,
            &user_id,
            team_id,
            member,
        )])
        .await;
        Ok(())
    }

    async fn rotate_team_key(&self, session: &SessionToken, rotation: TeamKeyRotation) -> Result<()> {
        let user_id = self.authenticate(session).await?;
        for (_, wrapped) in &rotation.wraps {
            validate_wrapped_key(wrapped)?;
        }
        if let Some(blob) = &rotation.snapshot {
            if !blob.content_hash.matches(&blob.bytes) {
                return Err(Error::InvalidInput("content hash mismatch".to_string()));
            }
            if blob.key_epoch != rotation.new_epoch {
                return Err(Error::InvalidInput(format!(
                    "rotation snapshot sealed at epoch {}, expected {}",
                    blob.key_epoch, rotation.new_epoch
                )));
            }
        }
        let team_id = rotation.team_id.clone();

        let vault_id = {
            let mut state = self.state.write().await;
            if !state
                .active_role(&user_id, &team_id)
                .is_some_and(|r| r.can_manage())
            {
                return Err(Error::Authorization(format!(
                    "cannot rotate the key of {}",
                    team_id
                )));
            }
            let vault_id = state
                .teams
                .get(&team_id)
                .map(|t| t.vault_id.clone())
                .ok_or_else(|| Error::NotFound(format!("team {}", team_id)))?;
            let current = state.vaults.get(&vault_id).map_or(0, |v| v.key_epoch);
            if rotation.new_epoch != current + 1 {
                return Err(Error::Conflict(format!(
                    "team {} is at epoch {}, cannot rotate to {}",
                    team_id, current, rotation.new_epoch
                )));
            }

            let mut wraps: HashMap<UserId, WrappedKey> = HashMap::new();
            for (recipient, wrapped) in rotation.wraps {
                if wraps.insert(recipient.clone(), wrapped).is_some() {
                    return Err(Error::InvalidInput(format!(
                        "duplicate wrap for {}",
                        recipient
                    )));
                }
            }

            let members: Vec<UserId> = state
                .membership_infos(&team_id)
                .into_iter()
                .filter(|m| m.state != MembershipState::Revoked)
                .map(|m| m.user_id)
                .collect();
            if let Some(missing) = members.iter().find(|m| !wraps.contains_key(*m)) {
                return Err(Error::Conflict(format!(
                    "rotation is missing a wrap for member {}",
                    missing
                )));
            }
            let recipients: HashSet<UserId> = state
                .grant_recipients(&vault_id)
                .into_iter()
                .map(|g| g.user_id)
                .collect();
            if let Some(stranger) = wraps
                .keys()
                .find(|u| !members.contains(u) && !recipients.contains(*u))
            {
                return Err(Error::InvalidInput(format!(
                    "{} holds no access to team {}",
                    stranger, team_id
                )));
            }

            // Every check passed; apply.
            let epoch = rotation.new_epoch;
            let now = Utc::now();
            for member in &members {
                if let (Some(record), Some(wrapped)) = (
                    state.memberships.get_mut(&(team_id.clone(), member.clone())),
                    wraps.get(member),
                ) {
                    record.wraps.push(EpochWrap {
                        epoch,
                        wrapped: wrapped.clone(),
                    });
                }
            }
            for grant in state
                .grants
                .iter_mut()
                .filter(|g| g.vault_id == vault_id && g.revoked_at.is_none())
            {
                match wraps.get(&grant.recipient) {
                    Some(wrapped) => grant.wraps.push(EpochWrap {
                        epoch,
                        wrapped: wrapped.clone(),
                    }),
                    None => grant.revoked_at = Some(now),
                }
            }
            if let Some(vault) = state.vaults.get_mut(&vault_id) {
                vault.key_epoch = epoch;
            }
            if let Some(blob) = rotation.snapshot {
                state.blobs.entry(vault_id.clone()).or_default().push(BlobRecord {
                    id: BlobId::generate(),
                    bytes: blob.bytes,
                });
            }
            vault_id
        };

        info!(team = %team_id, epoch = rotation.new_epoch, "team key rotated");
        self.emit(vec![ChangeEvent::new(EventKind::TeamKeyRotate, user_id)
            .with_team(team_id)
            .with_vault(vault_id)])
        .await;
        Ok(())
    }

    async fn subscribe(&self, session: &SessionToken) -> Result<Subscription> {
        self.ensure_available()?;
        self.broker.subscribe(session).await
    }
}
