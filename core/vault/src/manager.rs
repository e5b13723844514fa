//! Vault client: the unlocked, merged, editable view over every vault a user
//! can open.
//!
//! Unlock flow: identity → per-vault key unwrap → concurrent fetch and
//! decrypt → merge. Each mutation updates exactly one vault's snapshot and
//! schedules a background save; [`VaultClient::flush_saves`] reports every
//! save that failed.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use teamvault_common::{
    ChangeEvent, Error, EventKind, KeyEpoch, Permission, Result, TeamId, TeamRole, UserId,
    VaultId,
};
use teamvault_crypto::{wrap_key, VaultKey};
use teamvault_storage::{NewBlob, SessionToken, VaultBackend, VaultDescriptor, VaultOwner};
use teamvault_sync::{BackendSource, ChangeTarget, EventStream, RefreshOnChange};

use crate::codec::SnapshotCodec;
use crate::config::ClientConfig;
use crate::identity::IdentityKeyStore;
use crate::merge::{MergeEngine, MergedView, SourcedSnapshot, WriteRouter};
use crate::model::{Entry, Folder, Snapshot};
use crate::rotation::{KeyRotation, RotatedKey, TeamVaultRef};
use crate::session::{InactivityTimer, UnlockedSession};
use crate::share::ShareProtocol;

/// Outcome of loading vaults on unlock or refresh.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Vaults whose latest snapshot was decrypted.
    pub loaded: Vec<VaultId>,
    /// Vaults without any snapshot yet.
    pub empty: Vec<VaultId>,
    /// Vaults skipped because their snapshot failed authentication.
    pub corrupt: Vec<VaultId>,
    /// Vaults skipped for any other reason.
    pub failed: Vec<(VaultId, Error)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.failed.is_empty()
    }
}

/// A background save that did not reach the server.
#[derive(Debug)]
pub struct SaveFailure {
    pub vault_id: VaultId,
    pub error: Error,
}

struct LoadedVault {
    descriptor: VaultDescriptor,
    snapshot: Snapshot,
    /// Whether the server holds at least one snapshot.
    has_blob: bool,
    /// Client-wide counter value of the last local mutation.
    generation: u64,
    /// Generation of the last snapshot known to be on the server.
    saved_generation: u64,
}

impl LoadedVault {
    fn new(descriptor: VaultDescriptor, snapshot: Option<Snapshot>) -> Self {
        Self {
            descriptor,
            has_blob: snapshot.is_some(),
            snapshot: snapshot.unwrap_or_default(),
            generation: 0,
            saved_generation: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.generation > self.saved_generation
    }

    fn can_write(&self) -> bool {
        self.descriptor.permission == Permission::Write
    }
}

struct ClientState {
    session: UnlockedSession,
    vaults: BTreeMap<VaultId, LoadedVault>,
}

impl ClientState {
    fn router(&self) -> WriteRouter {
        let own = VaultOwner::User(self.session.user_id().clone());
        let personal = self
            .vaults
            .values()
            .find(|v| v.descriptor.owner == own)
            .map(|v| v.descriptor.id.clone());
        let mut router = WriteRouter::new(personal);
        for vault in self.vaults.values() {
            if let VaultOwner::Team(team_id) = &vault.descriptor.owner {
                router.add_team(team_id.clone(), vault.descriptor.id.clone());
            }
        }
        router
    }

    fn sources(&self) -> Vec<SourcedSnapshot> {
        self.vaults
            .values()
            .map(|v| SourcedSnapshot {
                vault_id: v.descriptor.id.clone(),
                kind: v.descriptor.kind,
                team_id: v.descriptor.team_id.clone(),
                snapshot: v.snapshot.clone(),
            })
            .collect()
    }

    fn writable(&mut self, vault_id: &VaultId) -> Result<&mut LoadedVault> {
        let vault = self
            .vaults
            .get_mut(vault_id)
            .ok_or_else(|| Error::NotFound(format!("vault {}", vault_id)))?;
        if !vault.can_write() {
            return Err(Error::Authorization(format!(
                "read-only access to vault {}",
                vault_id
            )));
        }
        Ok(vault)
    }

    fn team_vault(&self, team_id: &TeamId) -> Result<&LoadedVault> {
        let vault_id = self.router().route(Some(team_id))?.clone();
        self.vaults
            .get(&vault_id)
            .ok_or_else(|| Error::NotFound(format!("vault of team {}", team_id)))
    }

    fn key_of(&self, vault: &LoadedVault) -> Result<VaultKey> {
        self.session
            .vault_key(&vault.descriptor.id, vault.descriptor.key_epoch)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("key of vault {}", vault.descriptor.id)))
    }

    /// Capture what a save of `vault_id` needs, as of now.
    fn save_job(&self, vault_id: &VaultId) -> Result<SaveJob> {
        let vault = self
            .vaults
            .get(vault_id)
            .ok_or_else(|| Error::NotFound(format!("vault {}", vault_id)))?;
        Ok(SaveJob {
            token: self.session.token().clone(),
            vault_id: vault_id.clone(),
            key: self.key_of(vault)?,
            key_epoch: vault.descriptor.key_epoch,
            snapshot: vault.snapshot.clone(),
            generation: vault.generation,
        })
    }

    fn current_key(&self, holder: KeyHolder<'_>) -> Result<(SessionToken, VaultKey, KeyEpoch)> {
        let vault = match holder {
            KeyHolder::Vault(vault_id) => self
                .vaults
                .get(vault_id)
                .ok_or_else(|| Error::NotFound(format!("vault {}", vault_id)))?,
            KeyHolder::Team(team_id) => self.team_vault(team_id)?,
        };
        Ok((
            self.session.token().clone(),
            self.key_of(vault)?,
            vault.descriptor.key_epoch,
        ))
    }
}

/// A vault looked up either directly or as a team's vault.
#[derive(Clone, Copy)]
enum KeyHolder<'a> {
    Vault(&'a VaultId),
    Team(&'a TeamId),
}

/// One background save. Everything is captured while the edit holds the
/// state lock, so a later lock or edit cannot change what gets uploaded.
struct SaveJob {
    token: SessionToken,
    vault_id: VaultId,
    key: VaultKey,
    key_epoch: KeyEpoch,
    snapshot: Snapshot,
    generation: u64,
}

type SharedState = Arc<RwLock<Option<ClientState>>>;

enum Fetched {
    Snapshot(Snapshot),
    Empty,
    Failed(Error),
}

/// The unlocked client.
pub struct VaultClient {
    backend: Arc<dyn VaultBackend>,
    config: ClientConfig,
    identities: IdentityKeyStore,
    share: ShareProtocol,
    rotation: KeyRotation,
    state: SharedState,
    saves: Mutex<JoinSet<std::result::Result<(), SaveFailure>>>,
    /// Per vault: serializes uploads and holds the newest uploaded generation.
    upload_locks: Mutex<HashMap<VaultId, Arc<tokio::sync::Mutex<u64>>>>,
    generations: AtomicU64,
    timer: Mutex<Option<InactivityTimer>>,
}

impl VaultClient {
    pub fn new(backend: Arc<dyn VaultBackend>, config: ClientConfig) -> Self {
        Self {
            identities: IdentityKeyStore::new(backend.clone(), config.kdf_params),
            share: ShareProtocol::new(backend.clone()),
            rotation: KeyRotation::new(backend.clone()),
            backend,
            config,
            state: Arc::new(RwLock::new(None)),
            saves: Mutex::new(JoinSet::new()),
            upload_locks: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            timer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Create the caller's identity, then unlock with it.
    ///
    /// # Errors
    /// - `AlreadyExists` if the user already has an identity
    pub async fn enroll(
        &self,
        user_id: UserId,
        token: SessionToken,
        password: &str,
    ) -> Result<LoadReport> {
        let keys = self.identities.create(&token, password).await?;
        self.open(UnlockedSession::new(user_id, token, keys)).await
    }

    /// Unlock with the identity password and load every accessible vault.
    ///
    /// # Postconditions
    /// - The caller owns exactly one personal vault
    /// - Vaults that failed to load are listed in the report and left out of the view
    ///
    /// # Errors
    /// - `Credential` for a wrong password or a missing identity
    pub async fn unlock(
        &self,
        user_id: UserId,
        token: SessionToken,
        password: &str,
    ) -> Result<LoadReport> {
        let keys = self.identities.unlock(&token, password).await?;
        self.open(UnlockedSession::new(user_id, token, keys)).await
    }

    async fn open(&self, session: UnlockedSession) -> Result<LoadReport> {
        let token = session.token().clone();
        let user_id = session.user_id().clone();
        {
            let mut state = self.state.write().await;
            *state = Some(ClientState {
                session,
                vaults: BTreeMap::new(),
            });
        }

        let result = async {
            self.ensure_personal_vault(&token, &user_id).await?;
            self.reload().await
        }
        .await;
        match result {
            Ok(report) => {
                self.arm_timer();
                info!(
                    user = %user_id,
                    loaded = report.loaded.len(),
                    empty = report.empty.len(),
                    skipped = report.corrupt.len() + report.failed.len(),
                    "unlocked"
                );
                Ok(report)
            }
            Err(e) => {
                self.state.write().await.take();
                Err(e)
            }
        }
    }

    async fn ensure_personal_vault(&self, token: &SessionToken, user_id: &UserId) -> Result<()> {
        let own = VaultOwner::User(user_id.clone());
        let listed = self.backend.list_accessible_vaults(token).await?;
        if listed.iter().any(|d| d.owner == own) {
            return Ok(());
        }

        let key = VaultKey::generate();
        let wrapped = {
            let state = self.state.read().await;
            let state = state.as_ref().ok_or_else(locked)?;
            wrap_key(&state.session.enc_public_key()?, &key)?
        };
        match self.backend.create_vault(token, own, wrapped).await {
            Ok(vault_id) => {
                info!(vault = %vault_id, "personal vault created");
                if let Some(state) = self.state.write().await.as_mut() {
                    state.session.insert_vault_key(vault_id, 0, key);
                }
                Ok(())
            }
            // Another device won the race.
            Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Lock: drop every key and decrypted snapshot now. Saves already
    /// scheduled carry their own copy of what they upload and still finish.
    pub async fn lock(&self) {
        if let Some(timer) = self.timer_slot().take() {
            timer.cancel();
        }
        if self.state.write().await.take().is_some() {
            info!("client locked");
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.state.read().await.is_some()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.session.user_id().clone())
    }

    /// Record user activity, postponing auto-lock.
    pub fn touch(&self) {
        if let Some(timer) = self.timer_slot().as_ref() {
            timer.touch();
        }
    }

    fn timer_slot(&self) -> std::sync::MutexGuard<'_, Option<InactivityTimer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_timer(&self) {
        let Some(after) = self.config.auto_lock_after else {
            return;
        };
        let state: Weak<RwLock<Option<ClientState>>> = Arc::downgrade(&self.state);
        let timer = InactivityTimer::start(after, move || {
            tokio::spawn(async move {
                if let Some(state) = state.upgrade() {
                    if state.write().await.take().is_some() {
                        info!("client auto-locked after inactivity");
                    }
                }
            });
        });
        if let Some(previous) = self.timer_slot().replace(timer) {
            previous.cancel();
        }
    }

    /// Merged view over every loaded vault.
    pub async fn view(&self) -> Result<MergedView> {
        self.touch();
        let state = self.state.read().await;
        let state = state.as_ref().ok_or_else(locked)?;
        Ok(MergeEngine::combine(&state.sources()))
    }

    /// Insert or replace an entry in the vault that owns it.
    ///
    /// The entry goes to its team's vault when `team_id` is set, otherwise to
    /// the personal vault. Returns once the local view is updated; the save
    /// runs in the background.
    ///
    /// # Errors
    /// - `NotFound` if the owning vault is not loaded
    /// - `Authorization` with read-only access to the owning vault
    pub async fn upsert_entry(&self, entry: Entry) -> Result<VaultId> {
        entry.validate()?;
        self.mutate(entry.team_id.clone(), |snapshot| {
            snapshot.upsert_entry(entry);
        })
        .await
    }

    pub async fn upsert_folder(&self, folder: Folder) -> Result<VaultId> {
        folder.validate()?;
        self.mutate(folder.team_id.clone(), |snapshot| {
            snapshot.upsert_folder(folder);
        })
        .await
    }

    /// Delete an entry from every writable vault holding it.
    ///
    /// # Errors
    /// - `NotFound` if no writable vault holds the entry
    pub async fn delete_entry(&self, id: &str) -> Result<Vec<VaultId>> {
        self.remove_everywhere(id, |snapshot, id| snapshot.remove_entry(id).is_some())
            .await
    }

    /// Delete a folder from every writable vault holding it. Its contents move to the root.
    pub async fn delete_folder(&self, id: &str) -> Result<Vec<VaultId>> {
        self.remove_everywhere(id, |snapshot, id| snapshot.remove_folder(id).is_some())
            .await
    }

    async fn mutate(
        &self,
        team_id: Option<TeamId>,
        apply: impl FnOnce(&mut Snapshot),
    ) -> Result<VaultId> {
        self.touch();
        let job = {
            let mut state = self.state.write().await;
            let state = state.as_mut().ok_or_else(locked)?;
            let vault_id = state.router().route(team_id.as_ref())?.clone();
            let vault = state.writable(&vault_id)?;
            apply(&mut vault.snapshot);
            vault.generation = self.next_generation();
            state.save_job(&vault_id)?
        };
        let vault_id = job.vault_id.clone();
        self.schedule_save(job);
        Ok(vault_id)
    }

    async fn remove_everywhere(
        &self,
        id: &str,
        remove: impl Fn(&mut Snapshot, &str) -> bool,
    ) -> Result<Vec<VaultId>> {
        self.touch();
        let jobs: Vec<SaveJob> = {
            let mut state = self.state.write().await;
            let state = state.as_mut().ok_or_else(locked)?;
            let mut touched = Vec::new();
            for vault in state.vaults.values_mut().filter(|v| v.can_write()) {
                if remove(&mut vault.snapshot, id) {
                    vault.generation = self.next_generation();
                    touched.push(vault.descriptor.id.clone());
                }
            }
            touched
                .iter()
                .map(|vault_id| state.save_job(vault_id))
                .collect::<Result<_>>()?
        };
        if jobs.is_empty() {
            return Err(Error::NotFound(format!("item {}", id)));
        }
        let touched = jobs.iter().map(|job| job.vault_id.clone()).collect();
        for job in jobs {
            self.schedule_save(job);
        }
        Ok(touched)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn upload_lock(&self, vault_id: &VaultId) -> Arc<tokio::sync::Mutex<u64>> {
        self.upload_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(vault_id.clone())
            .or_default()
            .clone()
    }

    /// Spawn the upload of a captured snapshot.
    ///
    /// Saves of one vault are serialized, and a save older than one already
    /// uploaded is skipped, so the last upload always carries the latest edit.
    fn schedule_save(&self, job: SaveJob) {
        let backend = self.backend.clone();
        let state = self.state.clone();
        let upload_lock = self.upload_lock(&job.vault_id);

        let mut saves = self.saves.lock().unwrap_or_else(PoisonError::into_inner);
        saves.spawn(async move {
            let mut uploaded = upload_lock.lock().await;
            let (vault_id, generation) = (job.vault_id.clone(), job.generation);
            if *uploaded >= generation {
                debug!(vault = %vault_id, generation, "superseded by a newer save");
                return Ok(());
            }
            match upload_snapshot(backend.as_ref(), &job).await {
                Ok(()) => {
                    *uploaded = generation;
                    mark_saved(&state, &vault_id, generation).await;
                    Ok(())
                }
                Err(error) => Err(SaveFailure { vault_id, error }),
            }
        });
    }

    /// Wait for every scheduled save and return the ones that failed.
    ///
    /// Failed saves are not retried; the edit stays in the local view and
    /// goes out with the vault's next save. A save rejected with `Conflict`
    /// was sealed under a key epoch the server has retired: the client
    /// reloads, which replaces that vault's unsaved edits with the server copy.
    pub async fn flush_saves(&self) -> Vec<SaveFailure> {
        let mut pending = std::mem::take(
            &mut *self.saves.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut failures = Vec::new();
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => {
                    warn!(vault = %failure.vault_id, error = %failure.error, "save failed");
                    failures.push(failure);
                }
                Err(e) => warn!(error = %e, "save task did not complete"),
            }
        }
        let stale = failures.iter().any(|f| matches!(f.error, Error::Conflict(_)));
        if stale && self.is_unlocked().await {
            info!("save rejected at a retired key epoch; reloading");
            if let Err(e) = self.reload().await {
                warn!(error = %e, "reload after rejected save failed");
            }
        }
        failures
    }

    /// Re-list and re-decrypt. Vaults no longer accessible are dropped;
    /// vaults with unsaved local edits keep their local snapshot.
    pub async fn refresh(&self) -> Result<LoadReport> {
        self.touch();
        self.reload().await
    }

    async fn reload(&self) -> Result<LoadReport> {
        let token = {
            let state = self.state.read().await;
            state.as_ref().ok_or_else(locked)?.session.token().clone()
        };

        let mut report = LoadReport::default();
        let (descriptors, keys) = self.unwrap_all(&token, &mut report).await?;

        let mut fetches = JoinSet::new();
        for descriptor in descriptors {
            let Some(key) = keys.get(&descriptor.id).cloned() else {
                continue;
            };
            let backend = self.backend.clone();
            let token = token.clone();
            fetches.spawn(async move {
                let fetched = fetch_snapshot(backend.as_ref(), &token, &descriptor, &key).await;
                (descriptor, fetched)
            });
        }

        let mut fresh = BTreeMap::new();
        while let Some(joined) = fetches.join_next().await {
            let (descriptor, fetched) = joined
                .map_err(|e| Error::Transport(format!("snapshot fetch task failed: {}", e)))?;
            let vault_id = descriptor.id.clone();
            match fetched {
                Fetched::Snapshot(snapshot) => {
                    report.loaded.push(vault_id.clone());
                    fresh.insert(vault_id, LoadedVault::new(descriptor, Some(snapshot)));
                }
                Fetched::Empty => {
                    report.empty.push(vault_id.clone());
                    fresh.insert(vault_id, LoadedVault::new(descriptor, None));
                }
                Fetched::Failed(Error::SnapshotCorrupt { reason, .. }) => {
                    warn!(vault = %vault_id, %reason, "snapshot_corrupt; vault skipped");
                    report.corrupt.push(vault_id);
                }
                Fetched::Failed(e) => {
                    warn!(vault = %vault_id, error = %e, "vault skipped");
                    report.failed.push((vault_id, e));
                }
            }
        }

        let mut state = self.state.write().await;
        let state = state.as_mut().ok_or_else(locked)?;
        for (vault_id, vault) in fresh.iter_mut() {
            if let Some(local) = state.vaults.get(vault_id).filter(|v| v.is_dirty()) {
                if local.descriptor.key_epoch == vault.descriptor.key_epoch {
                    debug!(vault = %vault_id, "keeping unsaved local edits");
                    vault.snapshot = local.snapshot.clone();
                    vault.generation = local.generation;
                    vault.saved_generation = local.saved_generation;
                }
            }
        }
        let keep: Vec<VaultId> = fresh.keys().cloned().collect();
        for dropped in state.vaults.keys().filter(|id| !fresh.contains_key(*id)) {
            info!(vault = %dropped, "vault no longer loaded");
        }
        state.session.retain_vaults(&keep);
        state.vaults = fresh;
        for list in [&mut report.loaded, &mut report.empty, &mut report.corrupt] {
            list.sort();
        }
        Ok(report)
    }

    /// List vaults and unwrap their keys. A `KeyMismatch` triggers a re-list
    /// and one more attempt, up to the configured retries.
    async fn unwrap_all(
        &self,
        token: &SessionToken,
        report: &mut LoadReport,
    ) -> Result<(Vec<VaultDescriptor>, HashMap<VaultId, VaultKey>)> {
        let mut keys = HashMap::new();
        let mut attempts = 0;
        loop {
            let descriptors = self.backend.list_accessible_vaults(token).await?;
            let mut mismatched = Vec::new();
            {
                let mut state = self.state.write().await;
                let state = state.as_mut().ok_or_else(locked)?;
                let pending: Vec<&VaultDescriptor> = descriptors
                    .iter()
                    .filter(|d| !keys.contains_key(&d.id))
                    .collect();
                for descriptor in pending {
                    match state.session.unwrap_vault_key(
                        &descriptor.id,
                        descriptor.key_epoch,
                        &descriptor.wrapped_key_for_caller,
                    ) {
                        Ok(key) => {
                            keys.insert(descriptor.id.clone(), key);
                        }
                        Err(Error::KeyMismatch(reason)) => {
                            mismatched.push((descriptor.id.clone(), reason))
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            if mismatched.is_empty() || attempts >= self.config.key_mismatch_retries {
                for (vault_id, reason) in mismatched {
                    warn!(vault = %vault_id, %reason, "vault key does not open with this identity");
                    report.failed.push((
                        vault_id.clone(),
                        Error::KeyMismatch(format!(
                            "vault {} was not shared with your current identity; ask its owner to share it again",
                            vault_id
                        )),
                    ));
                }
                return Ok((descriptors, keys));
            }
            attempts += 1;
            debug!(count = mismatched.len(), "key mismatch; re-fetching vault list");
        }
    }

    /// Share a vault this client can manage with another user.
    pub async fn share_with_user(
        &self,
        vault_id: &VaultId,
        user_id: &UserId,
        permission: Permission,
    ) -> Result<()> {
        self.touch();
        self.with_current_key(KeyHolder::Vault(vault_id), |token, key, epoch| async move {
            self.share
                .share_with_user(&token, vault_id, &key, epoch, user_id, permission)
                .await
        })
        .await
    }

    /// Share a vault with every active member of a team.
    pub async fn share_with_team(
        &self,
        vault_id: &VaultId,
        team_id: &TeamId,
        permission: Permission,
    ) -> Result<()> {
        self.touch();
        self.with_current_key(KeyHolder::Vault(vault_id), |token, key, epoch| async move {
            self.share
                .share_with_team(&token, vault_id, &key, epoch, team_id, permission)
                .await
        })
        .await
    }

    /// Run `op` with the vault's key as this client knows it. If the server
    /// has moved to a newer key epoch, reload and run it once more.
    async fn with_current_key<F, Fut>(&self, holder: KeyHolder<'_>, op: F) -> Result<()>
    where
        F: Fn(SessionToken, VaultKey, KeyEpoch) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (token, key, epoch) = self.key_for(holder).await?;
        match op(token, key, epoch).await {
            Err(Error::Conflict(reason)) => {
                debug!(epoch, %reason, "key epoch moved on; reloading before one retry");
                self.reload().await?;
                let (token, key, epoch) = self.key_for(holder).await?;
                op(token, key, epoch).await
            }
            other => other,
        }
    }

    async fn key_for(&self, holder: KeyHolder<'_>) -> Result<(SessionToken, VaultKey, KeyEpoch)> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or_else(locked)?;
        state.current_key(holder)
    }

    /// Create a team and its vault, with the caller as owner.
    pub async fn create_team(&self, team_id: &TeamId) -> Result<VaultId> {
        self.touch();
        let key = VaultKey::generate();
        let (token, wrapped) = {
            let state = self.state.read().await;
            let state = state.as_ref().ok_or_else(locked)?;
            (
                state.session.token().clone(),
                wrap_key(&state.session.enc_public_key()?, &key)?,
            )
        };
        let vault_id = self
            .backend
            .create_vault(&token, VaultOwner::Team(team_id.clone()), wrapped)
            .await?;
        if let Some(state) = self.state.write().await.as_mut() {
            state.session.insert_vault_key(vault_id.clone(), 0, key);
        }
        self.reload().await?;
        info!(team = %team_id, vault = %vault_id, "team created");
        Ok(vault_id)
    }

    /// Invite a user into a team the caller manages.
    pub async fn invite_member(&self, team_id: &TeamId, user_id: &UserId, role: TeamRole) -> Result<()> {
        self.touch();
        self.with_current_key(KeyHolder::Team(team_id), |token, key, epoch| async move {
            self.share
                .invite(&token, team_id, &key, epoch, user_id, role)
                .await
        })
        .await
    }

    /// Accept a pending invitation and load the team's vault.
    pub async fn accept_invitation(&self, team_id: &TeamId) -> Result<LoadReport> {
        self.touch();
        let token = self.token().await?;
        self.share.accept(&token, team_id).await?;
        self.reload().await
    }

    /// Revoke a member without rotating. Keys the member already unwrapped stay valid.
    pub async fn revoke_member(&self, team_id: &TeamId, user_id: &UserId) -> Result<()> {
        self.touch();
        let token = self.token().await?;
        self.share.revoke(&token, team_id, user_id).await
    }

    /// Revoke a member and rotate the team key.
    pub async fn remove_member(&self, team_id: &TeamId, user_id: &UserId) -> Result<RotatedKey> {
        self.touch();
        let (token, team, snapshot) = self.prepare_rotation(team_id).await?;
        let rotated = self
            .rotation
            .remove_member(&token, &team, user_id, snapshot.as_ref())
            .await?;
        self.install_rotation(&team, &rotated).await;
        Ok(rotated)
    }

    /// Move a team to a fresh key epoch.
    pub async fn rotate_team_key(&self, team_id: &TeamId) -> Result<RotatedKey> {
        self.touch();
        let (token, team, snapshot) = self.prepare_rotation(team_id).await?;
        let rotated = self
            .rotation
            .rotate_team_key(&token, &team, snapshot.as_ref())
            .await?;
        self.install_rotation(&team, &rotated).await;
        Ok(rotated)
    }

    async fn prepare_rotation(
        &self,
        team_id: &TeamId,
    ) -> Result<(SessionToken, TeamVaultRef, Option<Snapshot>)> {
        // Pending saves are sealed under the current epoch; land them first.
        if let Some(failure) = self.flush_saves().await.into_iter().next() {
            return Err(failure.error);
        }
        let state = self.state.read().await;
        let state = state.as_ref().ok_or_else(locked)?;
        let vault = state.team_vault(team_id)?;
        let team = TeamVaultRef {
            team_id: team_id.clone(),
            vault_id: vault.descriptor.id.clone(),
            key_epoch: vault.descriptor.key_epoch,
        };
        let snapshot = (vault.has_blob || vault.is_dirty()).then(|| vault.snapshot.clone());
        Ok((state.session.token().clone(), team, snapshot))
    }

    async fn install_rotation(&self, team: &TeamVaultRef, rotated: &RotatedKey) {
        if let Some(state) = self.state.write().await.as_mut() {
            state
                .session
                .insert_vault_key(team.vault_id.clone(), rotated.epoch, rotated.key.clone());
            if let Some(vault) = state.vaults.get_mut(&team.vault_id) {
                vault.descriptor.key_epoch = rotated.epoch;
                vault.saved_generation = vault.generation;
            }
        }
    }

    /// Destroy the caller's identity on the server, then lock.
    pub async fn reset_identity(&self, confirmation: &str) -> Result<()> {
        let token = self.token().await?;
        self.identities.reset(&token, confirmation).await?;
        self.lock().await;
        Ok(())
    }

    async fn token(&self) -> Result<SessionToken> {
        let state = self.state.read().await;
        Ok(state.as_ref().ok_or_else(locked)?.session.token().clone())
    }

    /// Start the live event stream; relevant events refresh this client.
    pub async fn start_live_sync(self: &Arc<Self>) -> Result<EventStream> {
        let token = self.token().await?;
        let source = BackendSource::new(self.backend.clone(), token);
        Ok(EventStream::spawn(
            Arc::new(source),
            Arc::new(RefreshOnChange::new(self.clone())),
            self.config.stream_config(),
        ))
    }

    async fn refresh_vault(&self, vault_id: &VaultId) -> Result<()> {
        let target = {
            let state = self.state.read().await;
            match state.as_ref() {
                None => return Ok(()),
                Some(state) => match state.vaults.get(vault_id) {
                    None => None,
                    Some(vault) if vault.is_dirty() => {
                        debug!(vault = %vault_id, "local edits pending; skipping refresh");
                        return Ok(());
                    }
                    Some(vault) => Some((
                        state.session.token().clone(),
                        vault.descriptor.clone(),
                        state.key_of(vault)?,
                    )),
                },
            }
        };
        // An unknown vault was just shared with us.
        let Some((token, descriptor, key)) = target else {
            return self.reload().await.map(|_| ());
        };

        match fetch_snapshot(self.backend.as_ref(), &token, &descriptor, &key).await {
            Fetched::Snapshot(snapshot) => {
                if let Some(state) = self.state.write().await.as_mut() {
                    if let Some(vault) = state.vaults.get_mut(vault_id).filter(|v| !v.is_dirty()) {
                        vault.snapshot = snapshot;
                        vault.has_blob = true;
                    }
                }
                Ok(())
            }
            Fetched::Empty => Ok(()),
            // A newer epoch or lost access: re-list everything.
            Fetched::Failed(Error::SnapshotCorrupt { .. }) | Fetched::Failed(Error::Authorization(_)) => {
                self.reload().await.map(|_| ())
            }
            Fetched::Failed(e) => Err(e),
        }
    }
}

#[async_trait]
impl ChangeTarget for VaultClient {
    async fn apply_change(&self, event: &ChangeEvent) -> Result<()> {
        let Some(user_id) = self.user_id().await else {
            return Ok(());
        };
        match (event.kind, &event.vault_id) {
            (EventKind::IdentityReset, _) if event.actor_user_id == user_id => {
                warn!("identity was reset elsewhere; locking");
                self.lock().await;
                Ok(())
            }
            (EventKind::VaultUpdate, Some(vault_id)) => self.refresh_vault(vault_id).await,
            _ => self.reload().await.map(|_| ()),
        }
    }

    async fn resync(&self) -> Result<()> {
        if !self.is_unlocked().await {
            return Ok(());
        }
        self.reload().await.map(|_| ())
    }
}

async fn upload_snapshot(backend: &dyn VaultBackend, job: &SaveJob) -> Result<()> {
    let bytes = SnapshotCodec::seal_for(&job.vault_id, job.key_epoch, &job.key, &job.snapshot)?;
    backend
        .upload_blob(&job.token, &job.vault_id, NewBlob::new(bytes, job.key_epoch))
        .await?;
    debug!(vault = %job.vault_id, generation = job.generation, epoch = job.key_epoch, "snapshot saved");
    Ok(())
}

/// Record an upload in the live state, if the client is still unlocked.
async fn mark_saved(state: &SharedState, vault_id: &VaultId, generation: u64) {
    if let Some(state) = state.write().await.as_mut() {
        if let Some(vault) = state.vaults.get_mut(vault_id) {
            vault.saved_generation = vault.saved_generation.max(generation);
            vault.has_blob = true;
        }
    }
}

async fn fetch_snapshot(
    backend: &dyn VaultBackend,
    token: &SessionToken,
    descriptor: &VaultDescriptor,
    key: &VaultKey,
) -> Fetched {
    match backend.fetch_latest_blob(token, &descriptor.id).await {
        Ok(Some(blob)) => {
            match SnapshotCodec::open_for(&descriptor.id, descriptor.key_epoch, key, &blob) {
                Ok(snapshot) => Fetched::Snapshot(snapshot),
                Err(e) => Fetched::Failed(e),
            }
        }
        Ok(None) => {
            debug!(vault = %descriptor.id, "no snapshot yet");
            Fetched::Empty
        }
        Err(e) => Fetched::Failed(e),
    }
}

fn locked() -> Error {
    Error::Authorization("client is locked".to_string())
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
