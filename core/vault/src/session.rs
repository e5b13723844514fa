//! Unlocked client session.
//!
//! Holds the identity secrets and unwrapped vault keys in memory.
//! Keys are zeroized when the session is locked or dropped.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use teamvault_common::{Error, KeyEpoch, Result, UserId, VaultId, WrappedKey};
use teamvault_crypto::{unwrap_key, IdentityKeys, PublicKey, VaultKey};
use teamvault_storage::SessionToken;

/// State of the client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Keys are available.
    Active,
    /// Keys have been cleared.
    Locked,
}

/// Decrypted key material for one signed-in user.
pub struct UnlockedSession {
    user_id: UserId,
    token: SessionToken,
    identity: Option<IdentityKeys>,
    vault_keys: HashMap<(VaultId, KeyEpoch), VaultKey>,
    state: SessionState,
}

impl UnlockedSession {
    pub fn new(user_id: UserId, token: SessionToken, identity: IdentityKeys) -> Self {
        Self {
            user_id,
            token,
            identity: Some(identity),
            vault_keys: HashMap::new(),
            state: SessionState::Active,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Identity secrets, if the session is active.
    ///
    /// # Errors
    /// - `Authorization` if the session is locked
    pub fn identity(&self) -> Result<&IdentityKeys> {
        match self.state {
            SessionState::Active => self
                .identity
                .as_ref()
                .ok_or_else(|| Error::Authorization("identity keys not available".to_string())),
            SessionState::Locked => Err(Error::Authorization("session is locked".to_string())),
        }
    }

    /// Own encryption public key, for wrapping keys to oneself.
    pub fn enc_public_key(&self) -> Result<PublicKey> {
        Ok(self.identity()?.enc_public_key())
    }

    /// Cached key of a vault at a given epoch.
    pub fn vault_key(&self, vault_id: &VaultId, epoch: KeyEpoch) -> Option<&VaultKey> {
        self.vault_keys.get(&(vault_id.clone(), epoch))
    }

    /// Return the cached key for `(vault_id, epoch)`, unwrapping `wrapped`
    /// on a miss. Keys of older epochs of the same vault are evicted.
    ///
    /// # Errors
    /// - `Authorization` if the session is locked
    /// - `KeyMismatch` if `wrapped` was not sealed for this identity
    pub fn unwrap_vault_key(
        &mut self,
        vault_id: &VaultId,
        epoch: KeyEpoch,
        wrapped: &WrappedKey,
    ) -> Result<VaultKey> {
        if let Some(key) = self.vault_key(vault_id, epoch) {
            return Ok(key.clone());
        }
        let identity = self.identity()?;
        let key = unwrap_key(&identity.enc_public_key(), identity.enc_secret_key(), wrapped)?;

        self.vault_keys
            .retain(|(cached, cached_epoch), _| cached != vault_id || *cached_epoch > epoch);
        self.vault_keys
            .insert((vault_id.clone(), epoch), key.clone());
        debug!(vault = %vault_id, epoch, "vault key unwrapped");
        Ok(key)
    }

    /// Remember a key this client generated itself.
    pub fn insert_vault_key(&mut self, vault_id: VaultId, epoch: KeyEpoch, key: VaultKey) {
        self.vault_keys.insert((vault_id, epoch), key);
    }

    /// Forget the keys of vaults not in `keep`.
    pub fn retain_vaults(&mut self, keep: &[VaultId]) {
        self.vault_keys.retain(|(vault_id, _), _| keep.contains(vault_id));
    }

    /// Lock the session, clearing all keys from memory.
    ///
    /// # Postconditions
    /// - Identity secrets and vault keys are zeroized and removed
    /// - Session state is Locked
    pub fn lock(&mut self) {
        if self.state == SessionState::Locked {
            return;
        }
        // Dropping zeroizes.
        self.identity = None;
        self.vault_keys.clear();
        self.state = SessionState::Locked;
        info!(user = %self.user_id, "session locked");
    }
}

impl Drop for UnlockedSession {
    fn drop(&mut self) {
        self.lock();
    }
}

/// Fires a callback after a period without activity.
///
/// One background task per timer. [`touch`](Self::touch) pushes the deadline
/// out; [`cancel`](Self::cancel) or dropping the timer stops the task.
pub struct InactivityTimer {
    deadline: watch::Sender<Instant>,
    after: Duration,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl InactivityTimer {
    /// Start a timer that runs `on_idle` once, `after` the last activity.
    pub fn start<F>(after: Duration, on_idle: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (deadline, mut rx) = watch::channel(Instant::now() + after);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let current = *rx.borrow_and_update();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep_until(current) => {
                        debug!("inactivity deadline reached");
                        on_idle();
                        return;
                    }
                }
            }
        });

        Self {
            deadline,
            after,
            cancel,
            task,
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.deadline.send_replace(Instant::now() + self.after);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the timer has fired or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
