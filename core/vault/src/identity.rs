//! Server-held identity: creation, unlock and reset.

use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use teamvault_common::{Error, Result};
use teamvault_crypto::{derive_key, IdentityKeys, KdfParams, KeyBundle, PublicIdentity, Salt};
use teamvault_storage::{IdentityRecord, SessionToken, VaultBackend};

/// Phrase a caller must pass verbatim to [`IdentityKeyStore::reset`].
pub const RESET_CONFIRMATION: &str = "reset my identity and lose all shared access";

/// Creates and opens the caller's identity keypairs.
pub struct IdentityKeyStore {
    backend: Arc<dyn VaultBackend>,
    kdf_params: KdfParams,
}

impl IdentityKeyStore {
    /// `kdf_params` apply to newly created bundles and to the decoy
    /// derivation spent when no identity exists.
    pub fn new(backend: Arc<dyn VaultBackend>, kdf_params: KdfParams) -> Self {
        Self {
            backend,
            kdf_params,
        }
    }

    /// Generate keypairs, seal them under `password` and publish.
    ///
    /// # Errors
    /// - `AlreadyExists` if the caller already has an identity
    /// - `InvalidInput` for an empty password
    pub async fn create(&self, session: &SessionToken, password: &str) -> Result<IdentityKeys> {
        if password.is_empty() {
            return Err(Error::InvalidInput("Password cannot be empty".to_string()));
        }
        if self.backend.fetch_identity(session).await?.is_some() {
            return Err(Error::AlreadyExists("identity".to_string()));
        }

        let password = Zeroizing::new(password.as_bytes().to_vec());
        let params = self.kdf_params;
        let (keys, bundle) = tokio::task::spawn_blocking(move || -> Result<_> {
            let keys = IdentityKeys::generate();
            let bundle = KeyBundle::seal(&keys, &password, &params)?;
            Ok((keys, bundle))
        })
        .await
        .map_err(|e| Error::Crypto(format!("key derivation task failed: {}", e)))??;

        let public = keys.public();
        self.backend
            .publish_identity(
                session,
                IdentityRecord {
                    sign_public_key: public.sign_public_key.to_vec(),
                    enc_public_key: public.enc_public_key.to_vec(),
                    encrypted_bundle: bundle.to_bytes()?,
                },
            )
            .await?;
        info!("identity created");
        Ok(keys)
    }

    /// Open the caller's identity with `password`.
    ///
    /// A wrong password, a tampered bundle and a missing identity all fail
    /// with `Credential` after a full key derivation.
    pub async fn unlock(&self, session: &SessionToken, password: &str) -> Result<IdentityKeys> {
        let password = Zeroizing::new(password.as_bytes().to_vec());
        let record = match self.backend.fetch_identity(session).await? {
            Some(record) => record,
            None => {
                self.spend_decoy_derivation(password).await;
                return Err(Error::Credential);
            }
        };

        let bundle = match KeyBundle::from_bytes(&record.encrypted_bundle) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %e, "stored key bundle is unreadable");
                self.spend_decoy_derivation(password).await;
                return Err(Error::Credential);
            }
        };

        let keys = tokio::task::spawn_blocking(move || bundle.open(&password))
            .await
            .map_err(|e| Error::Crypto(format!("key derivation task failed: {}", e)))??;

        let published = PublicIdentity::from_slices(&record.sign_public_key, &record.enc_public_key)
            .map_err(|_| Error::Credential)?;
        if keys.public() != published {
            warn!("key bundle does not match the published public keys");
            return Err(Error::Credential);
        }
        debug!("identity unlocked");
        Ok(keys)
    }

    /// Discard the caller's identity on the server.
    ///
    /// Every vault key wrapped for the old identity becomes unrecoverable,
    /// and the personal vault is retired.
    ///
    /// # Errors
    /// - `InvalidInput` unless `confirmation` equals [`RESET_CONFIRMATION`]
    pub async fn reset(&self, session: &SessionToken, confirmation: &str) -> Result<()> {
        if confirmation != RESET_CONFIRMATION {
            return Err(Error::InvalidInput(
                "identity reset was not confirmed".to_string(),
            ));
        }
        self.backend.reset_identity(session).await?;
        warn!("identity reset");
        Ok(())
    }

    async fn spend_decoy_derivation(&self, password: Zeroizing<Vec<u8>>) {
        let params = self.kdf_params;
        let _ = tokio::task::spawn_blocking(move || {
            let password: &[u8] = if password.is_empty() { b"-" } else { &password };
            derive_key(password, &Salt::generate(), &params)
        })
        .await;
    }
}
