//! Sealing vault keys to a recipient's public encryption key.
//!
//! Uses anonymous sealed boxes (ephemeral X25519 + XSalsa20-Poly1305), so
//! anyone holding a recipient's public key can grant access without a
//! sender keypair, and only the recipient can open it.

use crypto_box::{PublicKey, SecretKey};
use subtle::ConstantTimeEq;

use crate::keys::VaultKey;
use teamvault_common::{Error, Result, WrappedKey};

/// Seal a vault key for `recipient`.
pub fn wrap_key(recipient: &PublicKey, key: &VaultKey) -> Result<WrappedKey> {
    let sealed = recipient
        .seal(&mut rand::rngs::OsRng, key.as_bytes())
        .map_err(|e| Error::Crypto(format!("Sealing vault key failed: {}", e)))?;
    Ok(WrappedKey::from_bytes(sealed))
}

/// Open a sealed vault key with the caller's own keypair.
///
/// # Errors
/// - `KeyMismatch` if `own_secret` does not belong to `own_public`, or the
///   key was sealed for a different recipient (e.g. a stale team key epoch)
/// - `Crypto` if the opened payload is not a vault key
pub fn unwrap_key(
    own_public: &PublicKey,
    own_secret: &SecretKey,
    wrapped: &WrappedKey,
) -> Result<VaultKey> {
    let derived = own_secret.public_key();
    if !bool::from(derived.as_bytes()[..].ct_eq(&own_public.as_bytes()[..])) {
        return Err(Error::KeyMismatch(
            "secret key does not match the supplied public key".to_string(),
        ));
    }

    let opened = zeroize::Zeroizing::new(own_secret.unseal(wrapped.as_bytes()).map_err(|_| {
        Error::KeyMismatch("wrapped key was sealed for a different keypair".to_string())
    })?);
    VaultKey::from_slice(&opened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let alice = IdentityKeys::generate();
        let key = VaultKey::generate();

        let wrapped = wrap_key(&alice.enc_public_key(), &key).unwrap();
        let opened = unwrap_key(&alice.enc_public_key(), alice.enc_secret_key(), &wrapped).unwrap();

        assert_eq!(opened, key);
    }

    #[test]
    fn test_other_user_cannot_unwrap() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();
        let wrapped = wrap_key(&alice.enc_public_key(), &VaultKey::generate()).unwrap();

        let result = unwrap_key(&bob.enc_public_key(), bob.enc_secret_key(), &wrapped);
        assert!(matches!(result, Err(Error::KeyMismatch(_))));
    }

    #[test]
    fn test_mismatched_keypair_detected() {
        let alice = IdentityKeys::generate();
        let bob = IdentityKeys::generate();
        let wrapped = wrap_key(&alice.enc_public_key(), &VaultKey::generate()).unwrap();

        let result = unwrap_key(&alice.enc_public_key(), bob.enc_secret_key(), &wrapped);
        assert!(matches!(result, Err(Error::KeyMismatch(_))));
    }

    #[test]
    fn test_tampered_wrap_fails() {
        let alice = IdentityKeys::generate();
        let wrapped = wrap_key(&alice.enc_public_key(), &VaultKey::generate()).unwrap();
        let mut bytes = wrapped.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let result = unwrap_key(
            &alice.enc_public_key(),
            alice.enc_secret_key(),
            &WrappedKey::from_bytes(bytes),
        );
        assert!(matches!(result, Err(Error::KeyMismatch(_))));
    }

    #[test]
    fn test_wraps_are_randomized() {
        let alice = IdentityKeys::generate();
        let key = VaultKey::generate();

        let w1 = wrap_key(&alice.enc_public_key(), &key).unwrap();
        let w2 = wrap_key(&alice.enc_public_key(), &key).unwrap();
        assert_ne!(w1, w2);
    }
}
