//! Bearer-session issuance and validation.
//!
//! A token is `"{session_id}.{tag}"` where `tag` is a keyed BLAKE2b MAC over
//! the session id under a server secret. The tag check and the session lookup
//! are independent layers: revoking a session flips a flag on its record and
//! leaves the token's cryptographic validity untouched.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroize::Zeroizing;

use teamvault_common::{Error, Result, UserId};

const SECRET_LENGTH: usize = 32;

/// Opaque bearer token handed to clients at login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wrap a token string received from a client.
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn session_id(&self) -> Option<&str> {
        self.0.split_once('.').map(|(id, _)| id)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken([REDACTED])")
    }
}

/// Session lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Time after issuance at which a session stops validating.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(12 * 60 * 60),
        }
    }
}

impl SessionConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    user_id: UserId,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

/// Issues and validates bearer sessions.
pub struct SessionGuard {
    secret: Zeroizing<[u8; SECRET_LENGTH]>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    config: SessionConfig,
}

impl SessionGuard {
    /// Create a guard with a fresh random MAC secret.
    pub fn new(config: SessionConfig) -> Self {
        let mut secret = Zeroizing::new([0u8; SECRET_LENGTH]);
        rand::rngs::OsRng.fill_bytes(secret.as_mut());
        Self {
            secret,
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn tag(&self, session_id: &str) -> Result<Vec<u8>> {
        let mut mac = <Blake2bMac<U32> as Mac>::new_from_slice(self.secret.as_ref())
            .map_err(|e| Error::Crypto(format!("Session MAC init failed: {}", e)))?;
        mac.update(session_id.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Issue a new session for an already-authenticated user.
    pub async fn issue(&self, user_id: UserId) -> Result<SessionToken> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let tag = URL_SAFE_NO_PAD.encode(self.tag(&session_id)?);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.config.ttl)
                .map_err(|e| Error::InvalidInput(format!("Session TTL out of range: {}", e)))?;

        self.sessions.write().await.insert(
            session_id.clone(),
            SessionRecord {
                user_id: user_id.clone(),
                expires_at,
                revoked_at: None,
            },
        );
        info!(user = %user_id, "session issued");
        Ok(SessionToken(format!("{}.{}", session_id, tag)))
    }

    /// Check a token at this point in time and return its user.
    ///
    /// # Errors
    /// - `Authorization` if the tag does not verify, or the session is
    ///   unknown, revoked or expired
    pub async fn validate(&self, token: &SessionToken) -> Result<UserId> {
        let (session_id, tag) = token
            .0
            .split_once('.')
            .ok_or_else(|| Error::Authorization("malformed session token".to_string()))?;
        let presented = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| Error::Authorization("malformed session token".to_string()))?;
        let expected = self.tag(session_id)?;
        if !bool::from(presented.as_slice().ct_eq(expected.as_slice())) {
            return Err(Error::Authorization("invalid session token".to_string()));
        }

        let sessions = self.sessions.read().await;
        let record = sessions
            .get(session_id)
            .ok_or_else(|| Error::Authorization("unknown session".to_string()))?;
        if record.revoked_at.is_some() {
            return Err(Error::Authorization("session revoked".to_string()));
        }
        if Utc::now() >= record.expires_at {
            return Err(Error::Authorization("session expired".to_string()));
        }
        Ok(record.user_id.clone())
    }

    /// Revoke one session. Revoking twice is a no-op.
    pub async fn revoke(&self, token: &SessionToken) -> Result<()> {
        let session_id = token
            .session_id()
            .ok_or_else(|| Error::Authorization("malformed session token".to_string()))?;
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound("session".to_string()))?;
        if record.revoked_at.is_none() {
            record.revoked_at = Some(Utc::now());
            debug!(user = %record.user_id, "session revoked");
        }
        Ok(())
    }

    /// Revoke every live session of `user_id`, returning how many were revoked.
    pub async fn revoke_all(&self, user_id: &UserId) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let mut revoked = 0;
        for record in sessions.values_mut() {
            if &record.user_id == user_id && record.revoked_at.is_none() {
                record.revoked_at = Some(now);
                revoked += 1;
            }
        }
        info!(user = %user_id, revoked, "all sessions revoked");
        revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SessionGuard {
        SessionGuard::new(SessionConfig::default())
    }

    fn user(name: &str) -> UserId {
        UserId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_issue_and_validate() {
        let guard = guard();
        let token = guard.issue(user("alice")).await.unwrap();
        assert_eq!(guard.validate(&token).await.unwrap(), user("alice"));
    }

    #[tokio::test]
    async fn test_tampered_tag_rejected() {
        let guard = guard();
        let token = guard.issue(user("alice")).await.unwrap();
        let (id, _) = token.as_str().split_once('.').unwrap();
        let forged = SessionToken::from_string(format!("{}.{}", id, URL_SAFE_NO_PAD.encode([0u8; 32])));

        assert!(matches!(
            guard.validate(&forged).await,
            Err(Error::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn test_token_from_other_guard_rejected() {
        let token = guard().issue(user("alice")).await.unwrap();
        assert!(guard().validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_token_rejected() {
        let guard = guard();
        let result = guard.validate(&SessionToken::from_string("no-dot")).await;
        assert!(matches!(result, Err(Error::Authorization(_))));
    }

    #[tokio::test]
    async fn test_revoked_session_rejected() {
        let guard = guard();
        let token = guard.issue(user("alice")).await.unwrap();
        guard.revoke(&token).await.unwrap();
        guard.revoke(&token).await.unwrap();

        assert!(matches!(
            guard.validate(&token).await,
            Err(Error::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn test_revoke_all_leaves_other_users() {
        let guard = guard();
        let a1 = guard.issue(user("alice")).await.unwrap();
        let a2 = guard.issue(user("alice")).await.unwrap();
        let b = guard.issue(user("bob")).await.unwrap();

        assert_eq!(guard.revoke_all(&user("alice")).await, 2);
        assert!(guard.validate(&a1).await.is_err());
        assert!(guard.validate(&a2).await.is_err());
        assert!(guard.validate(&b).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_session_rejected() {
        let guard = SessionGuard::new(SessionConfig::default().with_ttl(Duration::ZERO));
        let token = guard.issue(user("alice")).await.unwrap();
        assert!(guard.validate(&token).await.is_err());
    }

    #[test]
    fn test_token_debug_redacts() {
        let token = SessionToken::from_string("abc.def");
        assert_eq!(format!("{:?}", token), "SessionToken([REDACTED])");
    }
}
