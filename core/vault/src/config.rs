//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use teamvault_common::{Error, Result};
use teamvault_crypto::KdfParams;
use teamvault_sync::{ReconnectPolicy, StreamConfig};

/// Settings of a [`VaultClient`](crate::VaultClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Parameters used when sealing a new identity bundle. Existing bundles
    /// carry their own.
    pub kdf_params: KdfParams,
    /// Lock after this much inactivity. `None` disables auto-lock.
    #[serde(default, with = "opt_secs")]
    pub auto_lock_after: Option<Duration>,
    /// Re-list attempts after a `KeyMismatch` during unwrap.
    pub key_mismatch_retries: u32,
    pub reconnect: ReconnectPolicy,
    #[serde(with = "secs")]
    pub heartbeat_timeout: Duration,
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            kdf_params: KdfParams::default(),
            auto_lock_after: Some(Duration::from_secs(15 * 60)),
            key_mismatch_retries: 1,
            reconnect: ReconnectPolicy::default(),
            heartbeat_timeout: Duration::from_secs(45),
        }
    }
}

impl ClientConfig {
    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }

    pub fn with_auto_lock(mut self, after: Option<Duration>) -> Self {
        self.auto_lock_after = after;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Settings for the live event stream.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            reconnect: self.reconnect.clone(),
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }

    /// Check the configuration before use.
    pub fn validate(&self) -> Result<()> {
        self.kdf_params.validate()?;
        if self.heartbeat_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "heartbeat timeout must be positive".to_string(),
            ));
        }
        if self.auto_lock_after.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidInput(
                "auto-lock delay must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize and validate configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = ClientConfig::default()
            .with_kdf_params(KdfParams::moderate())
            .with_auto_lock(None);

        let json = config.to_json().unwrap();
        assert!(json.contains("autoLockAfter"));
        let restored = ClientConfig::from_json(&json).unwrap();

        assert_eq!(restored.kdf_params, KdfParams::moderate());
        assert_eq!(restored.auto_lock_after, None);
        assert_eq!(restored.heartbeat_timeout, config.heartbeat_timeout);
    }

    #[test]
    fn test_zero_auto_lock_rejected() {
        let mut config = ClientConfig::default();
        config.auto_lock_after = Some(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_stream_config_carries_policy() {
        let config = ClientConfig::default().with_reconnect(ReconnectPolicy::new(2));
        let stream = config.stream_config();
        assert!(stream.reconnect.allows(1));
        assert!(!stream.reconnect.allows(2));
    }
}
