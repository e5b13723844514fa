//! Bounded exponential backoff for event-stream reconnection.
//!
//! Reconnection is the only automatically retried path in the client;
//! credential, authorization and save failures are never retried.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use teamvault_common::Error;

/// Reconnect behavior of an event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Attempts after a disconnect before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomize each delay by +/- 25%.
    pub jitter: bool,
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            capped_delay * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Whether a connect failure is worth another attempt.
    ///
    /// Authorization and credential failures end the stream immediately.
    pub fn should_retry(&self, error: &Error) -> bool {
        error.is_retryable()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let policy = ReconnectPolicy::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = ReconnectPolicy::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = ReconnectPolicy::new(3).with_initial_delay(Duration::from_millis(1000));
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0).as_millis();
            assert!((750..=1250).contains(&delay));
        }
    }

    #[test]
    fn test_bounded_attempts() {
        let policy = ReconnectPolicy::new(2);
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn test_only_transport_failures_retry() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(&Error::Transport("down".to_string())));
        assert!(!policy.should_retry(&Error::Authorization("revoked".to_string())));
        assert!(!policy.should_retry(&Error::Credential));
    }

    #[test]
    fn test_json_roundtrip() {
        let policy = ReconnectPolicy::new(4).with_initial_delay(Duration::from_millis(250));
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"initialDelay\":250"));
        assert_eq!(serde_json::from_str::<ReconnectPolicy>(&json).unwrap(), policy);
    }
}
