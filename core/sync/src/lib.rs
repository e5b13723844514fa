//! TeamVault live sync
//!
//! Client side of the change-event channel:
//! - Reconnect policy with exponential backoff and jitter
//! - Event stream state machine with heartbeat-timeout detection
//! - Handlers that turn events into refreshes of the local view

pub mod live;
pub mod retry;
pub mod stream;

pub use live::{ChangeTarget, RefreshOnChange};
pub use retry::ReconnectPolicy;
pub use stream::{BackendSource, EventHandler, EventSource, EventStream, StreamConfig, StreamState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let config = StreamConfig::default();
        assert!(config.reconnect.allows(0));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("heartbeatTimeout"));
    }
}
