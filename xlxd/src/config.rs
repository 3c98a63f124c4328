//! Daemon configuration.

use std::time::Duration;

use tracing::Level;

use crate::operation::EngineConfig;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// REST listen address.
    pub listen: String,
    pub engine: EngineConfig,
    /// Per-listener event buffer.
    pub event_buffer: usize,
    /// Bearer token trusted callers present. `None` trusts everyone.
    pub trust_token: Option<String>,
    /// Log records at or above this level are published as `logging` events.
    pub log_events_level: Level,
    /// How long shutdown waits for in-flight operations.
    pub shutdown_timeout: Duration,
    /// Simulated latency of every container action.
    pub backend_latency: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8443".to_string(),
            engine: EngineConfig::default(),
            event_buffer: 256,
            trust_token: None,
            log_events_level: Level::INFO,
            shutdown_timeout: Duration::from_secs(30),
            backend_latency: Duration::from_millis(200),
        }
    }
}
