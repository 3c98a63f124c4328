//! Wires engine, event bus, backend and REST router together.

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{Backend, DevBackend};
use crate::config::DaemonConfig;
use crate::events::EventBus;
use crate::operation::Engine;
use crate::rest::{AppState, create_router};

pub struct Daemon {
    config: DaemonConfig,
    state: Arc<AppState>,
    reaper: JoinHandle<()>,
}

impl Daemon {
    /// Start a daemon on the in-memory development backend.
    ///
    /// Must be called within a tokio runtime; the reaper starts immediately.
    pub fn new(config: DaemonConfig, events: EventBus) -> Self {
        let backend = Arc::new(DevBackend::new(events.clone(), config.backend_latency));
        Self::with_backend(config, events, backend)
    }

    pub fn with_backend(config: DaemonConfig, events: EventBus, backend: Arc<dyn Backend>) -> Self {
        let engine = Engine::new(config.engine.clone(), events);
        let reaper = engine.spawn_reaper();
        let state = Arc::new(AppState {
            engine,
            backend,
            trust_token: config.trust_token.clone(),
        });
        Self {
            config,
            state,
            reaper,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.state.engine
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    pub fn router(&self) -> Router {
        create_router(self.state())
    }

    /// Drain in-flight operations and stop the reaper.
    pub async fn shutdown(self) {
        info!(
            timeout_secs = self.config.shutdown_timeout.as_secs(),
            "Shutting down operation engine"
        );
        let remaining = self
            .state
            .engine
            .shutdown(self.config.shutdown_timeout)
            .await;
        if remaining > 0 {
            warn!(remaining, "Abandoning unfinished operations");
        }
        let _ = self.reaper.await;
    }
}
