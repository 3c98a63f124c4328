//! Container backend abstraction.
//!
//! The REST layer never touches containers directly: it wraps every state
//! change in an operation whose work function calls into a [`Backend`].

mod dev;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::exec::ExecRequest;
use crate::operation::Metadata;

pub use dev::DevBackend;

/// Runtime state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ContainerStatus {
    Stopped,
    Running,
    Frozen,
}

impl ContainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Stopped => "Stopped",
            ContainerStatus::Running => "Running",
            ContainerStatus::Frozen => "Frozen",
        }
    }
}

/// A point-in-time copy of a container.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Snapshot {
    pub name: String,
    pub stateful: bool,
    pub created_at: DateTime<Utc>,
}

/// Container as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Container {
    pub name: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub snapshots: Vec<Snapshot>,
}

/// State-changing action on a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    Delete,
    Start,
    Stop { force: bool },
    Restart { force: bool },
    Freeze,
    Unfreeze,
    Snapshot { name: String, stateful: bool },
}

impl Action {
    /// Human label used as the operation description.
    pub fn description(&self) -> &'static str {
        match self {
            Action::Create => "Creating container",
            Action::Delete => "Deleting container",
            Action::Start => "Starting container",
            Action::Stop { .. } => "Stopping container",
            Action::Restart { .. } => "Restarting container",
            Action::Freeze => "Freezing container",
            Action::Unfreeze => "Unfreezing container",
            Action::Snapshot { .. } => "Snapshotting container",
        }
    }
}

/// Errors reported by a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("exec failed: {0}")]
    Exec(#[from] std::io::Error),
}

/// Container runtime capabilities consumed by the daemon.
///
/// Implementations may block for a long time; callers run them inside
/// operation work functions, off the request path.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list(&self) -> Vec<Container>;

    async fn get(&self, name: &str) -> Result<Container, BackendError>;

    /// Apply `action` to `container` on behalf of `operation`. Lifecycle
    /// events it causes name that operation in their context.
    /// Implementations should stop early with [`crate::error::Cancelled`]
    /// once `cancel` fires.
    async fn perform_action(
        &self,
        operation: &str,
        container: &str,
        action: &Action,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Metadata>;

    /// Start a command inside a running container with piped stdio.
    async fn spawn_exec(&self, container: &str, request: &ExecRequest)
    -> Result<Child, BackendError>;
}
