//! Request and response bodies of the REST API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::backend::Container;
use crate::operation::Operation;

// =============================================================================
// Server
// =============================================================================

/// Server information
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServerInfo {
    pub api_compat: String,
    /// "trusted" or "untrusted"
    pub auth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<ServerEnvironment>,
}

/// Details only shown to trusted callers
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServerEnvironment {
    pub server: String,
    pub server_version: String,
    pub backend: String,
    pub kernel: String,
    pub kernel_architecture: String,
    pub kernel_version: String,
    pub server_pid: u32,
    pub operations_active: usize,
    pub operations_limit: usize,
    pub event_listeners: usize,
    pub events_dropped: u64,
}

// =============================================================================
// Operations
// =============================================================================

/// URL or full record, depending on `recursion`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum OperationEntry {
    Url(String),
    Record(Operation),
}

/// Operations grouped by lowercase status name
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct OperationList {
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub by_status: BTreeMap<String, Vec<OperationEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecursionQuery {
    #[serde(default)]
    pub recursion: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WaitQuery {
    /// Seconds; negative or absent waits forever.
    #[serde(default)]
    pub timeout: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebsocketQuery {
    pub secret: String,
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma separated event types.
    #[serde(default, rename = "type")]
    pub types: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
}

// =============================================================================
// Containers
// =============================================================================

/// Response wrapper for containers
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ContainerListResponse {
    pub containers: Vec<Container>,
}

/// Request to create a container
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateContainerRequest {
    pub name: String,
}

/// State change verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

/// Request to change a container's runtime state
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StateRequest {
    pub action: StateAction,
    /// Seconds to wait for a clean stop; zero or negative waits forever.
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub force: bool,
}

/// Request to snapshot a container
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SnapshotRequest {
    /// Defaults to `snap<N>`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stateful: bool,
}
