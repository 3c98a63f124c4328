//! Background operations.
//!
//! Every long-running container action becomes an [`Operation`]: a record kept
//! in the [`Registry`], driven by the [`Engine`], and observable through the
//! event bus.

mod context;
mod engine;
mod registry;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub use context::OperationContext;
pub use engine::{Engine, EngineConfig, OperationSpec, WorkFuture};
pub use registry::Registry;

/// Free-form progress data reported by a work function.
pub type Metadata = serde_json::Map<String, Value>;

/// Resource class ("containers", "snapshots") to resource URLs.
pub type Resources = BTreeMap<String, Vec<String>>;

/// Lifecycle state of an operation.
///
/// Transitions only move forward: `Pending -> Running -> terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 5] = [
        OperationStatus::Pending,
        OperationStatus::Running,
        OperationStatus::Success,
        OperationStatus::Failure,
        OperationStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Failure | OperationStatus::Cancelled
        )
    }

    /// Numeric status code exposed to API clients.
    pub fn code(self) -> u16 {
        match self {
            OperationStatus::Pending => 105,
            OperationStatus::Running => 103,
            OperationStatus::Success => 200,
            OperationStatus::Failure => 400,
            OperationStatus::Cancelled => 401,
        }
    }

    fn rank(self) -> u8 {
        match self {
            OperationStatus::Pending => 0,
            OperationStatus::Running => 1,
            _ => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only order.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Success => "success",
            OperationStatus::Failure => "failure",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work behind an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Plain background task.
    Task,
    /// Interactive session reachable through websocket secrets.
    Websocket,
    /// One-shot token.
    Token,
}

/// Snapshot of an operation record.
///
/// Snapshots are plain values; the live record stays inside the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Operation {
    pub id: String,
    pub class: OperationClass,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub status_code: u16,
    pub resources: Resources,
    #[schema(value_type = Object)]
    pub metadata: Metadata,
    pub may_cancel: bool,
    pub err: String,
}

impl Operation {
    pub(crate) fn new(
        class: OperationClass,
        description: String,
        resources: Resources,
        metadata: Metadata,
        may_cancel: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            class,
            description,
            created_at: now,
            updated_at: now,
            status: OperationStatus::Pending,
            status_code: OperationStatus::Pending.code(),
            resources,
            metadata,
            may_cancel,
            err: String::new(),
        }
    }

    /// API path of this operation.
    pub fn url(&self) -> String {
        operation_url(&self.id)
    }
}

/// API path for an operation id.
pub fn operation_url(id: &str) -> String {
    format!("/1.0/operations/{}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        use OperationStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failure));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));

        for terminal in [Success, Failure, Cancelled] {
            assert!(terminal.is_terminal());
            for next in OperationStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn operation_serializes_with_status_code() {
        let op = Operation::new(
            OperationClass::Task,
            "Starting container".to_string(),
            Resources::new(),
            Metadata::new(),
            false,
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["status"], "Pending");
        assert_eq!(json["status_code"], 105);
        assert_eq!(json["class"], "task");
        assert_eq!(op.url(), format!("/1.0/operations/{}", op.id));
    }
}
