//! Lifecycle events and the broadcast bus that carries them.

mod bus;
mod forward;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::operation::Operation;

pub use bus::{EventBus, ListenerHandle, Subscription};
pub use forward::EventForwardLayer;

const OPERATION_PREFIX: &str = "/1.0/operations/";

/// Category of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Operation created or updated; metadata is the full record.
    Operation,
    /// Daemon log record.
    Logging,
    /// State change of a container or operation outside a status update.
    Lifecycle,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Operation => "operation",
            EventType::Logging => "logging",
            EventType::Lifecycle => "lifecycle",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operation" => Ok(EventType::Operation),
            "logging" => Ok(EventType::Logging),
            "lifecycle" => Ok(EventType::Lifecycle),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// An immutable notification published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

impl Event {
    pub fn new(event_type: EventType, metadata: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Event carrying a full operation snapshot.
    pub fn operation(op: &Operation) -> Self {
        Self::new(
            EventType::Operation,
            serde_json::to_value(op).unwrap_or(Value::Null),
        )
    }

    /// Lifecycle event, e.g. `container-started` for `/1.0/containers/c1`.
    pub fn lifecycle(action: &str, source: &str, context: Value) -> Self {
        Self::new(
            EventType::Lifecycle,
            json!({
                "action": action,
                "source": source,
                "context": context,
            }),
        )
    }

    pub fn logging(level: &str, message: String, context: serde_json::Map<String, Value>) -> Self {
        Self::new(
            EventType::Logging,
            json!({
                "level": level,
                "message": message,
                "context": context,
            }),
        )
    }

    /// Id of the operation this event is about, if any.
    pub fn operation_id(&self) -> Option<&str> {
        match self.event_type {
            EventType::Operation => self.metadata.get("id").and_then(Value::as_str),
            EventType::Lifecycle => self
                .metadata
                .get("source")
                .and_then(Value::as_str)
                .and_then(|s| s.strip_prefix(OPERATION_PREFIX))
                .or_else(|| {
                    self.metadata
                        .get("context")
                        .and_then(|c| c.get("operation"))
                        .and_then(Value::as_str)
                }),
            EventType::Logging => self
                .metadata
                .get("context")
                .and_then(|c| c.get("operation"))
                .and_then(Value::as_str),
        }
    }
}

/// Selects which events a listener receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Accepted types; empty accepts all.
    pub types: Vec<EventType>,
    /// Only events about this operation.
    pub operation: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: types.into_iter().collect(),
            operation: None,
        }
    }

    pub fn with_operation(mut self, id: impl Into<String>) -> Self {
        self.operation = Some(id.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }
        match &self.operation {
            Some(id) => event.operation_id() == Some(id.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Metadata, OperationClass, Resources};

    fn sample_operation() -> Operation {
        Operation {
            id: "op-1".to_string(),
            class: OperationClass::Task,
            description: "test".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: crate::operation::OperationStatus::Running,
            status_code: 103,
            resources: Resources::new(),
            metadata: Metadata::new(),
            may_cancel: false,
            err: String::new(),
        }
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::operation(&sample_operation());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "operation");
        assert_eq!(json["metadata"]["id"], "op-1");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn operation_id_is_extracted_per_type() {
        assert_eq!(Event::operation(&sample_operation()).operation_id(), Some("op-1"));

        let deleted = Event::lifecycle("operation-deleted", "/1.0/operations/op-2", json!({}));
        assert_eq!(deleted.operation_id(), Some("op-2"));

        let started = Event::lifecycle(
            "container-started",
            "/1.0/containers/c1",
            json!({"operation": "op-3"}),
        );
        assert_eq!(started.operation_id(), Some("op-3"));

        let log = Event::logging("info", "hello".to_string(), Default::default());
        assert_eq!(log.operation_id(), None);

        let mut context = serde_json::Map::new();
        context.insert("operation".to_string(), json!("op-4"));
        let log = Event::logging("info", "Operation running".to_string(), context);
        assert_eq!(log.operation_id(), Some("op-4"));
        assert!(EventFilter::all().with_operation("op-4").matches(&log));
    }

    #[test]
    fn filter_by_type_and_operation() {
        let op_event = Event::operation(&sample_operation());
        let log = Event::logging("info", "hello".to_string(), Default::default());

        assert!(EventFilter::all().matches(&op_event));
        assert!(EventFilter::all().matches(&log));

        let only_ops = EventFilter::types([EventType::Operation]);
        assert!(only_ops.matches(&op_event));
        assert!(!only_ops.matches(&log));

        assert!(EventFilter::all().with_operation("op-1").matches(&op_event));
        assert!(!EventFilter::all().with_operation("op-9").matches(&op_event));
        assert!(!EventFilter::all().with_operation("op-1").matches(&log));
    }

    #[test]
    fn parse_event_type() {
        assert_eq!("logging".parse::<EventType>().unwrap(), EventType::Logging);
        assert!("bogus".parse::<EventType>().is_err());
    }
}
