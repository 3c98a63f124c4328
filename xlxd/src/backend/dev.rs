//! In-memory backend for development and tests.
//!
//! Containers are simulated state machines; exec commands run on the host.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Action, Backend, BackendError, Container, ContainerStatus, Snapshot};
use crate::error::Cancelled;
use crate::events::{Event, EventBus};
use crate::exec::ExecRequest;
use crate::operation::Metadata;

pub struct DevBackend {
    containers: RwLock<BTreeMap<String, Container>>,
    latency: Duration,
    events: EventBus,
}

impl DevBackend {
    /// Every action takes `latency` before it is applied.
    pub fn new(events: EventBus, latency: Duration) -> Self {
        Self {
            containers: RwLock::new(BTreeMap::new()),
            latency,
            events,
        }
    }

    /// Seed a container without going through an operation.
    pub fn insert(&self, name: &str, status: ContainerStatus) {
        self.containers.write().insert(
            name.to_string(),
            Container {
                name: name.to_string(),
                status,
                created_at: Utc::now(),
                snapshots: Vec::new(),
            },
        );
    }

    /// Apply `action` and return the lifecycle action name to publish.
    fn apply(&self, name: &str, action: &Action) -> Result<(&'static str, Metadata), BackendError> {
        let mut containers = self.containers.write();

        if *action == Action::Create && !containers.contains_key(name) {
            containers.insert(
                name.to_string(),
                Container {
                    name: name.to_string(),
                    status: ContainerStatus::Stopped,
                    created_at: Utc::now(),
                    snapshots: Vec::new(),
                },
            );
            return Ok(("container-created", Metadata::new()));
        }

        let container = containers
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        let status = container.status;
        let invalid = |what: &str| {
            Err(BackendError::InvalidState(format!(
                "container {} is {}, cannot {}",
                name,
                status.as_str().to_lowercase(),
                what
            )))
        };

        let lifecycle = match action {
            Action::Create => {
                return Err(BackendError::Conflict(format!(
                    "container {} already exists",
                    name
                )));
            }
            Action::Delete => {
                if status != ContainerStatus::Stopped {
                    return invalid("delete");
                }
                containers.remove(name);
                return Ok(("container-deleted", Metadata::new()));
            }
            Action::Start => {
                if status != ContainerStatus::Stopped {
                    return invalid("start");
                }
                container.status = ContainerStatus::Running;
                "container-started"
            }
            Action::Stop { force } => {
                if status == ContainerStatus::Stopped || (status == ContainerStatus::Frozen && !force) {
                    return invalid("stop");
                }
                container.status = ContainerStatus::Stopped;
                "container-stopped"
            }
            Action::Restart { force } => {
                if status == ContainerStatus::Stopped || (status == ContainerStatus::Frozen && !force) {
                    return invalid("restart");
                }
                container.status = ContainerStatus::Running;
                "container-restarted"
            }
            Action::Freeze => {
                if status != ContainerStatus::Running {
                    return invalid("freeze");
                }
                container.status = ContainerStatus::Frozen;
                "container-paused"
            }
            Action::Unfreeze => {
                if status != ContainerStatus::Frozen {
                    return invalid("unfreeze");
                }
                container.status = ContainerStatus::Running;
                "container-resumed"
            }
            Action::Snapshot { name: snap, stateful } => {
                if *stateful && status != ContainerStatus::Running {
                    return invalid("take a stateful snapshot");
                }
                if container.snapshots.iter().any(|s| s.name == *snap) {
                    return Err(BackendError::Conflict(format!(
                        "snapshot {}/{} already exists",
                        name, snap
                    )));
                }
                container.snapshots.push(Snapshot {
                    name: snap.clone(),
                    stateful: *stateful,
                    created_at: Utc::now(),
                });
                "container-snapshot-created"
            }
        };

        let mut metadata = Metadata::new();
        metadata.insert("status".into(), container.status.as_str().into());
        Ok((lifecycle, metadata))
    }
}

#[async_trait]
impl Backend for DevBackend {
    async fn list(&self) -> Vec<Container> {
        self.containers.read().values().cloned().collect()
    }

    async fn get(&self, name: &str) -> Result<Container, BackendError> {
        self.containers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn perform_action(
        &self,
        operation: &str,
        container: &str,
        action: &Action,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Metadata> {
        debug!(container = %container, action = ?action, "Performing action");
        tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            _ = tokio::time::sleep(self.latency) => {}
        }

        let (lifecycle, metadata) = self.apply(container, action)?;
        info!(container = %container, action = lifecycle, "Container state changed");

        let context = match action {
            Action::Snapshot { name, stateful } => json!({
                "operation": operation,
                "snapshot": name,
                "stateful": stateful,
            }),
            _ => json!({ "operation": operation }),
        };
        self.events.publish(Event::lifecycle(
            lifecycle,
            &format!("/1.0/containers/{}", container),
            context,
        ));
        Ok(metadata)
    }

    async fn spawn_exec(
        &self,
        container: &str,
        request: &ExecRequest,
    ) -> Result<Child, BackendError> {
        let status = self.get(container).await?.status;
        if status != ContainerStatus::Running {
            return Err(BackendError::InvalidState(format!(
                "container {} is not running",
                container
            )));
        }
        let (program, args) = request.command.split_first().ok_or_else(|| {
            BackendError::InvalidState("exec requires a command".to_string())
        })?;

        debug!(container = %container, command = ?request.command, "Spawning exec process");
        let child = Command::new(program)
            .args(args)
            .envs(&request.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventType};
    use crate::operation::{Engine, EngineConfig, OperationClass, OperationSpec};
    use std::sync::Arc;

    fn backend() -> (DevBackend, EventBus) {
        let events = EventBus::new(16);
        (DevBackend::new(events.clone(), Duration::ZERO), events)
    }

    #[tokio::test]
    async fn state_machine_follows_actions() {
        let (backend, events) = backend();
        let mut sub = events.subscribe();
        let token = CancellationToken::new();

        backend.perform_action("op-1", "c1", &Action::Create, &token).await.unwrap();
        backend.perform_action("op-1", "c1", &Action::Start, &token).await.unwrap();
        backend.perform_action("op-1", "c1", &Action::Freeze, &token).await.unwrap();
        assert_eq!(backend.get("c1").await.unwrap().status, ContainerStatus::Frozen);

        let err = backend
            .perform_action("op-1", "c1", &Action::Stop { force: false }, &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot stop"));

        backend.perform_action("op-1", "c1", &Action::Unfreeze, &token).await.unwrap();
        let md = backend
            .perform_action("op-1", "c1", &Action::Stop { force: false }, &token)
            .await
            .unwrap();
        assert_eq!(md["status"], "Stopped");

        let actions: Vec<String> = std::iter::from_fn(|| sub.try_recv())
            .filter(|e| e.event_type == EventType::Lifecycle)
            .map(|e| e.metadata["action"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            actions,
            [
                "container-created",
                "container-started",
                "container-paused",
                "container-resumed",
                "container-stopped"
            ]
        );
    }

    #[tokio::test]
    async fn snapshots_are_unique_and_stateful_needs_running() {
        let (backend, _events) = backend();
        let token = CancellationToken::new();
        backend.insert("c1", ContainerStatus::Stopped);

        let snap = |stateful| Action::Snapshot {
            name: "snap0".into(),
            stateful,
        };
        assert!(backend.perform_action("op-1", "c1", &snap(true), &token).await.is_err());
        backend.perform_action("op-1", "c1", &snap(false), &token).await.unwrap();
        let err = backend.perform_action("op-1", "c1", &snap(false), &token).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(backend.get("c1").await.unwrap().snapshots.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_action_is_not_applied() {
        let events = EventBus::new(16);
        let backend = DevBackend::new(events, Duration::from_secs(60));
        backend.insert("c1", ContainerStatus::Stopped);

        let token = CancellationToken::new();
        token.cancel();
        let err = backend
            .perform_action("op-1", "c1", &Action::Start, &token)
            .await
            .unwrap_err();
        assert!(err.is::<Cancelled>());
        assert_eq!(backend.get("c1").await.unwrap().status, ContainerStatus::Stopped);
    }

    #[tokio::test]
    async fn lifecycle_events_reach_operation_listeners() {
        let events = EventBus::new(16);
        let backend = Arc::new(DevBackend::new(events.clone(), Duration::from_millis(50)));
        backend.insert("c1", ContainerStatus::Stopped);
        let engine = Engine::new(EngineConfig::default(), events.clone());

        let worker = Arc::clone(&backend);
        let op = engine
            .create(
                OperationSpec::new(OperationClass::Task, "Starting container"),
                move |ctx| async move {
                    worker
                        .perform_action(ctx.id(), "c1", &Action::Start, &ctx.token())
                        .await
                },
            )
            .unwrap();
        let mut sub = events.subscribe_with(EventFilter::all().with_operation(op.id.clone()), 64);
        engine.wait(&op.id, None).await.unwrap();

        let lifecycle: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .filter(|e| e.event_type == EventType::Lifecycle)
            .collect();
        assert_eq!(lifecycle.len(), 1);
        assert_eq!(lifecycle[0].metadata["action"], "container-started");
        assert_eq!(lifecycle[0].metadata["context"]["operation"], op.id.as_str());
    }

    #[tokio::test]
    async fn exec_requires_running_container() {
        let (backend, _events) = backend();
        backend.insert("c1", ContainerStatus::Stopped);
        let request = ExecRequest {
            command: vec!["true".into()],
            ..ExecRequest::default()
        };

        let err = backend.spawn_exec("c1", &request).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidState(_)));
        assert!(matches!(
            backend.spawn_exec("missing", &request).await,
            Err(BackendError::NotFound(_))
        ));
    }
}
