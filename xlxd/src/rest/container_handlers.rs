//! Container handlers. Every state change runs as a background operation.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
    response::Response,
};
use tracing::info;

use super::handlers::{ApiError, AppState, Trusted, accepted};
use super::types::*;
use crate::backend::{Action, Container};
use crate::exec::{self, ExecRequest};
use crate::operation::{OperationClass, OperationSpec};

fn container_url(name: &str) -> String {
    format!("/1.0/containers/{}", name)
}

fn validate_name(kind: &str, name: &str) -> Result<(), ApiError> {
    if name.is_empty() {
        return Err(ApiError::new(400, format!("{} name must not be empty", kind)));
    }
    if name.contains('/') {
        return Err(ApiError::new(
            400,
            format!("{} name must not contain '/': {}", kind, name),
        ));
    }
    Ok(())
}

/// Create an operation running `action` against `name` through the backend.
///
/// `deadline` bounds the backend call itself; elapsing it fails the operation.
fn spawn_action(
    state: &AppState,
    name: &str,
    action: Action,
    spec: OperationSpec,
    deadline: Option<Duration>,
) -> Result<Response, ApiError> {
    let backend = Arc::clone(&state.backend);
    let container = name.to_string();
    let op = state.engine.create(spec, move |ctx| async move {
        let token = ctx.token();
        let work = backend.perform_action(ctx.id(), &container, &action, &token);
        match deadline {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                anyhow::anyhow!(
                    "container {} did not stop within {}s",
                    container,
                    limit.as_secs()
                )
            })?,
            None => work.await,
        }
    })?;
    info!(operation = %op.id, container = %name, "Container operation queued");
    Ok(accepted(op))
}

fn exclusive_spec(action: &Action, name: &str) -> OperationSpec {
    OperationSpec::new(OperationClass::Task, action.description())
        .resource("containers", container_url(name))
        .exclusive()
}

/// List containers
#[utoipa::path(
    get,
    path = "/1.0/containers",
    responses(
        (status = 200, description = "List of containers", body = ContainerListResponse),
        (status = 403, description = "Untrusted caller", body = ApiError)
    ),
    tag = "containers"
)]
pub async fn list_containers(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
) -> Json<ContainerListResponse> {
    Json(ContainerListResponse {
        containers: state.backend.list().await,
    })
}

/// Get a container
#[utoipa::path(
    get,
    path = "/1.0/containers/{name}",
    params(
        ("name" = String, Path, description = "Container name")
    ),
    responses(
        (status = 200, description = "Container found", body = Container),
        (status = 404, description = "Container not found", body = ApiError)
    ),
    tag = "containers"
)]
pub async fn get_container(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Container>, ApiError> {
    Ok(Json(state.backend.get(&name).await?))
}

/// Create a container
#[utoipa::path(
    post,
    path = "/1.0/containers",
    request_body = CreateContainerRequest,
    responses(
        (status = 202, description = "Creation started", body = crate::operation::Operation),
        (status = 400, description = "Invalid name", body = ApiError),
        (status = 409, description = "Container already exists", body = ApiError)
    ),
    tag = "containers"
)]
pub async fn create_container(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateContainerRequest>,
) -> Result<Response, ApiError> {
    validate_name("container", &req.name)?;
    if state.backend.get(&req.name).await.is_ok() {
        return Err(ApiError::new(
            409,
            format!("container {} already exists", req.name),
        ));
    }
    let action = Action::Create;
    let spec = exclusive_spec(&action, &req.name);
    spawn_action(&state, &req.name, action, spec, None)
}

/// Delete a container
#[utoipa::path(
    delete,
    path = "/1.0/containers/{name}",
    params(
        ("name" = String, Path, description = "Container name")
    ),
    responses(
        (status = 202, description = "Deletion started", body = crate::operation::Operation),
        (status = 404, description = "Container not found", body = ApiError),
        (status = 409, description = "Container busy", body = ApiError)
    ),
    tag = "containers"
)]
pub async fn delete_container(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.backend.get(&name).await?;
    let action = Action::Delete;
    let spec = exclusive_spec(&action, &name);
    spawn_action(&state, &name, action, spec, None)
}

/// Change a container's runtime state
#[utoipa::path(
    put,
    path = "/1.0/containers/{name}/state",
    params(
        ("name" = String, Path, description = "Container name")
    ),
    request_body = StateRequest,
    responses(
        (status = 202, description = "State change started", body = crate::operation::Operation),
        (status = 404, description = "Container not found", body = ApiError),
        (status = 409, description = "Another state change is in progress", body = ApiError)
    ),
    tag = "containers"
)]
pub async fn update_state(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<StateRequest>,
) -> Result<Response, ApiError> {
    state.backend.get(&name).await?;
    let action = match req.action {
        StateAction::Start => Action::Start,
        StateAction::Stop => Action::Stop { force: req.force },
        StateAction::Restart => Action::Restart { force: req.force },
        StateAction::Freeze => Action::Freeze,
        StateAction::Unfreeze => Action::Unfreeze,
    };
    let deadline = match req.action {
        StateAction::Stop | StateAction::Restart if !req.force && req.timeout > 0 => {
            Some(Duration::from_secs(req.timeout as u64))
        }
        _ => None,
    };
    let spec = exclusive_spec(&action, &name);
    spawn_action(&state, &name, action, spec, deadline)
}

/// Snapshot a container
#[utoipa::path(
    post,
    path = "/1.0/containers/{name}/snapshots",
    params(
        ("name" = String, Path, description = "Container name")
    ),
    request_body = SnapshotRequest,
    responses(
        (status = 202, description = "Snapshot started", body = crate::operation::Operation),
        (status = 400, description = "Invalid snapshot name", body = ApiError),
        (status = 404, description = "Container not found", body = ApiError),
        (status = 409, description = "Container busy", body = ApiError)
    ),
    tag = "containers"
)]
pub async fn create_snapshot(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<SnapshotRequest>,
) -> Result<Response, ApiError> {
    let container = state.backend.get(&name).await?;
    let snapshot = match req.name {
        Some(snapshot) => snapshot,
        None => format!("snap{}", container.snapshots.len()),
    };
    validate_name("snapshot", &snapshot)?;

    let action = Action::Snapshot {
        name: snapshot.clone(),
        stateful: req.stateful,
    };
    let spec = exclusive_spec(&action, &name)
        .resource(
            "snapshots",
            format!("{}/snapshots/{}", container_url(&name), snapshot),
        )
        .cancellable();
    spawn_action(&state, &name, action, spec, None)
}

/// Run a command in a container
#[utoipa::path(
    post,
    path = "/1.0/containers/{name}/exec",
    params(
        ("name" = String, Path, description = "Container name")
    ),
    request_body = ExecRequest,
    responses(
        (status = 202, description = "Command started; fds metadata holds websocket secrets", body = crate::operation::Operation),
        (status = 400, description = "Missing command", body = ApiError),
        (status = 404, description = "Container not found", body = ApiError)
    ),
    tag = "containers"
)]
pub async fn exec_container(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<Response, ApiError> {
    state.backend.get(&name).await?;
    if req.command.is_empty() {
        return Err(ApiError::new(400, "exec requires a command"));
    }

    let backend = Arc::clone(&state.backend);
    let op = if req.wait_for_websocket {
        let spec = OperationSpec::new(OperationClass::Websocket, "Executing command")
            .resource("containers", container_url(&name))
            .cancellable();
        let streams = req.streams();
        state
            .engine
            .create_interactive(spec, &streams, move |ctx, pipes| {
                exec::run_attached(ctx, pipes, backend, name, req)
            })?
    } else {
        let spec = OperationSpec::new(OperationClass::Task, "Executing command")
            .resource("containers", container_url(&name))
            .cancellable();
        state
            .engine
            .create(spec, move |ctx| exec::run_detached(ctx, backend, name, req))?
    };
    Ok(accepted(op))
}
