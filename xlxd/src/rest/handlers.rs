use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::{IntoResponse, Response, Sse, sse::Event as SseEvent},
};
use futures::stream::Stream;
use serde::Serialize;
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::types::*;
use crate::backend::{Backend, BackendError};
use crate::error::OperationError;
use crate::events::{EventFilter, EventType};
use crate::operation::{Engine, Operation};
use crate::session;

/// Shared application state
pub struct AppState {
    pub engine: Engine,
    pub backend: Arc<dyn Backend>,
    pub trust_token: Option<String>,
}

impl AppState {
    /// Callers are trusted when no token is configured or they present it
    /// as a bearer token.
    pub fn is_trusted(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.trust_token else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected)
    }
}

/// API error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    pub error: String,
    pub code: u32,
}

impl ApiError {
    pub fn new(code: u32, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.code {
            400 => StatusCode::BAD_REQUEST,
            403 => StatusCode::FORBIDDEN,
            404 => StatusCode::NOT_FOUND,
            408 => StatusCode::REQUEST_TIMEOUT,
            409 => StatusCode::CONFLICT,
            410 => StatusCode::GONE,
            503 => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<OperationError> for ApiError {
    fn from(e: OperationError) -> Self {
        let code = match &e {
            OperationError::InvalidResource(_) => 409,
            OperationError::NotFound(_) => 404,
            OperationError::NotCancelable(_) => 400,
            OperationError::Overloaded { .. } => 503,
            OperationError::Timeout(_) => 408,
            OperationError::InvalidSecret => 403,
            OperationError::OperationNotRunning(_) => 410,
            OperationError::NotTerminal(_) => 409,
            OperationError::InternalFault(_) => 500,
        };
        ApiError::new(code, e.to_string())
    }
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        let code = match &e {
            BackendError::NotFound(_) => 404,
            BackendError::Conflict(_) => 409,
            BackendError::InvalidState(_) => 400,
            BackendError::Exec(_) => 500,
        };
        ApiError::new(code, e.to_string())
    }
}

/// Extractor rejecting untrusted callers with 403.
pub struct Trusted;

impl FromRequestParts<Arc<AppState>> for Trusted {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if state.is_trusted(&parts.headers) {
            Ok(Trusted)
        } else {
            Err(ApiError::new(403, "not authorized"))
        }
    }
}

/// Trust level of the caller, for routes open to everyone.
pub struct Caller {
    pub trusted: bool,
}

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(Caller {
            trusted: state.is_trusted(&parts.headers),
        })
    }
}

/// 202 reply for a freshly created operation.
pub fn accepted(op: Operation) -> Response {
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, op.url())],
        Json(op),
    )
        .into_response()
}

// === Server ===

/// Get server information
#[utoipa::path(
    get,
    path = "/1.0",
    responses(
        (status = 200, description = "Server information", body = ServerInfo)
    ),
    tag = "server"
)]
pub async fn get_server(State(state): State<Arc<AppState>>, caller: Caller) -> Json<ServerInfo> {
    let environment = caller.trusted.then(|| {
        let events = state.engine.events();
        let (kernel, kernel_architecture, kernel_version) = kernel_info();
        ServerEnvironment {
            server: "xlxd".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            backend: "dev".to_string(),
            kernel,
            kernel_architecture,
            kernel_version,
            server_pid: std::process::id(),
            operations_active: state.engine.active(),
            operations_limit: state.engine.config().max_operations,
            event_listeners: events.listener_count(),
            events_dropped: events.dropped_total(),
        }
    });

    Json(ServerInfo {
        api_compat: "1.0".to_string(),
        auth: if caller.trusted { "trusted" } else { "untrusted" }.to_string(),
        environment,
    })
}

/// Kernel name, architecture and release of the host.
fn kernel_info() -> (String, String, String) {
    match nix::sys::utsname::uname() {
        Ok(uts) => (
            uts.sysname().to_string_lossy().into_owned(),
            uts.machine().to_string_lossy().into_owned(),
            uts.release().to_string_lossy().into_owned(),
        ),
        Err(e) => {
            warn!(error = %e, "uname failed");
            Default::default()
        }
    }
}

// === Operations ===

/// List operations grouped by status
#[utoipa::path(
    get,
    path = "/1.0/operations",
    params(
        ("recursion" = Option<u8>, Query, description = "1 returns full records instead of URLs")
    ),
    responses(
        (status = 200, description = "Operations by status", body = OperationList),
        (status = 403, description = "Untrusted caller", body = ApiError)
    ),
    tag = "operations"
)]
pub async fn list_operations(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecursionQuery>,
) -> Json<OperationList> {
    let mut by_status: BTreeMap<String, Vec<OperationEntry>> = BTreeMap::new();
    for op in state.engine.list() {
        let key = op.status.as_str().to_string();
        let entry = if query.recursion > 0 {
            OperationEntry::Record(op)
        } else {
            OperationEntry::Url(op.url())
        };
        by_status.entry(key).or_default().push(entry);
    }
    Json(OperationList { by_status })
}

/// Get an operation
#[utoipa::path(
    get,
    path = "/1.0/operations/{id}",
    params(
        ("id" = String, Path, description = "Operation ID")
    ),
    responses(
        (status = 200, description = "Operation found", body = Operation),
        (status = 404, description = "Operation not found", body = ApiError)
    ),
    tag = "operations"
)]
pub async fn get_operation(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Operation>, ApiError> {
    Ok(Json(state.engine.get(&id)?))
}

/// Cancel a running operation, or delete a finished one
#[utoipa::path(
    delete,
    path = "/1.0/operations/{id}",
    params(
        ("id" = String, Path, description = "Operation ID")
    ),
    responses(
        (status = 200, description = "Operation cancelled or deleted", body = Operation),
        (status = 400, description = "Operation cannot be cancelled", body = ApiError),
        (status = 404, description = "Operation not found", body = ApiError)
    ),
    tag = "operations"
)]
pub async fn delete_operation(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Operation>, ApiError> {
    let op = state.engine.get(&id)?;
    if op.status.is_terminal() {
        return Ok(Json(state.engine.delete(&id)?));
    }
    Ok(Json(state.engine.cancel(&id).await?))
}

/// Wait for an operation to finish
#[utoipa::path(
    get,
    path = "/1.0/operations/{id}/wait",
    params(
        ("id" = String, Path, description = "Operation ID"),
        ("timeout" = Option<i64>, Query, description = "Seconds to wait; negative or absent waits forever")
    ),
    responses(
        (status = 200, description = "Terminal operation", body = Operation),
        (status = 404, description = "Operation not found", body = ApiError),
        (status = 408, description = "Operation still running after timeout", body = ApiError)
    ),
    tag = "operations"
)]
pub async fn wait_operation(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<Operation>, ApiError> {
    let timeout = query
        .timeout
        .filter(|secs| *secs >= 0)
        .map(|secs| Duration::from_secs(secs as u64));
    Ok(Json(state.engine.wait(&id, timeout).await?))
}

/// Attach a websocket to one stream of an interactive operation
#[utoipa::path(
    get,
    path = "/1.0/operations/{id}/websocket",
    params(
        ("id" = String, Path, description = "Operation ID"),
        ("secret" = String, Query, description = "Stream secret from the operation's fds metadata")
    ),
    responses(
        (status = 101, description = "Switching protocols"),
        (status = 403, description = "Invalid or consumed secret", body = ApiError),
        (status = 410, description = "Operation already finished", body = ApiError)
    ),
    tag = "operations"
)]
pub async fn operation_websocket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<WebsocketQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let bound = state.engine.sessions().upgrade(&id, &query.secret)?;
    Ok(ws.on_upgrade(move |socket| session::splice(bound, socket)))
}

// === Events ===

/// Stream events as server-sent events
#[utoipa::path(
    get,
    path = "/1.0/events",
    params(
        ("type" = Option<String>, Query, description = "Comma separated types: operation, logging, lifecycle"),
        ("operation" = Option<String>, Query, description = "Only events about this operation")
    ),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
        (status = 400, description = "Unknown event type", body = ApiError)
    ),
    tag = "events"
)]
pub async fn get_events(
    _trusted: Trusted,
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let types = match query.types.as_deref() {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<EventType>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ApiError::new(400, e))?,
        None => Vec::new(),
    };
    let mut filter = EventFilter::types(types);
    if let Some(id) = query.operation {
        filter = filter.with_operation(id);
    }

    let events = state.engine.events();
    let mut sub = events.subscribe_with(filter, events.capacity());
    debug!(listener = ?sub.handle(), "Event listener connected");

    let stream = async_stream::stream! {
        while let Some(event) = sub.recv().await {
            match serde_json::to_string(&*event) {
                Ok(data) => yield Ok(SseEvent::default().event(event.event_type.as_str()).data(data)),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("ping"),
    ))
}
