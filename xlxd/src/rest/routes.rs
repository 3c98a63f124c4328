use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::container_handlers;
use super::handlers::{self, AppState};
use super::types;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "xlxd API",
        version = "1.0",
        description = "REST API of the xlxd container daemon. Every long-running action returns a background operation that can be polled, waited on, cancelled, or observed through the event stream.",
        license(name = "MIT")
    ),
    tags(
        (name = "server", description = "Server information"),
        (name = "operations", description = "Background operations"),
        (name = "events", description = "Event stream"),
        (name = "containers", description = "Container lifecycle, snapshots and exec")
    ),
    paths(
        handlers::get_server,
        handlers::list_operations,
        handlers::get_operation,
        handlers::delete_operation,
        handlers::wait_operation,
        handlers::operation_websocket,
        handlers::get_events,
        container_handlers::list_containers,
        container_handlers::get_container,
        container_handlers::create_container,
        container_handlers::delete_container,
        container_handlers::update_state,
        container_handlers::create_snapshot,
        container_handlers::exec_container,
    ),
    components(schemas(
        handlers::ApiError,
        types::ServerInfo,
        types::ServerEnvironment,
        types::OperationEntry,
        types::OperationList,
        types::ContainerListResponse,
        types::CreateContainerRequest,
        types::StateAction,
        types::StateRequest,
        types::SnapshotRequest,
        crate::operation::Operation,
        crate::operation::OperationStatus,
        crate::operation::OperationClass,
        crate::backend::Container,
        crate::backend::ContainerStatus,
        crate::backend::Snapshot,
        crate::exec::ExecRequest,
    ))
)]
pub struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // Operations
        .route("/operations", get(handlers::list_operations))
        .route(
            "/operations/{id}",
            get(handlers::get_operation).delete(handlers::delete_operation),
        )
        .route("/operations/{id}/wait", get(handlers::wait_operation))
        .route(
            "/operations/{id}/websocket",
            get(handlers::operation_websocket),
        )
        // Events
        .route("/events", get(handlers::get_events))
        // Containers
        .route(
            "/containers",
            get(container_handlers::list_containers).post(container_handlers::create_container),
        )
        .route(
            "/containers/{name}",
            get(container_handlers::get_container).delete(container_handlers::delete_container),
        )
        .route(
            "/containers/{name}/state",
            put(container_handlers::update_state),
        )
        .route(
            "/containers/{name}/snapshots",
            post(container_handlers::create_snapshot),
        )
        .route(
            "/containers/{name}/exec",
            post(container_handlers::exec_container),
        );

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/1.0", get(handlers::get_server))
        .nest("/1.0", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
