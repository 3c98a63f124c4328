mod container_handlers;
mod handlers;
mod routes;
pub mod types;

pub use handlers::{ApiError, AppState, Caller, Trusted, accepted};
pub use routes::{ApiDoc, create_router};
