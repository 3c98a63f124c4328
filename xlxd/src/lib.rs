pub mod backend;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod exec;
pub mod operation;
pub mod rest;
pub mod session;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use error::{Cancelled, OperationError, Result};
pub use events::{Event, EventBus, EventFilter, EventForwardLayer, EventType};
pub use operation::{
    Engine, EngineConfig, Metadata, Operation, OperationClass, OperationContext, OperationSpec,
    OperationStatus,
};
pub use session::{SessionBridge, StreamName};
