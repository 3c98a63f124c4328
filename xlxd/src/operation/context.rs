use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::Metadata;
use super::registry::Entry;
use crate::error::Cancelled;
use crate::events::EventBus;

/// Handle given to a work function.
///
/// Carries the cancellation token the work is expected to honor and lets it
/// publish progress into the operation's metadata.
pub struct OperationContext {
    entry: Arc<Entry>,
    events: EventBus,
}

impl OperationContext {
    pub(crate) fn new(entry: Arc<Entry>, events: EventBus) -> Self {
        Self { entry, events }
    }

    pub fn id(&self) -> &str {
        self.entry.id()
    }

    pub fn token(&self) -> CancellationToken {
        self.entry.token().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.token().is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.entry.token().cancelled().await
    }

    /// Suspension point: bail out with [`Cancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Merge `metadata` into the record and notify listeners.
    ///
    /// Ignored once the operation is terminal.
    pub fn update_metadata(&self, metadata: Metadata) {
        self.entry.update_metadata(&self.events, metadata);
    }

    pub fn set_metadata(&self, key: &str, value: impl Into<Value>) {
        let mut metadata = Metadata::new();
        metadata.insert(key.to_string(), value.into());
        self.update_metadata(metadata);
    }
}
