//! Process-wide table of live and recently completed operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::engine::{CancelHook, WorkFn};
use super::{Metadata, Operation, OperationStatus};
use crate::error::{OperationError, Result};
use crate::events::{Event, EventBus};

/// Live record of one operation.
///
/// The record itself sits behind a watch channel, which doubles as the
/// per-record lock: writers go through `send_if_modified`, readers clone the
/// current value, and waiters subscribe for changes.
pub(crate) struct Entry {
    id: String,
    state: watch::Sender<Operation>,
    work: Mutex<Option<WorkFn>>,
    cancel_hook: Mutex<Option<CancelHook>>,
    token: CancellationToken,
    claims: Vec<String>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    finished_at: Mutex<Option<Instant>>,
}

impl Entry {
    pub(crate) fn new(
        operation: Operation,
        work: WorkFn,
        cancel_hook: Option<CancelHook>,
        claims: Vec<String>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let (state, _) = watch::channel(operation.clone());
        Self {
            id: operation.id,
            state,
            work: Mutex::new(Some(work)),
            cancel_hook: Mutex::new(cancel_hook),
            token: CancellationToken::new(),
            claims,
            permit: Mutex::new(permit),
            finished_at: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn snapshot(&self) -> Operation {
        self.state.borrow().clone()
    }

    pub(crate) fn status(&self) -> OperationStatus {
        self.state.borrow().status
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Operation> {
        self.state.subscribe()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Move the record to `next`, returning the new snapshot when the
    /// transition was applied. Backward moves and moves out of a terminal
    /// state are ignored.
    ///
    /// The `operation` event is published while the record is still locked,
    /// so listeners see updates in the order they were applied.
    pub(crate) fn transition(
        &self,
        events: &EventBus,
        next: OperationStatus,
        err: Option<String>,
        metadata: Option<Metadata>,
    ) -> Option<Operation> {
        let mut applied = None;
        self.state.send_if_modified(|op| {
            if !op.status.can_transition_to(next) {
                return false;
            }
            op.status = next;
            op.status_code = next.code();
            op.updated_at = Utc::now();
            if let Some(err) = err {
                op.err = err;
            }
            if let Some(metadata) = metadata {
                op.metadata.extend(metadata);
            }
            events.publish(Event::operation(op));
            applied = Some(op.clone());
            true
        });
        applied
    }

    /// Merge progress metadata into a non-terminal record.
    pub(crate) fn update_metadata(
        &self,
        events: &EventBus,
        metadata: Metadata,
    ) -> Option<Operation> {
        let mut applied = None;
        self.state.send_if_modified(|op| {
            if op.status.is_terminal() {
                return false;
            }
            op.metadata.extend(metadata);
            op.updated_at = Utc::now();
            events.publish(Event::operation(op));
            applied = Some(op.clone());
            true
        });
        applied
    }

    pub(crate) fn take_work(&self) -> Option<WorkFn> {
        self.work.lock().take()
    }

    /// Fire the cancellation token and run the cancel hook, once.
    pub(crate) fn request_cancel(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        let hook = self.cancel_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    /// Release the admission permit and start the retention clock.
    pub(crate) fn finish(&self) {
        self.permit.lock().take();
        *self.finished_at.lock() = Some(Instant::now());
    }

    fn expired(&self, retention: Duration, now: Instant) -> bool {
        match *self.finished_at.lock() {
            Some(at) => now.saturating_duration_since(at) >= retention,
            None => false,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Arc<Entry>>,
    /// Exclusive claim key to owning operation id.
    claims: HashMap<String, String>,
}

/// Registry of operations keyed by id.
///
/// The map lock is only held for lookups and structural changes; record
/// updates happen on the entry itself.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry, atomically taking its exclusive claims.
    pub(crate) fn insert(&self, entry: Arc<Entry>) -> Result<()> {
        let mut inner = self.inner.write();
        for claim in &entry.claims {
            if let Some(owner) = inner.claims.get(claim) {
                return Err(OperationError::InvalidResource(format!(
                    "{} is in use by operation {}",
                    claim, owner
                )));
            }
        }
        for claim in &entry.claims {
            inner.claims.insert(claim.clone(), entry.id.clone());
        }
        inner.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub(crate) fn entry(&self, id: &str) -> Result<Arc<Entry>> {
        self.inner
            .read()
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| OperationError::NotFound(id.to_string()))
    }

    /// Snapshot of a single operation.
    pub fn get(&self, id: &str) -> Result<Operation> {
        Ok(self.entry(id)?.snapshot())
    }

    /// Snapshots of every known operation, oldest first.
    pub fn list(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .inner
            .read()
            .entries
            .values()
            .map(|e| e.snapshot())
            .collect();
        ops.sort_by_key(|op| op.created_at);
        ops
    }

    pub(crate) fn unfinished(&self) -> Vec<Arc<Entry>> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| !e.status().is_terminal())
            .cloned()
            .collect()
    }

    /// Drop the exclusive claims held by an operation.
    pub(crate) fn release_claims(&self, entry: &Entry) {
        if entry.claims.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for claim in &entry.claims {
            if inner.claims.get(claim).is_some_and(|owner| *owner == entry.id) {
                inner.claims.remove(claim);
            }
        }
    }

    /// Remove a terminal operation.
    pub(crate) fn remove(&self, id: &str) -> Result<Arc<Entry>> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| OperationError::NotFound(id.to_string()))?;
        if !entry.status().is_terminal() {
            return Err(OperationError::NotTerminal(id.to_string()));
        }
        inner.entries.remove(id);
        inner.claims.retain(|_, owner| owner.as_str() != id);
        Ok(entry)
    }

    /// Remove terminal operations whose retention window has passed.
    pub(crate) fn reap(&self, retention: Duration) -> Vec<Arc<Entry>> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.expired(retention, now))
            .map(|e| e.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| inner.entries.remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
