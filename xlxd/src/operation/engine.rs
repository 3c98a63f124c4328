//! Runs work functions in the background and drives their records to a
//! terminal state exactly once.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::OperationContext;
use super::registry::{Entry, Registry};
use super::{
    Metadata, Operation, OperationClass, OperationStatus, Resources, operation_url,
};
use crate::error::{Cancelled, OperationError, Result};
use crate::events::{Event, EventBus};
use crate::session::{SessionBridge, SessionPipes, StreamName};

/// Future returned by a work function.
pub type WorkFuture = BoxFuture<'static, anyhow::Result<Metadata>>;

pub(crate) type WorkFn = Box<dyn FnOnce(OperationContext) -> WorkFuture + Send>;
pub(crate) type CancelHook = Box<dyn FnOnce() + Send>;

/// Extra time `cancel` waits beyond the grace period for the supervisor to
/// record its verdict.
const CANCEL_SETTLE: Duration = Duration::from_secs(1);

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of non-terminal operations.
    pub max_operations: usize,
    /// How long terminal operations stay queryable.
    pub retention: Duration,
    /// Interval between reaper sweeps.
    pub reap_interval: Duration,
    /// Time a work function gets to return after cancellation before it is
    /// detached and the record force-marked cancelled.
    pub cancel_grace: Duration,
    /// Hard limit on a work function's runtime.
    pub operation_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operations: 256,
            retention: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(10),
            operation_timeout: None,
        }
    }
}

/// Description of an operation to create.
pub struct OperationSpec {
    class: OperationClass,
    description: String,
    resources: Resources,
    metadata: Metadata,
    exclusive: bool,
    cancellable: bool,
    cancel_hook: Option<CancelHook>,
}

impl OperationSpec {
    pub fn new(class: OperationClass, description: impl Into<String>) -> Self {
        Self {
            class,
            description: description.into(),
            resources: Resources::new(),
            metadata: Metadata::new(),
            exclusive: false,
            cancellable: false,
            cancel_hook: None,
        }
    }

    /// Add a resource URL under `class` (e.g. "containers").
    pub fn resource(mut self, class: &str, url: impl Into<String>) -> Self {
        self.resources
            .entry(class.to_string())
            .or_default()
            .push(url.into());
        self
    }

    /// Claim every listed resource exclusively while the operation runs.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Allow cancellation through the token alone.
    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    /// Allow cancellation and run `hook` when it is requested.
    pub fn on_cancel(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.cancellable = true;
        self.cancel_hook = Some(Box::new(hook));
        self
    }

    fn into_parts(self) -> (Operation, Vec<String>, Option<CancelHook>) {
        let claims = if self.exclusive {
            self.resources.values().flatten().cloned().collect()
        } else {
            Vec::new()
        };
        let op = Operation::new(
            self.class,
            self.description,
            self.resources,
            self.metadata,
            self.cancellable,
        );
        (op, claims, self.cancel_hook)
    }
}

/// The operation engine.
///
/// Cheap to clone; all clones share one registry, event bus and session
/// bridge.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    events: EventBus,
    sessions: SessionBridge,
    config: Arc<EngineConfig>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Engine {
    /// `max_operations` is clamped to what the admission semaphore can hold.
    pub fn new(mut config: EngineConfig, events: EventBus) -> Self {
        if config.max_operations > Semaphore::MAX_PERMITS {
            warn!(
                requested = config.max_operations,
                limit = Semaphore::MAX_PERMITS,
                "Operation limit clamped"
            );
            config.max_operations = Semaphore::MAX_PERMITS;
        }
        let registry = Arc::new(Registry::new());
        Self {
            sessions: SessionBridge::new(Arc::clone(&registry)),
            registry,
            events,
            permits: Arc::new(Semaphore::new(config.max_operations)),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn sessions(&self) -> &SessionBridge {
        &self.sessions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of operations currently holding an admission slot.
    pub fn active(&self) -> usize {
        self.config.max_operations - self.permits.available_permits()
    }

    /// Register an operation and schedule `work` on its own task.
    ///
    /// Returns the `Pending` record immediately.
    pub fn create<F, Fut>(&self, spec: OperationSpec, work: F) -> Result<Operation>
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Metadata>> + Send + 'static,
    {
        let permit = self.admit()?;
        let (op, claims, hook) = spec.into_parts();
        self.schedule(op, Box::new(move |ctx| Box::pin(work(ctx))), hook, claims, permit)
    }

    /// Like [`create`](Self::create), but also mints websocket secrets for
    /// `streams`. The secrets are published under the `fds` metadata key and
    /// the process-side pipes are passed to `work`.
    pub fn create_interactive<F, Fut>(
        &self,
        spec: OperationSpec,
        streams: &[StreamName],
        work: F,
    ) -> Result<Operation>
    where
        F: FnOnce(OperationContext, SessionPipes) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Metadata>> + Send + 'static,
    {
        let permit = self.admit()?;
        let (mut op, claims, hook) = spec.into_parts();
        let (secrets, pipes) = self.sessions.register(&op.id, streams);
        op.metadata.insert("fds".to_string(), json!(secrets));

        let id = op.id.clone();
        let result = self.schedule(
            op,
            Box::new(move |ctx| Box::pin(work(ctx, pipes))),
            hook,
            claims,
            permit,
        );
        if result.is_err() {
            self.sessions.release(&id);
        }
        result
    }

    fn admit(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| OperationError::Overloaded {
                limit: self.config.max_operations,
            })
    }

    fn schedule(
        &self,
        op: Operation,
        work: WorkFn,
        hook: Option<CancelHook>,
        claims: Vec<String>,
        permit: OwnedSemaphorePermit,
    ) -> Result<Operation> {
        let entry = Arc::new(Entry::new(op.clone(), work, hook, claims, Some(permit)));
        self.registry.insert(entry)?;

        info!(
            operation = %op.id,
            class = ?op.class,
            description = %op.description,
            "Operation created"
        );
        self.events.publish(Event::operation(&op));

        let engine = self.clone();
        let id = op.id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.start(&id) {
                debug!(operation = %id, error = %e, "Operation vanished before start");
            }
        });

        Ok(op)
    }

    /// Move a pending operation to `Running` and launch its work function.
    ///
    /// The work function runs at most once; starting an operation that was
    /// already started or cancelled is a no-op.
    pub fn start(&self, id: &str) -> Result<()> {
        let entry = self.registry.entry(id)?;
        let Some(work) = entry.take_work() else {
            return Ok(());
        };
        if entry
            .transition(&self.events, OperationStatus::Running, None, None)
            .is_none()
        {
            return Ok(());
        }
        debug!(operation = %id, "Operation running");

        let ctx = OperationContext::new(Arc::clone(&entry), self.events.clone());
        let handle = tokio::spawn(async move { work(ctx).await });
        tokio::spawn(self.clone().supervise(entry, handle));
        Ok(())
    }

    async fn supervise(self, entry: Arc<Entry>, mut handle: JoinHandle<anyhow::Result<Metadata>>) {
        let joined = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = self.force_deadline(&entry) => None,
        };

        match joined {
            Some(Ok(Ok(metadata))) => {
                let status = if entry.token().is_cancelled() {
                    OperationStatus::Cancelled
                } else {
                    OperationStatus::Success
                };
                self.finalize(&entry, status, None, Some(metadata));
            }
            Some(Ok(Err(err))) => {
                if err.chain().any(|cause| cause.is::<Cancelled>()) {
                    self.finalize(&entry, OperationStatus::Cancelled, None, None);
                } else {
                    self.finalize(
                        &entry,
                        OperationStatus::Failure,
                        Some(format!("{:#}", err)),
                        None,
                    );
                }
            }
            Some(Err(join_err)) => {
                let cause = join_failure(join_err);
                error!(operation = %entry.id(), error = %cause, "Work function crashed");
                self.finalize(&entry, OperationStatus::Failure, Some(cause), None);
            }
            None => {
                warn!(
                    operation = %entry.id(),
                    grace = ?self.config.cancel_grace,
                    "Work function ignored cancellation, detaching"
                );
                self.finalize(
                    &entry,
                    OperationStatus::Cancelled,
                    Some("work did not stop within the cancellation grace period".to_string()),
                    None,
                );
                let id = entry.id().to_string();
                drop(entry);
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(metadata)) => warn!(
                            operation = %id,
                            metadata = ?metadata,
                            "Discarding late result of detached work function"
                        ),
                        Ok(Err(err)) => warn!(
                            operation = %id,
                            error = %err,
                            "Discarding late error of detached work function"
                        ),
                        Err(join_err) => warn!(
                            operation = %id,
                            error = %join_failure(join_err),
                            "Detached work function crashed"
                        ),
                    }
                });
            }
        }
    }

    /// Completes once the work function has used up its allowance: the
    /// cancellation grace period after a cancel request, or after the hard
    /// timeout fired one.
    async fn force_deadline(&self, entry: &Entry) {
        let token = entry.token().clone();
        match self.config.operation_timeout {
            Some(limit) => {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!(operation = %entry.id(), timeout = ?limit, "Operation timed out, cancelling");
                        entry.request_cancel();
                    }
                }
            }
            None => token.cancelled().await,
        }
        tokio::time::sleep(self.config.cancel_grace).await;
    }

    fn finalize(
        &self,
        entry: &Entry,
        status: OperationStatus,
        err: Option<String>,
        metadata: Option<Metadata>,
    ) {
        let Some(op) = entry.transition(&self.events, status, err, metadata) else {
            return;
        };
        entry.finish();
        self.registry.release_claims(entry);
        self.sessions.release(entry.id());

        match status {
            OperationStatus::Failure => {
                warn!(operation = %op.id, error = %op.err, "Operation failed")
            }
            _ => info!(operation = %op.id, status = %status, "Operation finished"),
        }
    }

    /// Snapshot of one operation.
    pub fn get(&self, id: &str) -> Result<Operation> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<Operation> {
        self.registry.list()
    }

    /// Request cancellation and wait for the operation to settle.
    ///
    /// Resolves within the grace period: either the work function honors the
    /// request or the record is force-marked cancelled.
    pub async fn cancel(&self, id: &str) -> Result<Operation> {
        let entry = self.registry.entry(id)?;
        let snapshot = entry.snapshot();
        if !snapshot.may_cancel {
            return Err(OperationError::NotCancelable(format!(
                "{} does not support cancellation",
                id
            )));
        }
        if snapshot.status.is_terminal() {
            return Err(OperationError::NotCancelable(format!(
                "{} is already {}",
                id, snapshot.status
            )));
        }

        info!(operation = %id, "Cancelling operation");
        if entry.take_work().is_some() {
            // Never started: resolve without running the work
            entry.request_cancel();
            self.finalize(&entry, OperationStatus::Cancelled, None, None);
            return Ok(entry.snapshot());
        }

        entry.request_cancel();
        drop(entry);
        match self
            .wait(id, Some(self.config.cancel_grace + CANCEL_SETTLE))
            .await
        {
            Err(OperationError::Timeout(_)) => self.get(id),
            other => other,
        }
    }

    /// Block until the operation is terminal or `timeout` elapses.
    ///
    /// Only the caller waits; the operation is unaffected by the timeout.
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<Operation> {
        let mut rx = self.registry.entry(id)?.subscribe();
        let missing = id.to_string();
        let terminal = async move {
            rx.wait_for(|op| op.status.is_terminal())
                .await
                .map(|op| op.clone())
                .map_err(|_| OperationError::NotFound(missing))
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, terminal)
                .await
                .map_err(|_| OperationError::Timeout(limit))?,
            None => terminal.await,
        }
    }

    /// Remove a terminal operation and everything attached to it.
    pub fn delete(&self, id: &str) -> Result<Operation> {
        let entry = self.registry.remove(id)?;
        self.sessions.release(id);
        info!(operation = %id, "Operation deleted");
        self.events.publish(Event::lifecycle(
            "operation-deleted",
            &operation_url(id),
            json!({}),
        ));
        Ok(entry.snapshot())
    }

    /// Remove terminal operations past their retention window.
    pub fn reap(&self) -> usize {
        let reaped = self.registry.reap(self.config.retention);
        for entry in &reaped {
            self.sessions.release(entry.id());
            debug!(operation = %entry.id(), "Reaped operation");
            self.events.publish(Event::lifecycle(
                "operation-deleted",
                &operation_url(entry.id()),
                json!({ "reaped": true }),
            ));
        }
        reaped.len()
    }

    /// Spawn the periodic reaper. It stops when the engine shuts down.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                interval_secs = engine.config.reap_interval.as_secs(),
                retention_secs = engine.config.retention.as_secs(),
                "Operation reaper started"
            );
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.reap();
                    }
                }
            }
            debug!("Operation reaper stopped");
        })
    }

    /// Stop admitting work and drain what is in flight.
    ///
    /// Cancellable operations are cancelled, the others are waited out, for
    /// at most `timeout`. Returns the number of operations still unresolved.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.shutdown.cancel();
        self.permits.close();

        let pending = self.registry.unfinished();
        if pending.is_empty() {
            return 0;
        }
        info!(count = pending.len(), "Draining operations");

        for entry in &pending {
            if entry.take_work().is_some() {
                entry.request_cancel();
                self.finalize(
                    entry,
                    OperationStatus::Cancelled,
                    Some("daemon shutting down".to_string()),
                    None,
                );
            } else if entry.snapshot().may_cancel {
                entry.request_cancel();
            }
        }

        let waits = pending.iter().map(|entry| {
            let mut rx = entry.subscribe();
            async move {
                let _ = rx.wait_for(|op| op.status.is_terminal()).await;
            }
        });
        let _ = tokio::time::timeout(timeout, join_all(waits)).await;

        let remaining = pending
            .iter()
            .filter(|entry| !entry.status().is_terminal())
            .count();
        if remaining > 0 {
            warn!(remaining, "Operations still running at shutdown");
        }
        remaining
    }
}

fn join_failure(err: JoinError) -> String {
    if err.is_panic() {
        OperationError::InternalFault(panic_message(err.into_panic())).to_string()
    } else {
        OperationError::InternalFault("work function aborted".to_string()).to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventType};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn engine_with(config: EngineConfig) -> Engine {
        Engine::new(config, EventBus::new(64))
    }

    fn engine() -> Engine {
        engine_with(EngineConfig::default())
    }

    fn task(description: &str) -> OperationSpec {
        OperationSpec::new(OperationClass::Task, description)
    }

    async fn until_running(engine: &Engine, id: &str) {
        while engine.get(id).unwrap().status == OperationStatus::Pending {
            tokio::task::yield_now().await;
        }
    }

    fn progress(value: &str) -> Metadata {
        let mut md = Metadata::new();
        md.insert("progress".into(), value.into());
        md
    }

    #[tokio::test]
    async fn work_success_records_metadata() {
        let engine = engine();
        let op = engine
            .create(task("Sleeping"), |_ctx| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(progress("100"))
            })
            .unwrap();

        let snapshot = engine.get(&op.id).unwrap();
        assert!(matches!(
            snapshot.status,
            OperationStatus::Pending | OperationStatus::Running
        ));

        let done = engine.wait(&op.id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(done.status, OperationStatus::Success);
        assert_eq!(done.metadata["progress"], "100");
        assert!(done.err.is_empty());
    }

    #[tokio::test]
    async fn work_error_becomes_failure() {
        let engine = engine();
        let op = engine
            .create(task("Failing"), |_ctx| async {
                Err(anyhow::anyhow!("storage backend unavailable"))
            })
            .unwrap();

        let done = engine.wait(&op.id, None).await.unwrap();
        assert_eq!(done.status, OperationStatus::Failure);
        assert!(done.err.contains("storage backend unavailable"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let engine = engine();
        let op = engine
            .create(task("Crashing"), |_ctx| async {
                if true {
                    panic!("backend exploded");
                }
                Ok(Metadata::new())
            })
            .unwrap();

        let done = engine.wait(&op.id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(done.status, OperationStatus::Failure);
        assert_eq!(
            done.err,
            OperationError::InternalFault("backend exploded".to_string()).to_string()
        );
        assert!(done.err.starts_with("internal error"));

        // The engine keeps working afterwards
        let next = engine
            .create(task("After crash"), |_ctx| async { Ok(Metadata::new()) })
            .unwrap();
        let done = engine.wait(&next.id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(done.status, OperationStatus::Success);
    }

    #[tokio::test]
    async fn cancel_without_support_is_rejected() {
        let engine = engine();
        let op = engine
            .create(task("Uncancellable"), |ctx| async move {
                ctx.cancelled().await;
                Ok(Metadata::new())
            })
            .unwrap();

        let before = engine.get(&op.id).unwrap().status;
        let err = engine.cancel(&op.id).await.unwrap_err();
        assert!(matches!(err, OperationError::NotCancelable(_)));
        let after = engine.get(&op.id).unwrap().status;
        assert!(!after.is_terminal());
        assert!(!before.is_terminal());
    }

    #[tokio::test]
    async fn cooperative_cancel_reaches_cancelled() {
        let engine = engine();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = hook_calls.clone();
        let op = engine
            .create(
                task("Blocking").on_cancel(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
                |ctx| async move {
                    ctx.cancelled().await;
                    Err(Cancelled.into())
                },
            )
            .unwrap();

        let done = engine.cancel(&op.id).await.unwrap();
        assert_eq!(done.status, OperationStatus::Cancelled);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

        let err = engine.cancel(&op.id).await.unwrap_err();
        assert!(matches!(err, OperationError::NotCancelable(_)));
    }

    #[tokio::test]
    async fn failure_after_cancel_is_recorded_as_failure() {
        let engine = engine();
        let op = engine
            .create(task("Misbehaving").cancellable(), |ctx| async move {
                ctx.cancelled().await;
                Err(anyhow::anyhow!("rollback failed"))
            })
            .unwrap();
        until_running(&engine, &op.id).await;

        let done = engine.cancel(&op.id).await.unwrap();
        assert_eq!(done.status, OperationStatus::Failure);
        assert!(done.err.contains("rollback failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_cooperating_work_is_detached_after_grace() {
        let engine = engine_with(EngineConfig {
            cancel_grace: Duration::from_secs(2),
            ..EngineConfig::default()
        });
        let op = engine
            .create(task("Stubborn").cancellable(), |_ctx| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Metadata::new())
            })
            .unwrap();
        until_running(&engine, &op.id).await;

        let done = engine.cancel(&op.id).await.unwrap();
        assert_eq!(done.status, OperationStatus::Cancelled);
        assert!(done.err.contains("grace period"));
        assert_eq!(engine.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_cancels_running_work() {
        let engine = engine_with(EngineConfig {
            operation_timeout: Some(Duration::from_secs(30)),
            cancel_grace: Duration::from_secs(1),
            ..EngineConfig::default()
        });
        let op = engine
            .create(task("Forever"), |ctx| async move {
                ctx.cancelled().await;
                Err(Cancelled.into())
            })
            .unwrap();

        let done = engine.wait(&op.id, None).await.unwrap();
        assert_eq!(done.status, OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn pending_cancel_never_runs_work() {
        let engine = engine();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();

        // Create from a current-thread runtime without yielding, so the
        // scheduled start has not happened yet.
        let op = engine
            .create(task("Queued").cancellable(), move |_ctx| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Metadata::new())
            })
            .unwrap();
        let done = engine.cancel(&op.id).await.unwrap();
        assert_eq!(done.status, OperationStatus::Cancelled);

        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        // Starting again is a no-op
        engine.start(&op.id).unwrap();
        assert_eq!(engine.get(&op.id).unwrap().status, OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn wait_zero_on_terminal_returns_immediately() {
        let engine = engine();
        let op = engine
            .create(task("Quick"), |_ctx| async { Ok(Metadata::new()) })
            .unwrap();
        engine.wait(&op.id, None).await.unwrap();

        let done = engine.wait(&op.id, Some(Duration::ZERO)).await.unwrap();
        assert_eq!(done.status, OperationStatus::Success);
    }

    #[tokio::test]
    async fn wait_timeout_leaves_operation_running() {
        let engine = engine();
        let op = engine
            .create(task("Slow").cancellable(), |ctx| async move {
                ctx.cancelled().await;
                Err(Cancelled.into())
            })
            .unwrap();

        let err = engine
            .wait(&op.id, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Timeout(_)));
        assert!(!engine.get(&op.id).unwrap().status.is_terminal());

        engine.cancel(&op.id).await.unwrap();
    }

    #[tokio::test]
    async fn exclusive_resources_admit_one_operation() {
        let engine = engine();
        let spec = || {
            task("Starting container")
                .resource("containers", "/1.0/containers/c1")
                .exclusive()
        };
        let block = |ctx: OperationContext| async move {
            ctx.cancelled().await;
            Ok(Metadata::new())
        };

        let (a, b) = tokio::join!(
            async { engine.create(spec().cancellable(), block) },
            async { engine.create(spec().cancellable(), block) },
        );
        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(OperationError::InvalidResource(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 1);

        // The claim is released once the holder finishes
        let holder = results.into_iter().find_map(|r| r.ok()).unwrap();
        engine.cancel(&holder.id).await.unwrap();
        assert!(engine.create(spec(), |_ctx| async { Ok(Metadata::new()) }).is_ok());
    }

    #[tokio::test]
    async fn admission_cap_rejects_with_overloaded() {
        let engine = engine_with(EngineConfig {
            max_operations: 1,
            ..EngineConfig::default()
        });
        let first = engine
            .create(task("Holding").cancellable(), |ctx| async move {
                ctx.cancelled().await;
                Err(Cancelled.into())
            })
            .unwrap();

        let err = engine
            .create(task("Rejected"), |_ctx| async { Ok(Metadata::new()) })
            .unwrap_err();
        assert!(matches!(err, OperationError::Overloaded { limit: 1 }));

        engine.cancel(&first.id).await.unwrap();
        assert!(engine.create(task("Admitted"), |_ctx| async { Ok(Metadata::new()) }).is_ok());
    }

    #[tokio::test]
    async fn oversized_limit_is_clamped() {
        let engine = engine_with(EngineConfig {
            max_operations: usize::MAX,
            ..EngineConfig::default()
        });
        assert_eq!(engine.config().max_operations, Semaphore::MAX_PERMITS);
        assert_eq!(engine.active(), 0);

        let op = engine
            .create(task("Unbounded"), |_ctx| async { Ok(Metadata::new()) })
            .unwrap();
        let done = engine.wait(&op.id, None).await.unwrap();
        assert_eq!(done.status, OperationStatus::Success);
    }

    #[tokio::test]
    async fn status_events_are_ordered() {
        let engine = engine();
        let mut sub = engine.events().subscribe();
        let op = engine
            .create(task("Observed"), |ctx| async move {
                ctx.set_metadata("progress", "50");
                Ok(progress("100"))
            })
            .unwrap();
        engine.wait(&op.id, None).await.unwrap();

        let mut statuses = Vec::new();
        while let Some(event) = sub.try_recv() {
            assert_eq!(event.event_type, EventType::Operation);
            statuses.push(event.metadata["status"].as_str().unwrap().to_string());
        }
        assert_eq!(statuses.first().map(String::as_str), Some("Pending"));
        assert_eq!(statuses.last().map(String::as_str), Some("Success"));
        assert!(statuses.contains(&"Running".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn detached_work_never_follows_terminal_event() {
        let engine = engine_with(EngineConfig {
            cancel_grace: Duration::from_millis(5),
            ..EngineConfig::default()
        });
        let mut sub = engine
            .events()
            .subscribe_with(EventFilter::types([EventType::Operation]), 1 << 20);
        let stop = Arc::new(AtomicBool::new(false));
        let running = stop.clone();
        let op = engine
            .create(task("Ignoring cancel").cancellable(), move |ctx| async move {
                let mut tick = 0u64;
                while tick < 20_000 && !running.load(Ordering::Relaxed) {
                    ctx.set_metadata("tick", tick);
                    tick += 1;
                    tokio::task::yield_now().await;
                }
                Ok(Metadata::new())
            })
            .unwrap();
        until_running(&engine, &op.id).await;

        let done = engine.cancel(&op.id).await.unwrap();
        assert_eq!(done.status, OperationStatus::Cancelled);
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.store(true, Ordering::Relaxed);

        let statuses: Vec<String> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.metadata["status"].as_str().unwrap().to_string())
            .collect();
        let terminal = statuses
            .iter()
            .position(|s| s == "Cancelled")
            .expect("cancelled event published");
        assert!(statuses[terminal..].iter().all(|s| s == "Cancelled"));
        assert_eq!(statuses[terminal..].len(), 1);
    }

    #[tokio::test]
    async fn delete_only_terminal_operations() {
        let engine = engine();
        let op = engine
            .create(task("Holding").cancellable(), |ctx| async move {
                ctx.cancelled().await;
                Err(Cancelled.into())
            })
            .unwrap();

        assert!(matches!(
            engine.delete(&op.id),
            Err(OperationError::NotTerminal(_))
        ));
        engine.cancel(&op.id).await.unwrap();
        engine.delete(&op.id).unwrap();
        assert!(matches!(engine.get(&op.id), Err(OperationError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_expired_operations() {
        let engine = engine_with(EngineConfig {
            retention: Duration::from_secs(5),
            reap_interval: Duration::from_secs(1),
            ..EngineConfig::default()
        });
        let reaper = engine.spawn_reaper();
        let op = engine
            .create(task("Short"), |_ctx| async { Ok(Metadata::new()) })
            .unwrap();
        engine.wait(&op.id, None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(engine.get(&op.id).is_ok());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(engine.get(&op.id), Err(OperationError::NotFound(_))));

        engine.shutdown(Duration::from_secs(1)).await;
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_and_rejects_new_work() {
        let engine = engine();
        let op = engine
            .create(task("Draining").cancellable(), |ctx| async move {
                ctx.cancelled().await;
                Err(Cancelled.into())
            })
            .unwrap();
        until_running(&engine, &op.id).await;

        let remaining = engine.shutdown(Duration::from_secs(5)).await;
        assert_eq!(remaining, 0);
        assert_eq!(engine.get(&op.id).unwrap().status, OperationStatus::Cancelled);
        assert!(matches!(
            engine.create(task("Late"), |_ctx| async { Ok(Metadata::new()) }),
            Err(OperationError::Overloaded { .. })
        ));
    }

    #[tokio::test]
    async fn interactive_operation_publishes_secrets() {
        let engine = engine();
        let op = engine
            .create_interactive(
                OperationSpec::new(OperationClass::Websocket, "Executing command"),
                &[StreamName::Stdout, StreamName::Control],
                |_ctx, mut pipes| async move {
                    pipes.wait_connected().await;
                    Ok(Metadata::new())
                },
            )
            .unwrap();

        let fds = op.metadata["fds"].as_object().unwrap();
        assert_eq!(fds.len(), 2);
        assert!(fds.contains_key("1"));
        assert!(fds.contains_key("control"));
        assert!(engine.sessions().is_registered(&op.id));
    }
}
