//! The dispatcher: batch intake, execution, result classification.
//!
//! [`Dispatcher::poll`] is the whole external surface. It validates each batch
//! item, spawns one task per valid item, and returns whatever results have
//! accumulated so far. It never blocks on an execution and never fails.
//!
//! ```text
//! poll([{exId, command, params}, ...])
//!   │
//!   ├─ invalid item ──────────────────────────► errors[]
//!   │
//!   └─ valid item ─► spawn ─► root.execute_command(command, params)
//!                                 │
//!                ┌────────────────┼──────────────────┐
//!                ▼                ▼                  ▼
//!              Value           Monitor            Sequence
//!                │        register, run,        run to end,
//!                │        PARTIAL per event     PARTIAL per item
//!                │                │                  │
//!                └────────► FINAL (or ERROR) ◄───────┘
//! ```
//!
//! # Execution Lifecycle
//!
//! Each execution id gets exactly one terminal record (`FINAL` or `ERROR`),
//! and it is always the last record for that id. Streams forward partials
//! through a channel which is fully drained before the terminal record is
//! appended.
//!
//! Handler panics are caught and reported as an `ERROR` record named `Panic`.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, Weak};

use futures::future::BoxFuture;
use futures::{Future, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SwitchboardConfig;
use crate::error::{BatchError, CommandError, SwitchboardError};
use crate::inflight::InflightTracker;
use crate::manager::{
    parse_params, CommandOutput, CommandRegistry, CommandResult, Commands, Manager, Submanagers,
    COMMAND_SEPARATOR,
};
use crate::monitor::{MonitorHandle, MonitorRegistry, PartialSink};
use crate::result::{ResultQueue, ResultRecord};

/// Tracing target for dispatch.
pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

// =============================================================================
// Execution Requests
// =============================================================================

/// One validated batch item.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Caller-supplied correlation token.
    pub execution_id: String,
    /// Command path, e.g. `chats|c1|getModel`.
    pub command: String,
    /// Command params; absent or `null` becomes `{}`.
    pub params: Value,
}

impl ExecutionRequest {
    /// Creates a request directly.
    pub fn new(execution_id: impl Into<String>, command: impl Into<String>, params: Value) -> Self {
        Self {
            execution_id: execution_id.into(),
            command: command.into(),
            params: non_null(params),
        }
    }

    /// Validates one raw batch item.
    ///
    /// `exId` must be a non-empty string or a non-zero number, `command` a
    /// non-empty string. The execution id is checked first.
    pub fn from_value(item: Value) -> Result<Self, BatchError> {
        let Some(execution_id) = item.get("exId").and_then(id_string) else {
            return Err(BatchError::missing_execution_id(item));
        };
        let command = match item.get("command").and_then(Value::as_str) {
            Some(command) if !command.is_empty() => command.to_string(),
            _ => return Err(BatchError::missing_command(item)),
        };
        let params = item.get("params").cloned().unwrap_or(Value::Null);

        Ok(Self::new(execution_id, command, params))
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(number) if number.as_f64() != Some(0.0) => Some(number.to_string()),
        _ => None,
    }
}

fn non_null(params: Value) -> Value {
    if params.is_null() {
        Value::Object(Map::new())
    } else {
        params
    }
}

/// What [`Dispatcher::poll`] returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollResponse {
    /// Every result record appended since the previous poll.
    pub results: Vec<ResultRecord>,
    /// Batch items rejected in this call.
    pub errors: Vec<BatchError>,
}

// =============================================================================
// Root Manager
// =============================================================================

/// The root of the manager tree.
///
/// Adds `ping` and `stopMonitor` to the built-ins.
pub struct RootManager {
    submanagers: Submanagers,
    monitors: Arc<MonitorRegistry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopMonitorParams {
    monitor_id: Value,
}

impl RootManager {
    fn new(monitors: Arc<MonitorRegistry>) -> Self {
        Self {
            submanagers: Submanagers::new(),
            monitors,
        }
    }

    async fn ping(&self, _params: Value) -> CommandResult {
        CommandOutput::value("pong")
    }

    async fn stop_monitor(&self, params: Value) -> CommandResult {
        let StopMonitorParams { monitor_id } = parse_params(params)?;
        let stopped = match id_string(&monitor_id) {
            Some(monitor_id) => self.monitors.remove(&monitor_id),
            None => false,
        };
        CommandOutput::value(stopped)
    }

    /// The registry of running monitors.
    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }
}

impl Commands for RootManager {
    fn registry() -> &'static CommandRegistry<Self> {
        static REGISTRY: OnceLock<CommandRegistry<RootManager>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            CommandRegistry::<Self>::new()
                .command("ping", |m, p| m.ping(p).boxed())
                .command("stopMonitor", |m, p| m.stop_monitor(p).boxed())
        })
    }

    fn submanagers(&self) -> &Submanagers {
        &self.submanagers
    }
}

/// Non-owning reference to the root manager.
///
/// Handed to managers that need to reach elsewhere in the tree. Holding one
/// does not keep the tree alive.
#[derive(Clone)]
pub struct RootHandle {
    root: Weak<RootManager>,
}

impl RootHandle {
    /// A handle that never resolves.
    pub fn detached() -> Self {
        Self { root: Weak::new() }
    }

    fn upgrade(&self) -> Result<Arc<RootManager>, CommandError> {
        self.root
            .upgrade()
            .ok_or_else(|| CommandError::Other(anyhow::anyhow!("the dispatcher has been dropped")))
    }

    /// Walks `path` (submanager names joined by the separator) from the root.
    ///
    /// An empty path resolves to the root itself.
    pub fn resolve(&self, path: &str) -> Result<Arc<dyn Manager>, CommandError> {
        let mut current: Arc<dyn Manager> = self.upgrade()?;
        if path.is_empty() {
            return Ok(current);
        }
        for segment in path.split(COMMAND_SEPARATOR) {
            current = current.get_submanager(segment)?;
        }
        Ok(current)
    }

    /// Executes a command path from the root, without going through the
    /// result queue.
    pub fn execute_command(&self, path: &str, params: Value) -> BoxFuture<'static, CommandResult> {
        let root = self.upgrade();
        let path = path.to_string();
        async move { root?.execute_command(&path, params).await }.boxed()
    }
}

impl std::fmt::Debug for RootHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootHandle")
            .field("alive", &(self.root.strong_count() > 0))
            .finish()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Builder for [`Dispatcher`].
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    config: SwitchboardConfig,
    runtime: Option<Handle>,
    push: Option<mpsc::UnboundedSender<ResultRecord>>,
}

impl DispatcherBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config`.
    pub fn config(mut self, config: SwitchboardConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn executions on `runtime` instead of the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Deliver results to `sender` instead of buffering them for `poll`.
    pub fn push_results(mut self, sender: mpsc::UnboundedSender<ResultRecord>) -> Self {
        self.push = Some(sender);
        self
    }

    /// Build the dispatcher.
    ///
    /// Fails if no runtime was supplied and none is current.
    pub fn build(self) -> Result<Dispatcher, SwitchboardError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()?,
        };

        let mut results = ResultQueue::new().with_limit(self.config.max_pending_results);
        if let Some(push) = self.push {
            results = results.with_push(push);
        }

        let monitors = Arc::new(MonitorRegistry::new());
        let root = Arc::new(RootManager::new(monitors.clone()));

        info!(
            target: DISPATCH_TARGET,
            push = results.is_push(),
            max_pending = ?self.config.max_pending_results,
            "dispatcher ready"
        );

        Ok(Dispatcher {
            inner: Arc::new(Inner {
                root,
                monitors,
                results,
                inflight: Arc::new(InflightTracker::new()),
                runtime,
                config: self.config,
            }),
        })
    }
}

/// Entry point of the command protocol.
///
/// Cheap to clone; all clones share one manager tree and one result queue.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Dispatcher::new()?;
/// dispatcher.add_submanager("contacts", Arc::new(CollectionManager::new(contacts)));
///
/// dispatcher.poll([json!({"exId": "1", "command": "contacts|getLength"})]);
/// dispatcher.wait_idle().await;
///
/// let PollResponse { results, .. } = dispatcher.poll(None);
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    root: Arc<RootManager>,
    monitors: Arc<MonitorRegistry>,
    results: ResultQueue,
    inflight: Arc<InflightTracker>,
    runtime: Handle,
    config: SwitchboardConfig,
}

impl Dispatcher {
    /// Build a dispatcher with default configuration on the current runtime.
    pub fn new() -> Result<Self, SwitchboardError> {
        DispatcherBuilder::new().build()
    }

    /// Start building a dispatcher.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Accepts a batch of execution requests and drains the result queue.
    ///
    /// Valid items are scheduled without waiting; their results show up in
    /// later polls. Pass `None` or an empty batch to only drain.
    pub fn poll<I>(&self, executions: I) -> PollResponse
    where
        I: IntoIterator<Item = Value>,
    {
        let mut errors = Vec::new();
        for item in executions {
            match ExecutionRequest::from_value(item) {
                Ok(request) => self.submit(request),
                Err(rejected) => {
                    warn!(
                        target: DISPATCH_TARGET,
                        reason = rejected.name,
                        item = %rejected.executions_obj,
                        "rejected batch item"
                    );
                    errors.push(rejected);
                }
            }
        }

        PollResponse {
            results: self.inner.results.drain(),
            errors,
        }
    }

    /// Schedules one execution.
    pub fn submit(&self, request: ExecutionRequest) {
        if self.inner.config.log_params {
            debug!(
                target: DISPATCH_TARGET,
                execution_id = %request.execution_id,
                command = %request.command,
                params = %request.params,
                "dispatching"
            );
        } else {
            debug!(
                target: DISPATCH_TARGET,
                execution_id = %request.execution_id,
                command = %request.command,
                "dispatching"
            );
        }

        // Taken before spawning so wait_idle never misses accepted work.
        let guard = self.inner.inflight.enter();
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let _guard = guard;
            inner.execute(request).await;
        });
    }

    /// Takes every buffered result record.
    pub fn drain(&self) -> Vec<ResultRecord> {
        self.inner.results.drain()
    }

    /// Binds a top-level submanager (last write wins).
    pub fn add_submanager(&self, name: &str, manager: Arc<dyn Manager>) {
        self.inner.root.add_submanager(name, manager);
    }

    /// Unbinds a top-level submanager.
    pub fn remove_submanager(&self, name: &str) -> bool {
        self.inner.root.remove_submanager(name)
    }

    /// A non-owning handle to the root manager.
    pub fn root_handle(&self) -> RootHandle {
        RootHandle {
            root: Arc::downgrade(&self.inner.root),
        }
    }

    /// The root manager.
    pub fn root(&self) -> Arc<dyn Manager> {
        self.inner.root.clone()
    }

    /// The registry of running monitors.
    pub fn monitors(&self) -> &MonitorRegistry {
        &self.inner.monitors
    }

    /// The result queue.
    pub fn results(&self) -> &ResultQueue {
        &self.inner.results
    }

    /// Stops the monitor running under `execution_id`.
    pub fn stop_monitor(&self, execution_id: &str) -> bool {
        self.inner.monitors.remove(execution_id)
    }

    /// Number of executions that have not yet terminated.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.count()
    }

    /// Waits until every accepted execution has terminated.
    ///
    /// Running monitors count, so stop them first or this waits forever.
    pub async fn wait_idle(&self) {
        self.inner.inflight.wait_zero().await;
    }

    /// Stops every running monitor. Returns how many were stopped.
    pub fn shutdown(&self) -> usize {
        let stopped = self.inner.monitors.stop_all();
        info!(target: DISPATCH_TARGET, stopped, "dispatcher shutting down");
        stopped
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("inflight", &self.inner.inflight.count())
            .field("monitors", &self.inner.monitors.len())
            .field("results", &self.inner.results)
            .finish()
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Unbinds a monitor on drop, so a panicking monitor never stays registered.
struct MonitorRegistration<'a> {
    registry: &'a MonitorRegistry,
    execution_id: &'a str,
    handle: MonitorHandle,
}

impl Drop for MonitorRegistration<'_> {
    fn drop(&mut self) {
        self.registry.release(self.execution_id, &self.handle);
    }
}

impl Inner {
    async fn execute(&self, request: ExecutionRequest) {
        let ExecutionRequest {
            execution_id,
            command,
            params,
        } = request;

        let outcome = AssertUnwindSafe(self.run(&execution_id, &command, params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                debug!(target: DISPATCH_TARGET, %execution_id, %command, "execution finished");
                self.results.set_final(&execution_id, value);
            }
            Ok(Err(err)) => {
                warn!(target: DISPATCH_TARGET, %execution_id, %command, error = %err, "command failed");
                self.results.set_error(&execution_id, err.to_payload());
            }
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(target: DISPATCH_TARGET, %execution_id, %command, panic = %panic_msg, "handler panicked");
                self.results
                    .set_error(&execution_id, CommandError::panicked(panic_msg).to_payload());
            }
        }
    }

    async fn run(&self, execution_id: &str, command: &str, params: Value) -> Result<Value, CommandError> {
        let output = self.root.execute_command(command, params).await?;
        debug!(target: DISPATCH_TARGET, %execution_id, shape = output.shape(), "handler resolved");

        match output {
            CommandOutput::Value(value) => Ok(value),
            CommandOutput::Monitor(monitor) => {
                let _registration = MonitorRegistration {
                    registry: &self.monitors,
                    execution_id,
                    handle: monitor.handle(),
                };
                self.monitors.add(execution_id, monitor.handle());

                let (sink, partials) = PartialSink::channel();
                let running = monitor.start(sink);
                let completion = self.forward(execution_id, partials, running.run()).await;
                Ok(json!({ "completion": completion }))
            }
            CommandOutput::Sequence(sequence) => {
                let (sink, partials) = PartialSink::channel();
                let completion = self
                    .forward(execution_id, partials, sequence.iter(sink))
                    .await?;
                Ok(json!({ "completion": completion }))
            }
        }
    }

    /// Drives `run` while forwarding partials, then drains what is left.
    async fn forward<F, T>(&self, execution_id: &str, mut partials: mpsc::UnboundedReceiver<Value>, run: F) -> T
    where
        F: Future<Output = T>,
    {
        tokio::pin!(run);
        let outcome = loop {
            tokio::select! {
                biased;
                Some(partial) = partials.recv() => {
                    self.results.set_partial(execution_id, partial);
                }
                outcome = &mut run => break outcome,
            }
        };

        partials.close();
        while let Ok(partial) = partials.try_recv() {
            self.results.set_partial(execution_id, partial);
        }
        outcome
    }
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
