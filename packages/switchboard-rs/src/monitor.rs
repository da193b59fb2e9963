//! Cancellable push-based subscriptions over host event sources.
//!
//! A [`Monitor`] is returned by a command handler. The dispatcher starts it,
//! registers its [`MonitorHandle`] under the execution id, and forwards every
//! mapped event as a `PARTIAL` record until the monitor terminates.
//!
//! # State Machine
//!
//! ```text
//! Idle ──start()──► Running ──stop() / source closed──► Stopped
//! ```
//!
//! - Entering `Running` runs the optional init hook (which may emit an initial
//!   snapshot partial) and then subscribes to the source.
//! - `stop()` is the only way out short of the source itself closing. There is
//!   no timeout.
//! - Leaving `Running` drops the subscription, runs the optional finish hook,
//!   and returns a [`Completion`].
//!
//! # Races
//!
//! `stop()` takes effect at the next scheduling point of the run loop. An
//! event already mapped and emitted before that point is still delivered.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::host::{EventKind, EventSource, HostEvent};

/// Tracing target for monitor lifecycle events.
pub(crate) const MONITOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::monitor");

/// How a stream (monitor or sequence) came to an end.
///
/// This replaces unwinding with sentinel errors: the run loop simply returns
/// the reason it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    /// The source ran dry on its own.
    Completed,
    /// An explicit stop signal ended the stream.
    Stopped,
}

/// Lifecycle state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Constructed, not yet subscribed.
    Idle,
    /// Subscribed and forwarding events.
    Running,
    /// Unsubscribed; terminal.
    Stopped,
}

impl MonitorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Stopped => 2,
        }
    }
}

/// Sending half of a partial-result stream.
///
/// Cheap to clone. Emitting after the receiving side has finished is a
/// silent no-op.
#[derive(Debug, Clone)]
pub struct PartialSink {
    tx: mpsc::UnboundedSender<Value>,
}

impl PartialSink {
    /// Creates a connected sink/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emits one partial payload. Returns `false` if nobody is listening.
    pub fn emit(&self, payload: Value) -> bool {
        self.tx.send(payload).is_ok()
    }
}

/// Maps a raw host event to an optional partial payload.
///
/// Returning `None` suppresses the event.
pub type MapFn = Arc<dyn Fn(&HostEvent) -> Option<Value> + Send + Sync>;

type Hook = Box<dyn FnOnce(&PartialSink) + Send>;
type Subscribe = Box<dyn FnOnce() -> broadcast::Receiver<HostEvent> + Send>;

/// Shared control handle for a monitor.
///
/// Held by the [`MonitorRegistry`]; stopping it ends the monitor's run loop.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl MonitorHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(AtomicU8::new(MonitorState::Idle.as_u8())),
        }
    }

    /// Signals the monitor to stop. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether both handles control the same monitor.
    pub fn same_monitor(&self, other: &MonitorHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn set_state(&self, state: MonitorState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// A cancellable subscription to one kind of host event.
///
/// # Example
///
/// ```ignore
/// // Only report messages we sent ourselves.
/// let monitor = Monitor::new(messages.clone(), EventKind::Add).with_map(|event| {
///     let item = event.item()?;
///     item["fromMe"].as_bool()?.then(|| json!({ "item": item }))
/// });
/// Ok(monitor.into())
/// ```
pub struct Monitor {
    kind: EventKind,
    subscribe: Subscribe,
    map: MapFn,
    init: Option<Hook>,
    finish: Option<Hook>,
    handle: MonitorHandle,
}

impl Monitor {
    /// Creates an idle monitor over `source` for events of `kind`.
    ///
    /// The default mapping forwards the raw arguments as `{"args": [...]}`.
    pub fn new<S>(source: Arc<S>, kind: EventKind) -> Self
    where
        S: EventSource + ?Sized + 'static,
    {
        Self {
            kind,
            subscribe: Box::new(move || source.subscribe()),
            map: Arc::new(|event: &HostEvent| Some(json!({ "args": event.args }))),
            init: None,
            finish: None,
            handle: MonitorHandle::new(),
        }
    }

    /// Replaces the event mapping.
    pub fn with_map<F>(mut self, map: F) -> Self
    where
        F: Fn(&HostEvent) -> Option<Value> + Send + Sync + 'static,
    {
        self.map = Arc::new(map);
        self
    }

    /// Runs `hook` when the monitor starts, before subscribing.
    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&PartialSink) + Send + 'static,
    {
        self.init = Some(Box::new(hook));
        self
    }

    /// Runs `hook` after the monitor has unsubscribed.
    pub fn on_finish<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&PartialSink) + Send + 'static,
    {
        self.finish = Some(Box::new(hook));
        self
    }

    /// The event kind this monitor listens for.
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// A control handle for this monitor.
    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// Enters `Running`: runs the init hook and subscribes.
    ///
    /// Everything here is synchronous, so once this returns the subscription
    /// is live and no event can slip past.
    pub fn start(self, sink: PartialSink) -> RunningMonitor {
        if let Some(init) = self.init {
            init(&sink);
        }
        let receiver = (self.subscribe)();
        self.handle.set_state(MonitorState::Running);
        debug!(target: MONITOR_TARGET, kind = %self.kind, "monitor subscribed");

        RunningMonitor {
            kind: self.kind,
            receiver,
            map: self.map,
            finish: self.finish,
            sink,
            handle: self.handle,
        }
    }

    /// Starts the monitor and runs it to termination.
    pub async fn monitor(self, sink: PartialSink) -> Completion {
        self.start(sink).run().await
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("kind", &self.kind)
            .field("state", &self.handle.state())
            .finish()
    }
}

/// A subscribed monitor, ready to run.
pub struct RunningMonitor {
    kind: EventKind,
    receiver: broadcast::Receiver<HostEvent>,
    map: MapFn,
    finish: Option<Hook>,
    sink: PartialSink,
    handle: MonitorHandle,
}

impl RunningMonitor {
    /// Forwards matching events until stopped or the source closes.
    pub async fn run(self) -> Completion {
        let RunningMonitor {
            kind,
            mut receiver,
            map,
            finish,
            sink,
            handle,
        } = self;

        let deliver = |event: &HostEvent| {
            if event.kind != kind {
                return;
            }
            if let Some(payload) = map(event) {
                sink.emit(payload);
            }
        };

        let completion = loop {
            tokio::select! {
                biased;
                _ = handle.token.cancelled() => {
                    // Events raised before the stop still belong to this monitor.
                    loop {
                        match receiver.try_recv() {
                            Ok(event) => deliver(&event),
                            Err(TryRecvError::Lagged(missed)) => {
                                warn!(target: MONITOR_TARGET, kind = %kind, missed, "monitor lagged behind its source, events were missed");
                            }
                            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                        }
                    }
                    break Completion::Stopped;
                }
                received = receiver.recv() => match received {
                    Ok(event) => deliver(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(
                            target: MONITOR_TARGET,
                            kind = %kind,
                            missed,
                            "monitor lagged behind its source, events were missed"
                        );
                    }
                    Err(RecvError::Closed) => break Completion::Completed,
                },
            }
        };

        drop(receiver);
        if let Some(finish) = finish {
            finish(&sink);
        }
        handle.set_state(MonitorState::Stopped);
        debug!(target: MONITOR_TARGET, kind = %kind, ?completion, "monitor finished");

        completion
    }

    /// A control handle for this monitor.
    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }
}

/// Active monitors keyed by execution id.
///
/// One handle per id. Adding under an id that already holds a live monitor
/// replaces the entry without stopping the old monitor; the old one keeps
/// running but can no longer be reached through the registry. Callers that
/// reuse execution ids must stop the previous monitor first.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: DashMap<String, MonitorHandle>,
}

impl MonitorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            monitors: DashMap::new(),
        }
    }

    /// Binds `handle` under `execution_id`, replacing any previous binding.
    ///
    /// Returns the replaced handle, if any.
    pub fn add(&self, execution_id: impl Into<String>, handle: MonitorHandle) -> Option<MonitorHandle> {
        let execution_id = execution_id.into();
        let previous = self.monitors.insert(execution_id.clone(), handle);
        if let Some(old) = &previous {
            if old.state() != MonitorState::Stopped {
                warn!(
                    target: MONITOR_TARGET,
                    %execution_id,
                    "replacing a live monitor; the previous monitor is no longer stoppable"
                );
            }
        }
        info!(target: MONITOR_TARGET, %execution_id, "monitor registered");
        previous
    }

    /// Stops and unbinds the monitor under `execution_id`.
    ///
    /// Returns `false` if nothing was bound.
    pub fn remove(&self, execution_id: &str) -> bool {
        match self.monitors.remove(execution_id) {
            Some((_, handle)) => {
                handle.stop();
                info!(target: MONITOR_TARGET, %execution_id, "monitor stopped");
                true
            }
            None => false,
        }
    }

    /// Unbinds `execution_id` only if it still refers to `handle`.
    ///
    /// Used when a monitor terminates on its own, so that a replacement
    /// registered under the same id is left alone.
    pub fn release(&self, execution_id: &str, handle: &MonitorHandle) -> bool {
        self.monitors
            .remove_if(execution_id, |_, current| current.same_monitor(handle))
            .is_some()
    }

    /// Whether a monitor is bound under `execution_id`.
    pub fn contains(&self, execution_id: &str) -> bool {
        self.monitors.contains_key(execution_id)
    }

    /// Number of bound monitors.
    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    /// Whether no monitors are bound.
    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Execution ids with a bound monitor, in no particular order.
    pub fn ids(&self) -> Vec<String> {
        self.monitors.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stops and unbinds every monitor. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        let ids = self.ids();
        ids.iter().filter(|id| self.remove(id)).count()
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("active", &self.monitors.len())
            .finish()
    }
}
