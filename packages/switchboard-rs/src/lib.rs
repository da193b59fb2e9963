//! # Switchboard
//!
//! An in-process command router with an asynchronous result queue,
//! cancellable monitors and lazy sequences.
//!
//! ## Core Concepts
//!
//! A host application exposes its object model as a tree of **managers**.
//! An external controller talks to that tree through a single call:
//!
//! - it submits batches of `{exId, command, params}`
//! - it drains `{exId, type, params}` result records on every poll
//!
//! Commands resolve to one of three shapes:
//! - a plain value, delivered as one `FINAL` record
//! - a [`Monitor`], streamed as `PARTIAL` records until stopped
//! - a [`LazySequence`], streamed as `PARTIAL` records until exhausted
//!
//! ## Architecture
//!
//! ```text
//! Controller
//!     │
//!     ▼ poll(batch)
//! Dispatcher ─── errors[] (invalid items) ──────────────────┐
//!     │                                                     │
//!     ▼ spawn per item                                      │
//! RootManager.execute_command("chats|c1|monitorField")      │
//!     │                                                     │
//!     ├─► CollectionManager "chats"                         │
//!     │       └─► ModelManager "c1" (built on demand)       │
//!     │               └─► Monitor ──► PARTIAL ... ──┐       │
//!     │                                             ▼       │
//!     └──────────────────────────────────────► ResultQueue ─┴─► results[]
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One terminal record per execution**: exactly one `FINAL` or `ERROR`,
//!    always the last record for its execution id
//! 2. **poll never fails**: execution failures become `ERROR` records, batch
//!    shape failures become `errors` entries
//! 3. **Left-to-right resolution**: a path is split on its first separator;
//!    a manager only ever sees the remainder
//! 4. **Explicit cancellation only**: a monitor runs until `stopMonitor` or
//!    until its host source goes away
//! 5. **Drain on read**: each record is delivered at most once
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use switchboard::{CollectionManager, Dispatcher, MemoryCollection, MemoryModel};
//!
//! let contacts = Arc::new(MemoryCollection::new());
//! contacts.add(MemoryModel::new("c1", json!({"name": "Ann"})));
//!
//! let dispatcher = Dispatcher::new()?;
//! dispatcher.add_submanager("contacts", Arc::new(CollectionManager::new(contacts.clone())));
//!
//! dispatcher.poll([
//!     json!({"exId": "1", "command": "contacts|c1|getModel"}),
//!     json!({"exId": "2", "command": "contacts|monitorAdd"}),
//! ]);
//!
//! contacts.add(MemoryModel::new("c2", json!({"name": "Bob"})));
//!
//! // Later: FINAL for "1", PARTIAL {"item": {...c2}} for "2"
//! let response = dispatcher.poll(None);
//!
//! // Stop the monitor; "2" then receives FINAL {"completion": "stopped"}
//! dispatcher.poll([json!({
//!     "exId": "3",
//!     "command": "stopMonitor",
//!     "params": {"monitorId": "2"}
//! })]);
//! ```
//!
//! ## Built-in Operations
//!
//! | Path               | Where          | Result                         |
//! |--------------------|----------------|--------------------------------|
//! | `ping`             | root           | `"pong"`                       |
//! | `stopMonitor`      | root           | whether a monitor was stopped  |
//! | `getCommands`      | every manager  | every reachable operation      |
//! | `getSubmanagers`   | every manager  | child names and classes        |
//! | `removeSubmanager` | every manager  | whether a child was unbound    |

// Core modules
mod dispatch;
mod error;
mod inflight;
mod manager;
mod monitor;
mod result;
mod sequence;

// Host capability interface and generic managers over it
pub mod host;
pub mod model;

// In-memory host, used by tests and the CLI
pub mod memory;

// Environment configuration
pub mod config;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// End-to-end scenarios (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export error types
pub use crate::error::{BatchError, CommandError, SwitchboardError};

// Re-export result types
pub use result::{ResultQueue, ResultRecord, ResultType};

// Re-export monitor and sequence types
pub use monitor::{Completion, MapFn, Monitor, MonitorHandle, MonitorRegistry, MonitorState, PartialSink, RunningMonitor};
pub use sequence::{ItemSink, LazySequence};

// Re-export manager types
pub use manager::{
    collect_commands, parse_params, CommandInfo, CommandKind, CommandOutput, CommandRegistry,
    CommandResult, CommandTable, Commands, Handler, Manager, Submanagers, COMMAND_SEPARATOR,
};

// Re-export dispatcher types (primary entry point)
pub use dispatch::{
    Dispatcher, DispatcherBuilder, ExecutionRequest, PollResponse, RootHandle, RootManager,
};

// Re-export inflight tracking
pub use inflight::{InflightGuard, InflightTracker};

// Re-export host types
pub use host::{EventHub, EventKind, EventSource, HostCollection, HostEvent, HostModel};
pub use memory::{MemoryCollection, MemoryModel};
pub use model::{CollectionManager, ManagerFactory, ModelManager};

pub use config::SwitchboardConfig;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use futures::FutureExt;
