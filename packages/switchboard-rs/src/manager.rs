//! Command routers ("managers") and their per-type operation registries.
//!
//! A manager owns a namespace of operations and a table of child managers
//! ("submanagers"). Command paths are resolved strictly left to right: every
//! segment before the last [`COMMAND_SEPARATOR`] selects a submanager, the
//! terminal segment selects an operation on the manager reached.
//!
//! ```text
//! "chats|c1|monitorField"
//!   └─ root.get_submanager("chats")
//!        └─ chats.get_submanager("c1")          (may be constructed lazily)
//!             └─ c1.invoke("monitorField", params)
//! ```
//!
//! # Registration
//!
//! Operations are registered once per manager type in a static
//! [`CommandRegistry`], built on first use. Every registry created with
//! [`CommandRegistry::new`] starts with the built-ins shared by all managers:
//!
//! | Operation          | Params       | Result                                   |
//! |--------------------|--------------|------------------------------------------|
//! | `getCommands`      | none         | `{path: {"type": "command"|"monitor"}}`  |
//! | `getSubmanagers`   | none         | `{name: {"class": <type name>}}`         |
//! | `removeSubmanager` | `{name}`     | whether a submanager was unbound         |
//!
//! A registry can merge another type's registry through
//! [`CommandRegistry::inherit`]; operations already present win.
//!
//! # Example
//!
//! ```ignore
//! struct Greeter { submanagers: Submanagers }
//!
//! impl Greeter {
//!     async fn hello(&self, params: Value) -> CommandResult {
//!         let HelloParams { name } = parse_params(params)?;
//!         CommandOutput::value(format!("hello {name}"))
//!     }
//! }
//!
//! impl Commands for Greeter {
//!     fn registry() -> &'static CommandRegistry<Self> {
//!         static REGISTRY: OnceLock<CommandRegistry<Greeter>> = OnceLock::new();
//!         REGISTRY.get_or_init(|| {
//!             CommandRegistry::<Self>::new().command("hello", |m, p| m.hello(p).boxed())
//!         })
//!     }
//!
//!     fn submanagers(&self) -> &Submanagers {
//!         &self.submanagers
//!     }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use crate::error::CommandError;
use crate::monitor::Monitor;
use crate::sequence::LazySequence;

/// Reserved separator between command path segments.
pub const COMMAND_SEPARATOR: char = '|';

/// Tracing target for routing.
pub(crate) const ROUTER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::router");

/// What a command handler resolves to.
pub type CommandResult = Result<CommandOutput, CommandError>;

/// A registered handler for manager type `M`.
pub type Handler<M> =
    Arc<dyn for<'a> Fn(&'a M, Value) -> BoxFuture<'a, CommandResult> + Send + Sync>;

/// Flat mapping from (possibly prefixed) operation name to its metadata.
pub type CommandTable = BTreeMap<String, CommandInfo>;

// =============================================================================
// Command Output
// =============================================================================

/// The three result shapes a handler can produce.
#[derive(Debug)]
pub enum CommandOutput {
    /// Immediate value, delivered as the `FINAL` payload.
    Value(Value),
    /// Long-lived subscription, streamed as `PARTIAL`s until stopped.
    Monitor(Monitor),
    /// Finite stream, delivered as `PARTIAL`s then `FINAL`.
    Sequence(LazySequence),
}

impl CommandOutput {
    /// Serializes `value` into an immediate result.
    pub fn value<T: Serialize>(value: T) -> CommandResult {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    /// An immediate empty result.
    pub fn empty() -> CommandResult {
        Ok(Self::Value(Value::Null))
    }

    /// Short label for logs.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Monitor(_) => "monitor",
            Self::Sequence(_) => "sequence",
        }
    }
}

impl From<Value> for CommandOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Monitor> for CommandOutput {
    fn from(monitor: Monitor) -> Self {
        Self::Monitor(monitor)
    }
}

impl From<LazySequence> for CommandOutput {
    fn from(sequence: LazySequence) -> Self {
        Self::Sequence(sequence)
    }
}

// =============================================================================
// Command Registry
// =============================================================================

/// Kind of a registered operation, as reported by `getCommands`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Request/response operation.
    Command,
    /// Operation that returns a monitor.
    Monitor,
}

/// Metadata for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Operation kind.
    #[serde(rename = "type")]
    pub kind: CommandKind,
}

struct Entry<M> {
    kind: CommandKind,
    handler: Handler<M>,
}

/// Static mapping from operation name to handler for one manager type.
pub struct CommandRegistry<M> {
    entries: BTreeMap<String, Entry<M>>,
}

impl<M: Commands> CommandRegistry<M> {
    /// A registry pre-populated with the built-ins every manager exposes.
    pub fn new() -> Self {
        Self::empty()
            .command("getCommands", |manager: &M, _params| {
                async move { CommandOutput::value(collect_commands(manager)) }.boxed()
            })
            .command("getSubmanagers", |manager: &M, _params| {
                async move { CommandOutput::value(manager.submanagers().describe()) }.boxed()
            })
            .command("removeSubmanager", |manager: &M, params| {
                async move {
                    let NameParams { name } = parse_params(params)?;
                    CommandOutput::value(manager.submanagers().remove(&name))
                }
                .boxed()
            })
    }
}

impl<M: Commands> Default for CommandRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: 'static> CommandRegistry<M> {
    /// A registry with no operations at all, not even the built-ins.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registers a request/response operation.
    pub fn command<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a M, Value) -> BoxFuture<'a, CommandResult> + Send + Sync + 'static,
    {
        self.register(name.into(), CommandKind::Command, Arc::new(handler))
    }

    /// Registers an operation that returns a [`Monitor`].
    pub fn monitor<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a M, Value) -> BoxFuture<'a, CommandResult> + Send + Sync + 'static,
    {
        self.register(name.into(), CommandKind::Monitor, Arc::new(handler))
    }

    fn register(mut self, name: String, kind: CommandKind, handler: Handler<M>) -> Self {
        self.entries.insert(name, Entry { kind, handler });
        self
    }

    /// Merges every operation of `parent` not already registered here.
    ///
    /// Inherited handlers run against the `P` reached through `project`.
    pub fn inherit<P: 'static>(mut self, parent: &CommandRegistry<P>, project: fn(&M) -> &P) -> Self {
        for (name, entry) in &parent.entries {
            if self.entries.contains_key(name) {
                continue;
            }
            let inherited = entry.handler.clone();
            let handler = project_handler(inherited, project);
            self.entries.insert(
                name.clone(),
                Entry {
                    kind: entry.kind,
                    handler,
                },
            );
        }
        self
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Kind of the operation registered under `name`.
    pub fn kind(&self, name: &str) -> Option<CommandKind> {
        self.entries.get(name).map(|entry| entry.kind)
    }

    /// Names and kinds of every registered operation.
    pub fn table(&self) -> CommandTable {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), CommandInfo { kind: entry.kind }))
            .collect()
    }

    /// Invokes the operation registered under `name` against `manager`.
    pub async fn invoke(&self, manager: &M, name: &str, params: Value) -> CommandResult {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| CommandError::command_not_found(name))?;
        (entry.handler)(manager, params).await
    }
}

fn project_handler<M: 'static, P: 'static>(inner: Handler<P>, project: fn(&M) -> &P) -> Handler<M> {
    fn erase<M, F>(handler: F) -> Handler<M>
    where
        F: for<'a> Fn(&'a M, Value) -> BoxFuture<'a, CommandResult> + Send + Sync + 'static,
    {
        Arc::new(handler)
    }

    erase(move |manager: &M, params| inner(project(manager), params))
}

impl<M> std::fmt::Debug for CommandRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

/// Deserializes command params, treating `null` as `{}`.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, CommandError> {
    let params = if params.is_null() {
        Value::Object(Map::new())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|source| CommandError::value_error(format!("invalid params: {source}")))
}

// =============================================================================
// Submanager Table
// =============================================================================

/// Named child managers, enumerated in name order.
///
/// Binding a name that is already bound replaces the previous child.
#[derive(Default)]
pub struct Submanagers {
    table: RwLock<BTreeMap<String, Arc<dyn Manager>>>,
}

impl Submanagers {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `manager` under `name` (last write wins).
    pub fn add(&self, name: impl Into<String>, manager: Arc<dyn Manager>) {
        let name = name.into();
        trace!(target: ROUTER_TARGET, %name, class = manager.class_name(), "submanager bound");
        self.write().insert(name, manager);
    }

    /// The child bound under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Manager>> {
        self.read().get(name).cloned()
    }

    /// Unbinds `name`. Returns whether anything was bound.
    pub fn remove(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    /// Whether `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Number of bound children.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no children are bound.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the current bindings, so callers never hold the lock across
    /// an await point.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn Manager>)> {
        self.read()
            .iter()
            .map(|(name, manager)| (name.clone(), manager.clone()))
            .collect()
    }

    /// `{name: {"class": <type name>}}` for every child.
    pub fn describe(&self) -> Value {
        let described: Map<String, Value> = self
            .read()
            .iter()
            .map(|(name, manager)| (name.clone(), json!({ "class": manager.class_name() })))
            .collect();
        Value::Object(described)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<dyn Manager>>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<dyn Manager>>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Submanagers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submanagers")
            .field("names", &self.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Manager Traits
// =============================================================================

/// Implemented by every concrete manager type.
///
/// Provides the static registry and the submanager table; [`Manager`] is
/// derived from it.
pub trait Commands: Sized + Send + Sync + 'static {
    /// The operations of this type, built once.
    fn registry() -> &'static CommandRegistry<Self>;

    /// This manager's children.
    fn submanagers(&self) -> &Submanagers;

    /// Called when `name` is not bound. May construct, bind and return a
    /// child on demand.
    fn fallback_submanager(&self, _name: &str) -> Option<Arc<dyn Manager>> {
        None
    }

    /// Called before a bound child named `name` is used. Returning `false`
    /// unbinds it, and resolution continues as if it had never been bound.
    fn submanager_is_current(&self, _name: &str) -> bool {
        true
    }
}

/// Object-safe view of a manager, used for tree traversal.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Short type name, as reported by `getSubmanagers`.
    fn class_name(&self) -> &'static str;

    /// This manager's children.
    fn submanager_table(&self) -> &Submanagers;

    /// This manager's own operations, without children.
    fn command_table(&self) -> CommandTable;

    /// Resolves one child, falling back to on-demand construction.
    fn get_submanager(&self, name: &str) -> Result<Arc<dyn Manager>, CommandError>;

    /// Invokes one of this manager's own operations.
    async fn invoke(&self, command: &str, params: Value) -> CommandResult;

    /// Resolves `path` and invokes the operation it names.
    ///
    /// The path is split on the first separator only, so the child name
    /// never contains a separator but the remainder may.
    async fn execute_command(&self, path: &str, params: Value) -> CommandResult {
        match path.split_once(COMMAND_SEPARATOR) {
            Some((child, remainder)) => {
                trace!(target: ROUTER_TARGET, manager = self.class_name(), child, remainder, "descending");
                let submanager = self.get_submanager(child)?;
                submanager.execute_command(remainder, params).await
            }
            None => self.invoke(path, params).await,
        }
    }

    /// Binds a child (last write wins).
    fn add_submanager(&self, name: &str, manager: Arc<dyn Manager>) {
        self.submanager_table().add(name, manager);
    }

    /// Unbinds a child. Returns whether anything was bound.
    fn remove_submanager(&self, name: &str) -> bool {
        self.submanager_table().remove(name)
    }
}

#[async_trait]
impl<M: Commands> Manager for M {
    fn class_name(&self) -> &'static str {
        short_type_name::<M>()
    }

    fn submanager_table(&self) -> &Submanagers {
        self.submanagers()
    }

    fn command_table(&self) -> CommandTable {
        M::registry().table()
    }

    fn get_submanager(&self, name: &str) -> Result<Arc<dyn Manager>, CommandError> {
        if let Some(manager) = self.submanagers().get(name) {
            if self.submanager_is_current(name) {
                return Ok(manager);
            }
            self.submanagers().remove(name);
            debug!(target: ROUTER_TARGET, parent = short_type_name::<M>(), %name, "stale submanager unbound");
        }
        match self.fallback_submanager(name) {
            Some(manager) => {
                debug!(target: ROUTER_TARGET, parent = short_type_name::<M>(), %name, "submanager constructed on demand");
                Ok(manager)
            }
            None => Err(CommandError::manager_not_found(name)),
        }
    }

    async fn invoke(&self, command: &str, params: Value) -> CommandResult {
        M::registry().invoke(self, command, params).await
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

/// Every operation reachable from `manager`, children prefixed with
/// `<name>|`.
///
/// A child that is also an ancestor on the current path is skipped, so a
/// mistakenly registered back-reference cannot cause infinite recursion.
pub fn collect_commands(manager: &dyn Manager) -> CommandTable {
    let mut ancestors = HashSet::new();
    let mut table = CommandTable::new();
    collect_into(manager, "", &mut ancestors, &mut table);
    table
}

fn collect_into(
    manager: &dyn Manager,
    prefix: &str,
    ancestors: &mut HashSet<usize>,
    table: &mut CommandTable,
) {
    let address = manager as *const dyn Manager as *const () as usize;
    if !ancestors.insert(address) {
        debug!(target: ROUTER_TARGET, %prefix, "skipping cyclic submanager");
        return;
    }

    for (name, info) in manager.command_table() {
        table.insert(format!("{prefix}{name}"), info);
    }
    for (name, child) in manager.submanager_table().snapshot() {
        let child_prefix = format!("{prefix}{name}{COMMAND_SEPARATOR}");
        collect_into(child.as_ref(), &child_prefix, ancestors, table);
    }

    ancestors.remove(&address);
}
