//! Capability interface expected from the host object model.
//!
//! Managers never own host objects. They reach them through three narrow
//! traits:
//!
//! - [`EventSource`] - subscribe to a stream of [`HostEvent`]s
//! - [`HostModel`] - a single entity with an id and a plain-value snapshot
//! - [`HostCollection`] - enumeration, lookup by id, and length
//!
//! Subscriptions are `tokio::sync::broadcast` receivers. Dropping the
//! receiver is the unsubscribe.
//!
//! # Event Argument Conventions
//!
//! | Kind             | `args`                     |
//! |------------------|----------------------------|
//! | `add`            | `[item snapshot]`          |
//! | `remove`         | `[item snapshot]`          |
//! | `change`         | `[item snapshot]`          |
//! | `change:<field>` | `[item snapshot, value]`   |
//!
//! # Delivery
//!
//! - **At-most-once**: slow receivers may miss events (`RecvError::Lagged`)
//! - **No replay**: events emitted before subscription are not received

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

/// Default channel capacity for host event hubs.
const DEFAULT_CAPACITY: usize = 1024;

/// Kind of host event a monitor can listen for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An item joined a collection.
    Add,
    /// An item left a collection.
    Remove,
    /// An entity changed.
    Change,
    /// A single field of an entity changed (`change:<field>`).
    FieldChange(String),
    /// Any other host-specific event name.
    Custom(String),
}

impl EventKind {
    /// Parses a host event name.
    pub fn parse(name: &str) -> Self {
        match name {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "change" => Self::Change,
            other => match other.strip_prefix("change:") {
                Some(field) => Self::FieldChange(field.to_string()),
                None => Self::Custom(other.to_string()),
            },
        }
    }

    /// Shorthand for `change:<field>`.
    pub fn field(field: impl Into<String>) -> Self {
        Self::FieldChange(field.into())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
            Self::Change => write!(f, "change"),
            Self::FieldChange(field) => write!(f, "change:{field}"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// One event raised by the host object model.
#[derive(Debug, Clone, PartialEq)]
pub struct HostEvent {
    /// What happened.
    pub kind: EventKind,
    /// Raw event arguments, see the module docs for conventions.
    pub args: Vec<Value>,
}

impl HostEvent {
    /// Creates an event with arbitrary arguments.
    pub fn new(kind: EventKind, args: Vec<Value>) -> Self {
        Self { kind, args }
    }

    /// An `add` event for `item`.
    pub fn add(item: Value) -> Self {
        Self::new(EventKind::Add, vec![item])
    }

    /// A `remove` event for `item`.
    pub fn remove(item: Value) -> Self {
        Self::new(EventKind::Remove, vec![item])
    }

    /// A `change` event for `item`.
    pub fn change(item: Value) -> Self {
        Self::new(EventKind::Change, vec![item])
    }

    /// A `change:<field>` event for `item`.
    pub fn field_change(field: impl Into<String>, item: Value, value: Value) -> Self {
        Self::new(EventKind::field(field), vec![item, value])
    }

    /// The affected item snapshot, when the event carries one.
    pub fn item(&self) -> Option<&Value> {
        self.args.first()
    }

    /// The new field value of a `change:<field>` event.
    pub fn value(&self) -> Option<&Value> {
        self.args.get(1)
    }
}

/// Something that raises host events.
pub trait EventSource: Send + Sync {
    /// Subscribes to every event this source raises from now on.
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;
}

/// A single host entity.
pub trait HostModel: EventSource {
    /// Stable identifier of the entity.
    fn id(&self) -> String;

    /// Plain-value serialization of the entity.
    fn snapshot(&self) -> Value;

    /// Current value of one field.
    fn field(&self, name: &str) -> Option<Value> {
        self.snapshot().get(name).cloned()
    }
}

/// A host collection of entities.
pub trait HostCollection: EventSource {
    /// All current items, in collection order.
    fn items(&self) -> Vec<Arc<dyn HostModel>>;

    /// Looks up one item by id.
    fn get(&self, id: &str) -> Option<Arc<dyn HostModel>>;

    /// Number of items.
    fn len(&self) -> usize {
        self.items().len()
    }

    /// Whether the collection has no items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Broadcast hub that host implementations can embed to become an
/// [`EventSource`].
///
/// # Example
///
/// ```ignore
/// let hub = EventHub::new();
/// let mut receiver = hub.subscribe();
///
/// hub.emit(HostEvent::add(json!({"id": "c1"})));
///
/// let event = receiver.recv().await?;
/// assert_eq!(event.kind, EventKind::Add);
/// ```
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<HostEvent>,
}

impl EventHub {
    /// Create a new hub with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new hub with the specified capacity.
    ///
    /// The capacity determines how many events can be buffered before slow
    /// receivers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers (fire-and-forget).
    ///
    /// Returns the number of receivers that received the event.
    pub fn emit(&self, event: HostEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for EventHub {
    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        EventHub::subscribe(self)
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
