//! In-memory host object model.
//!
//! Plain models and collections that raise the standard host events. Used by
//! the test suite and the CLI driver, and handy for embedding switchboard in
//! something that has no object model of its own yet.
//!
//! A model added to a collection forwards its `change` and `change:<field>`
//! events to the collection as well, so collection-level change monitors see
//! item edits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::host::{EventHub, EventSource, HostCollection, HostEvent, HostModel};

static NEXT_COLLECTION_KEY: AtomicUsize = AtomicUsize::new(1);

/// A model holding a flat map of fields.
pub struct MemoryModel {
    id: String,
    fields: RwLock<Map<String, Value>>,
    hub: EventHub,
    observers: RwLock<Vec<(usize, EventHub)>>,
}

impl MemoryModel {
    /// Creates a model. Non-object `fields` are ignored.
    pub fn new(id: impl Into<String>, fields: Value) -> Arc<Self> {
        let fields = match fields {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        Arc::new(Self {
            id: id.into(),
            fields: RwLock::new(fields),
            hub: EventHub::new(),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Sets one field and raises `change:<field>` followed by `change`.
    pub fn set_field(&self, field: &str, value: Value) {
        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(field.to_string(), value.clone());

        let snapshot = self.snapshot();
        self.emit(HostEvent::field_change(field, snapshot.clone(), value));
        self.emit(HostEvent::change(snapshot));
    }

    /// Raises an arbitrary event on this model and its collections.
    pub fn emit(&self, event: HostEvent) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        for (_, hub) in observers.iter() {
            hub.emit(event.clone());
        }
        self.hub.emit(event);
    }

    /// The model's own event hub.
    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    fn attach(&self, key: usize, hub: EventHub) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key, hub));
    }

    fn detach(&self, key: usize) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(observer, _)| *observer != key);
    }
}

impl EventSource for MemoryModel {
    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.hub.subscribe()
    }
}

impl HostModel for MemoryModel {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn snapshot(&self) -> Value {
        let mut snapshot = self
            .fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(snapshot)
    }

    fn field(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return Some(Value::String(self.id.clone()));
        }
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl std::fmt::Debug for MemoryModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryModel").field("id", &self.id).finish()
    }
}

/// An ordered collection of [`MemoryModel`]s.
pub struct MemoryCollection {
    key: usize,
    items: RwLock<Vec<Arc<MemoryModel>>>,
    hub: EventHub,
}

impl MemoryCollection {
    /// An empty collection.
    pub fn new() -> Self {
        Self {
            key: NEXT_COLLECTION_KEY.fetch_add(1, Ordering::Relaxed),
            items: RwLock::new(Vec::new()),
            hub: EventHub::new(),
        }
    }

    /// Adds `model` and raises `add`.
    ///
    /// A model with the same id is replaced (and raises `remove` first).
    pub fn add(&self, model: Arc<MemoryModel>) {
        self.remove(&model.id);
        model.attach(self.key, self.hub.clone());
        let snapshot = model.snapshot();
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(model);
        self.hub.emit(HostEvent::add(snapshot));
    }

    /// Removes the model with `id` and raises `remove`.
    pub fn remove(&self, id: &str) -> Option<Arc<MemoryModel>> {
        let removed = {
            let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
            let position = items.iter().position(|item| item.id == id)?;
            items.remove(position)
        };
        removed.detach(self.key);
        self.hub.emit(HostEvent::remove(removed.snapshot()));
        Some(removed)
    }

    /// Typed lookup by id.
    pub fn model(&self, id: &str) -> Option<Arc<MemoryModel>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    /// The collection's event hub.
    pub fn hub(&self) -> &EventHub {
        &self.hub
    }
}

impl Default for MemoryCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for MemoryCollection {
    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.hub.subscribe()
    }
}

impl HostCollection for MemoryCollection {
    fn items(&self) -> Vec<Arc<dyn HostModel>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|item| item.clone() as Arc<dyn HostModel>)
            .collect()
    }

    fn get(&self, id: &str) -> Option<Arc<dyn HostModel>> {
        self.model(id).map(|item| item as Arc<dyn HostModel>)
    }

    fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for MemoryCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCollection")
            .field("len", &HostCollection::len(self))
            .finish()
    }
}
