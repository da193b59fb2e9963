//! Generic managers over host models and collections.
//!
//! [`ModelManager`] wraps one [`HostModel`]; [`CollectionManager`] wraps a
//! [`HostCollection`] and hands out per-item managers, either explicitly via
//! `createModelManager` or on demand when a path names an item id that has no
//! bound submanager yet.
//!
//! The per-item manager type is a [`ManagerFactory`] passed at construction,
//! so a domain layer can substitute its own item manager (for example one
//! that also holds a [`crate::RootHandle`]) without touching the collection.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::CommandError;
use crate::host::{EventKind, HostCollection, HostEvent, HostModel};
use crate::manager::{
    parse_params, CommandOutput, CommandRegistry, CommandResult, Commands, Manager, Submanagers,
};
use crate::monitor::Monitor;
use crate::sequence::LazySequence;

/// Builds the manager for one collection item.
pub type ManagerFactory = Arc<dyn Fn(Arc<dyn HostModel>) -> Arc<dyn Manager> + Send + Sync>;

#[derive(Deserialize)]
struct FieldParams {
    field: String,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

fn item_payload(event: &HostEvent) -> Option<Value> {
    event.item().map(|item| json!({ "item": item }))
}

// =============================================================================
// Model Manager
// =============================================================================

/// Manager over a single host model.
///
/// | Operation      | Kind    | Params    | Result / partials               |
/// |----------------|---------|-----------|---------------------------------|
/// | `getModel`     | command |           | snapshot                        |
/// | `monitorModel` | monitor |           | `{"item": snapshot}` per change |
/// | `monitorField` | monitor | `{field}` | `{"value": v}`, current first   |
pub struct ModelManager {
    model: Arc<dyn HostModel>,
    submanagers: Submanagers,
}

impl ModelManager {
    /// A manager over `model` with no children.
    pub fn new(model: Arc<dyn HostModel>) -> Self {
        Self {
            model,
            submanagers: Submanagers::new(),
        }
    }

    /// The wrapped model.
    pub fn model(&self) -> &Arc<dyn HostModel> {
        &self.model
    }

    async fn get_model(&self, _params: Value) -> CommandResult {
        Ok(self.model.snapshot().into())
    }

    async fn monitor_model(&self, _params: Value) -> CommandResult {
        Ok(Monitor::new(self.model.clone(), EventKind::Change)
            .with_map(item_payload)
            .into())
    }

    async fn monitor_field(&self, params: Value) -> CommandResult {
        let FieldParams { field } = parse_params(params)?;
        let model = self.model.clone();
        let current_field = field.clone();

        let monitor = Monitor::new(self.model.clone(), EventKind::field(field))
            .on_init(move |sink| {
                let current = model.field(&current_field).unwrap_or(Value::Null);
                sink.emit(json!({ "value": current }));
            })
            .with_map(|event| event.value().map(|value| json!({ "value": value })));

        Ok(monitor.into())
    }
}

impl Commands for ModelManager {
    fn registry() -> &'static CommandRegistry<Self> {
        static REGISTRY: OnceLock<CommandRegistry<ModelManager>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            CommandRegistry::<Self>::new()
                .command("getModel", |m, p| m.get_model(p).boxed())
                .monitor("monitorModel", |m, p| m.monitor_model(p).boxed())
                .monitor("monitorField", |m, p| m.monitor_field(p).boxed())
        })
    }

    fn submanagers(&self) -> &Submanagers {
        &self.submanagers
    }
}

// =============================================================================
// Collection Manager
// =============================================================================

/// Manager over a host collection.
///
/// Item ids double as submanager names: `contacts|c1|getModel` works even if
/// `c1` was never bound, as long as the collection holds an item `c1`.
///
/// An item manager is only served while its model is still the one the
/// collection holds under that id. Once the item is removed or replaced the
/// manager is unbound.
pub struct CollectionManager {
    collection: Arc<dyn HostCollection>,
    factory: ManagerFactory,
    submanagers: Submanagers,
    bound_models: RwLock<BTreeMap<String, Arc<dyn HostModel>>>,
}

impl CollectionManager {
    /// A collection manager whose items get plain [`ModelManager`]s.
    pub fn new(collection: Arc<dyn HostCollection>) -> Self {
        Self::with_factory(
            collection,
            Arc::new(|model: Arc<dyn HostModel>| {
                Arc::new(ModelManager::new(model)) as Arc<dyn Manager>
            }),
        )
    }

    /// A collection manager whose item managers are built by `factory`.
    pub fn with_factory(collection: Arc<dyn HostCollection>, factory: ManagerFactory) -> Self {
        Self {
            collection,
            factory,
            submanagers: Submanagers::new(),
            bound_models: RwLock::new(BTreeMap::new()),
        }
    }

    /// The wrapped collection.
    pub fn collection(&self) -> &Arc<dyn HostCollection> {
        &self.collection
    }

    /// Looks up an item, failing with `ModelNotFound`.
    pub fn load_item(&self, id: &str) -> Result<Arc<dyn HostModel>, CommandError> {
        self.collection
            .get(id)
            .ok_or_else(|| CommandError::model_not_found(format!("Item with ID \"{id}\" not found")))
    }

    fn bind_item(&self, id: &str, model: Arc<dyn HostModel>) -> Arc<dyn Manager> {
        let manager = (self.factory)(model.clone());
        self.bound_models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), model);
        self.submanagers.add(id, manager.clone());
        manager
    }

    async fn get_items(&self, _params: Value) -> CommandResult {
        let snapshots = self.collection.items().into_iter().map(|item| item.snapshot());
        Ok(LazySequence::from_items(snapshots).into())
    }

    async fn get_item_by_id(&self, params: Value) -> CommandResult {
        let IdParams { id } = parse_params(params)?;
        Ok(self.load_item(&id)?.snapshot().into())
    }

    async fn get_length(&self, _params: Value) -> CommandResult {
        CommandOutput::value(self.collection.len())
    }

    fn item_monitor(&self, kind: EventKind) -> CommandResult {
        Ok(Monitor::new(self.collection.clone(), kind)
            .with_map(item_payload)
            .into())
    }

    async fn monitor_add(&self, _params: Value) -> CommandResult {
        self.item_monitor(EventKind::Add)
    }

    async fn monitor_remove(&self, _params: Value) -> CommandResult {
        self.item_monitor(EventKind::Remove)
    }

    async fn monitor_change(&self, _params: Value) -> CommandResult {
        self.item_monitor(EventKind::Change)
    }

    async fn monitor_field(&self, params: Value) -> CommandResult {
        let FieldParams { field } = parse_params(params)?;
        self.item_monitor(EventKind::field(field))
    }

    async fn create_model_manager(&self, params: Value) -> CommandResult {
        let IdParams { id } = parse_params(params)?;
        let model = self.load_item(&id)?;
        self.bind_item(&id, model);
        CommandOutput::value(id)
    }
}

impl Commands for CollectionManager {
    fn registry() -> &'static CommandRegistry<Self> {
        static REGISTRY: OnceLock<CommandRegistry<CollectionManager>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            CommandRegistry::<Self>::new()
                .command("getItems", |m, p| m.get_items(p).boxed())
                .command("getItemById", |m, p| m.get_item_by_id(p).boxed())
                .command("getLength", |m, p| m.get_length(p).boxed())
                .monitor("monitorAdd", |m, p| m.monitor_add(p).boxed())
                .monitor("monitorRemove", |m, p| m.monitor_remove(p).boxed())
                .monitor("monitorChange", |m, p| m.monitor_change(p).boxed())
                .monitor("monitorField", |m, p| m.monitor_field(p).boxed())
                .command("createModelManager", |m, p| m.create_model_manager(p).boxed())
        })
    }

    fn submanagers(&self) -> &Submanagers {
        &self.submanagers
    }

    fn fallback_submanager(&self, name: &str) -> Option<Arc<dyn Manager>> {
        let model = self.collection.get(name)?;
        Some(self.bind_item(name, model))
    }

    fn submanager_is_current(&self, name: &str) -> bool {
        let Some(bound) = self
            .bound_models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
        else {
            // Bound by hand, not an item manager.
            return true;
        };

        let current = self
            .collection
            .get(name)
            .is_some_and(|model| same_model(&model, &bound));
        if !current {
            self.bound_models
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
        }
        current
    }
}

fn same_model(a: &Arc<dyn HostModel>, b: &Arc<dyn HostModel>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCollection, MemoryModel};
    use crate::monitor::{Completion, PartialSink};
    use crate::CommandKind;

    fn contacts() -> Arc<MemoryCollection> {
        let collection = Arc::new(MemoryCollection::new());
        collection.add(MemoryModel::new("c1", json!({"name": "Ann"})));
        collection.add(MemoryModel::new("c2", json!({"name": "Bob"})));
        collection
    }

    fn value(output: CommandOutput) -> Value {
        match output {
            CommandOutput::Value(value) => value,
            other => panic!("expected a value, got {}", other.shape()),
        }
    }

    #[tokio::test]
    async fn get_model_returns_snapshot() {
        let model = MemoryModel::new("c1", json!({"name": "Ann"}));
        let manager = ModelManager::new(model);

        let snapshot = value(manager.execute_command("getModel", json!({})).await.unwrap());
        assert_eq!(snapshot, json!({"id": "c1", "name": "Ann"}));
    }

    #[tokio::test]
    async fn monitor_field_reports_current_value_first() {
        let model = MemoryModel::new("c1", json!({"name": "Ann"}));
        let manager = ModelManager::new(model.clone());

        let CommandOutput::Monitor(monitor) = manager
            .execute_command("monitorField", json!({"field": "name"}))
            .await
            .unwrap()
        else {
            panic!("expected a monitor");
        };
        let handle = monitor.handle();
        let (sink, mut rx) = PartialSink::channel();
        let task = tokio::spawn(monitor.start(sink).run());

        model.set_field("name", json!("Anna"));
        model.set_field("age", json!(30));

        assert_eq!(rx.recv().await.unwrap(), json!({"value": "Ann"}));
        assert_eq!(rx.recv().await.unwrap(), json!({"value": "Anna"}));

        handle.stop();
        assert_eq!(task.await.unwrap(), Completion::Stopped);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn get_item_by_id_and_model_not_found() {
        let manager = CollectionManager::new(contacts());

        let item = value(
            manager
                .execute_command("getItemById", json!({"id": "c2"}))
                .await
                .unwrap(),
        );
        assert_eq!(item["name"], "Bob");

        let err = manager
            .execute_command("getItemById", json!({"id": "zz"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::ModelNotFound { .. }));
        assert_eq!(err.to_string(), "Item with ID \"zz\" not found");
    }

    #[tokio::test]
    async fn get_items_streams_every_item() {
        let manager = CollectionManager::new(contacts());
        let CommandOutput::Sequence(sequence) =
            manager.execute_command("getItems", json!({})).await.unwrap()
        else {
            panic!("expected a sequence");
        };

        let (sink, mut rx) = PartialSink::channel();
        sequence.iter(sink).await.unwrap();

        assert_eq!(rx.recv().await.unwrap()["item"]["id"], "c1");
        assert_eq!(rx.recv().await.unwrap()["item"]["id"], "c2");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unbound_item_ids_are_constructed_on_demand() {
        let manager = CollectionManager::new(contacts());
        assert!(manager.submanagers().is_empty());

        let snapshot = value(manager.execute_command("c1|getModel", json!({})).await.unwrap());
        assert_eq!(snapshot["name"], "Ann");
        assert!(manager.submanagers().contains("c1"));

        let err = manager
            .execute_command("nobody|getModel", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::ManagerNotFound { ref name } if name == "nobody"));
    }

    #[tokio::test]
    async fn removed_items_stop_resolving() {
        let contacts = contacts();
        let manager = CollectionManager::new(contacts.clone());

        let snapshot = value(manager.execute_command("c1|getModel", json!({})).await.unwrap());
        assert_eq!(snapshot["name"], "Ann");

        contacts.remove("c1").unwrap();
        let err = manager
            .execute_command("c1|getModel", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::ManagerNotFound { ref name } if name == "c1"));
        assert!(!manager.submanagers().contains("c1"));

        contacts.add(MemoryModel::new("c1", json!({"name": "Anew"})));
        let snapshot = value(manager.execute_command("c1|getModel", json!({})).await.unwrap());
        assert_eq!(snapshot["name"], "Anew");
    }

    #[tokio::test]
    async fn replaced_items_rebind_to_the_new_model() {
        let contacts = contacts();
        let manager = CollectionManager::new(contacts.clone());
        manager
            .execute_command("createModelManager", json!({"id": "c2"}))
            .await
            .unwrap();

        contacts.add(MemoryModel::new("c2", json!({"name": "Robert"})));
        let snapshot = value(manager.execute_command("c2|getModel", json!({})).await.unwrap());
        assert_eq!(snapshot["name"], "Robert");
    }

    #[tokio::test]
    async fn create_model_manager_binds_and_returns_id() {
        let manager = CollectionManager::new(contacts());

        let id = value(
            manager
                .execute_command("createModelManager", json!({"id": "c2"}))
                .await
                .unwrap(),
        );
        assert_eq!(id, json!("c2"));

        let commands = value(manager.execute_command("getCommands", json!({})).await.unwrap());
        assert_eq!(commands["c2|monitorField"], json!({"type": "monitor"}));
        assert_eq!(commands["monitorAdd"], json!({"type": "monitor"}));
        assert_eq!(commands["getItems"], json!({"type": "command"}));
    }

    #[tokio::test]
    async fn collection_monitors_wrap_items() {
        let collection = contacts();
        let manager = CollectionManager::new(collection.clone());
        let CommandOutput::Monitor(monitor) =
            manager.execute_command("monitorAdd", json!({})).await.unwrap()
        else {
            panic!("expected a monitor");
        };
        let handle = monitor.handle();
        let (sink, mut rx) = PartialSink::channel();
        let task = tokio::spawn(monitor.start(sink).run());

        collection.add(MemoryModel::new("c3", json!({"name": "Cy"})));
        assert_eq!(
            rx.recv().await.unwrap(),
            json!({"item": {"id": "c3", "name": "Cy"}})
        );

        handle.stop();
        task.await.unwrap();
    }

    #[test]
    fn registry_kinds() {
        let registry = CollectionManager::registry();
        assert_eq!(registry.kind("monitorChange"), Some(CommandKind::Monitor));
        assert_eq!(registry.kind("getLength"), Some(CommandKind::Command));
        assert!(registry.contains("removeSubmanager"));
    }

    #[tokio::test]
    async fn custom_factory_is_used_for_items() {
        struct Tagged {
            submanagers: Submanagers,
        }

        impl Commands for Tagged {
            fn registry() -> &'static CommandRegistry<Self> {
                static REGISTRY: OnceLock<CommandRegistry<Tagged>> = OnceLock::new();
                REGISTRY.get_or_init(|| {
                    CommandRegistry::<Self>::new()
                        .command("tag", |_m, _p| async { CommandOutput::value("tagged") }.boxed())
                })
            }

            fn submanagers(&self) -> &Submanagers {
                &self.submanagers
            }
        }

        let factory: ManagerFactory = Arc::new(|_model: Arc<dyn HostModel>| {
            Arc::new(Tagged {
                submanagers: Submanagers::new(),
            }) as Arc<dyn Manager>
        });
        let manager = CollectionManager::with_factory(contacts(), factory);

        let tag = value(manager.execute_command("c1|tag", json!({})).await.unwrap());
        assert_eq!(tag, json!("tagged"));
    }
}
