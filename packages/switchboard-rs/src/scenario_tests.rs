//! End-to-end scenarios driven through `Dispatcher::poll`.
//!
//! Every test builds a small host tree out of memory models, talks to it only
//! through batches and drains, and checks the records that come back.

#[cfg(test)]
mod scenario_tests {
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    use futures::FutureExt;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use crate::config::SwitchboardConfig;
    use crate::dispatch::{Dispatcher, RootHandle};
    use crate::error::CommandError;
    use crate::host::HostModel;
    use crate::manager::{CommandOutput, CommandRegistry, CommandResult, Commands, Manager, Submanagers};
    use crate::memory::{MemoryCollection, MemoryModel};
    use crate::model::{CollectionManager, ManagerFactory, ModelManager};
    use crate::result::{ResultRecord, ResultType};
    use crate::testing::{poll_until, wait_until, RecordsExt};

    const TIMEOUT: Duration = Duration::from_secs(2);

    // ==========================================================================
    // Test Types
    // ==========================================================================

    /// Handlers that fail in every way a host handler can.
    struct Faulty {
        submanagers: Submanagers,
    }

    impl Faulty {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                submanagers: Submanagers::new(),
            })
        }

        async fn structured(&self, _params: Value) -> CommandResult {
            Err(CommandError::host(
                "SendFailed",
                "could not send",
                json!({"chatId": "ch1"}),
            ))
        }

        async fn opaque(&self, _params: Value) -> CommandResult {
            Err(CommandError::opaque(json!(42)))
        }

        async fn explode(&self, _params: Value) -> CommandResult {
            panic!("kaboom");
        }

        async fn nothing(&self, _params: Value) -> CommandResult {
            CommandOutput::empty()
        }
    }

    impl Commands for Faulty {
        fn registry() -> &'static CommandRegistry<Self> {
            static REGISTRY: OnceLock<CommandRegistry<Faulty>> = OnceLock::new();
            REGISTRY.get_or_init(|| {
                CommandRegistry::<Self>::new()
                    .command("structured", |m, p| m.structured(p).boxed())
                    .command("opaque", |m, p| m.opaque(p).boxed())
                    .command("explode", |m, p| m.explode(p).boxed())
                    .command("nothing", |m, p| m.nothing(p).boxed())
            })
        }

        fn submanagers(&self) -> &Submanagers {
            &self.submanagers
        }
    }

    /// A chat manager that reaches the contact collection through the root.
    struct ChatManager {
        base: ModelManager,
        root: RootHandle,
    }

    impl ChatManager {
        async fn get_contact(&self, _params: Value) -> CommandResult {
            let contact_id = self
                .base
                .model()
                .field("contactId")
                .and_then(|id| id.as_str().map(str::to_string))
                .ok_or_else(|| CommandError::value_error("chat has no contact"))?;
            self.root
                .execute_command(&format!("contacts|{contact_id}|getModel"), Value::Null)
                .await
        }
    }

    impl Commands for ChatManager {
        fn registry() -> &'static CommandRegistry<Self> {
            static REGISTRY: OnceLock<CommandRegistry<ChatManager>> = OnceLock::new();
            REGISTRY.get_or_init(|| {
                CommandRegistry::<Self>::new()
                    .command("getContact", |m, p| m.get_contact(p).boxed())
                    .inherit(ModelManager::registry(), |chat: &ChatManager| &chat.base)
            })
        }

        fn submanagers(&self) -> &Submanagers {
            self.base.submanagers()
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        contacts: Arc<MemoryCollection>,
        chats: Arc<MemoryCollection>,
    }

    fn fixture_with(dispatcher: Dispatcher) -> Fixture {
        let contacts = Arc::new(MemoryCollection::new());
        contacts.add(MemoryModel::new("c1", json!({"name": "Ann"})));
        contacts.add(MemoryModel::new("c2", json!({"name": "Bob"})));
        contacts.add(MemoryModel::new("c3", json!({"name": "Cy"})));

        let chats = Arc::new(MemoryCollection::new());
        chats.add(MemoryModel::new("ch1", json!({"contactId": "c2"})));

        let root = dispatcher.root_handle();
        let factory: ManagerFactory = Arc::new(move |model: Arc<dyn HostModel>| {
            Arc::new(ChatManager {
                base: ModelManager::new(model),
                root: root.clone(),
            }) as Arc<dyn Manager>
        });

        dispatcher.add_submanager("contacts", Arc::new(CollectionManager::new(contacts.clone())));
        dispatcher.add_submanager(
            "chats",
            Arc::new(CollectionManager::with_factory(chats.clone(), factory)),
        );
        dispatcher.add_submanager("faulty", Faulty::new());

        Fixture {
            dispatcher,
            contacts,
            chats,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Dispatcher::new().unwrap())
    }

    fn exec(ex_id: &str, command: &str, params: Value) -> Value {
        json!({"exId": ex_id, "command": command, "params": params})
    }

    async fn run_one(dispatcher: &Dispatcher, command: &str, params: Value) -> ResultRecord {
        dispatcher.poll([exec("X", command, params)]);
        let results = poll_until(dispatcher, TIMEOUT, |r| r.terminal("X").is_some())
            .await
            .unwrap();
        results.terminal("X").cloned().unwrap()
    }

    // ==========================================================================
    // Monitor Lifecycle
    // ==========================================================================

    #[tokio::test]
    async fn monitor_streams_until_stopped_then_finalizes() {
        let Fixture {
            dispatcher,
            contacts,
            ..
        } = fixture();

        dispatcher.poll([exec("E1", "contacts|monitorAdd", json!({}))]);
        wait_until(TIMEOUT, || dispatcher.monitors().contains("E1"))
            .await
            .unwrap();

        contacts.add(MemoryModel::new("c4", json!({"name": "Di"})));
        contacts.add(MemoryModel::new("c5", json!({"name": "Ed"})));

        let mut collected = poll_until(&dispatcher, TIMEOUT, |r| r.for_execution("E1").len() >= 2)
            .await
            .unwrap();

        dispatcher.poll([exec("S1", "stopMonitor", json!({"monitorId": "E1"}))]);
        collected.extend(
            poll_until(&dispatcher, TIMEOUT, |r| {
                r.terminal("S1").is_some() && r.terminal("E1").is_some()
            })
            .await
            .unwrap(),
        );

        let stop = collected.terminal("S1").unwrap();
        assert_eq!(stop.kind, ResultType::Final);
        assert_eq!(stop.params, json!(true));

        let e1 = collected.for_execution("E1");
        assert_eq!(e1.len(), 3);
        assert_eq!(e1[0].kind, ResultType::Partial);
        assert_eq!(e1[0].params["item"]["id"], "c4");
        assert_eq!(e1[1].kind, ResultType::Partial);
        assert_eq!(e1[1].params["item"]["id"], "c5");
        assert_eq!(e1[2].kind, ResultType::Final);
        assert_eq!(e1[2].params, json!({"completion": "stopped"}));
        assert!(!dispatcher.monitors().contains("E1"));

        contacts.add(MemoryModel::new("c6", json!({"name": "Flo"})));
        dispatcher.wait_idle().await;
        assert!(dispatcher.poll(None).results.is_empty());
    }

    #[tokio::test]
    async fn events_raised_right_before_a_stop_are_not_lost() {
        let Fixture {
            dispatcher,
            contacts,
            ..
        } = fixture();

        dispatcher.poll([exec("E1", "contacts|monitorAdd", json!({}))]);
        wait_until(TIMEOUT, || contacts.hub().subscriber_count() == 1)
            .await
            .unwrap();

        contacts.add(MemoryModel::new("c4", json!({"name": "Di"})));
        contacts.add(MemoryModel::new("c5", json!({"name": "Ed"})));
        assert!(dispatcher.stop_monitor("E1"));
        dispatcher.wait_idle().await;

        let results = dispatcher.poll(None).results;
        let e1 = results.for_execution("E1");
        assert_eq!(e1.len(), 3);
        assert_eq!(e1[0].params["item"]["id"], "c4");
        assert_eq!(e1[1].params["item"]["id"], "c5");
        assert_eq!(e1[2].kind, ResultType::Final);
        assert_eq!(e1[2].params, json!({"completion": "stopped"}));
    }

    #[tokio::test]
    async fn stop_monitor_on_absent_id_is_false_not_error() {
        let Fixture { dispatcher, .. } = fixture();
        let record = run_one(&dispatcher, "stopMonitor", json!({"monitorId": "unknown"})).await;
        assert_eq!(record.kind, ResultType::Final);
        assert_eq!(record.params, json!(false));
    }

    #[tokio::test]
    async fn field_monitor_reports_current_value_first() {
        let Fixture {
            dispatcher,
            contacts,
            ..
        } = fixture();

        dispatcher.poll([exec("F1", "contacts|c1|monitorField", json!({"field": "name"}))]);
        let first = poll_until(&dispatcher, TIMEOUT, |r| !r.for_execution("F1").is_empty())
            .await
            .unwrap();
        assert_eq!(first[0].kind, ResultType::Partial);
        assert_eq!(first[0].params, json!({"value": "Ann"}));

        contacts.model("c1").unwrap().set_field("name", json!("Anna"));
        let next = poll_until(&dispatcher, TIMEOUT, |r| !r.for_execution("F1").is_empty())
            .await
            .unwrap();
        assert_eq!(next[0].params, json!({"value": "Anna"}));

        assert!(dispatcher.stop_monitor("F1"));
        dispatcher.wait_idle().await;
        let rest = dispatcher.drain();
        assert_eq!(rest.terminal("F1").unwrap().params["completion"], "stopped");
    }

    #[tokio::test]
    async fn reusing_an_execution_id_orphans_the_previous_monitor() {
        let Fixture {
            dispatcher,
            contacts,
            ..
        } = fixture();

        dispatcher.poll([exec("E1", "contacts|monitorAdd", json!({}))]);
        wait_until(TIMEOUT, || dispatcher.monitors().contains("E1"))
            .await
            .unwrap();

        dispatcher.poll([exec("E1", "contacts|monitorRemove", json!({}))]);
        wait_until(TIMEOUT, || contacts.hub().subscriber_count() == 2)
            .await
            .unwrap();
        contacts.remove("c1").unwrap();
        poll_until(&dispatcher, TIMEOUT, |r| !r.for_execution("E1").is_empty())
            .await
            .unwrap();
        assert_eq!(dispatcher.monitors().len(), 1);

        assert!(dispatcher.stop_monitor("E1"));
        assert!(!dispatcher.stop_monitor("E1"));
        poll_until(&dispatcher, TIMEOUT, |r| r.terminal("E1").is_some())
            .await
            .unwrap();

        // The first monitor is unreachable but still running.
        assert_eq!(dispatcher.inflight(), 1);
        assert!(dispatcher.monitors().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_all_monitors() {
        let Fixture { dispatcher, .. } = fixture();

        dispatcher.poll([
            exec("A", "contacts|monitorAdd", json!({})),
            exec("B", "contacts|monitorChange", json!({})),
        ]);
        wait_until(TIMEOUT, || dispatcher.monitors().len() == 2)
            .await
            .unwrap();

        assert_eq!(dispatcher.shutdown(), 2);
        tokio::time::timeout(TIMEOUT, dispatcher.wait_idle())
            .await
            .unwrap();

        let results = dispatcher.drain();
        assert_eq!(results.terminal("A").unwrap().params["completion"], "stopped");
        assert_eq!(results.terminal("B").unwrap().params["completion"], "stopped");
    }

    #[tokio::test]
    async fn monitor_completes_when_source_goes_away() {
        let Fixture { dispatcher, .. } = fixture();
        let doomed = Arc::new(MemoryCollection::new());
        dispatcher.add_submanager("doomed", Arc::new(CollectionManager::new(doomed.clone())));

        dispatcher.poll([exec("D1", "doomed|monitorAdd", json!({}))]);
        wait_until(TIMEOUT, || dispatcher.monitors().contains("D1"))
            .await
            .unwrap();

        assert!(dispatcher.remove_submanager("doomed"));
        drop(doomed);

        let results = poll_until(&dispatcher, TIMEOUT, |r| r.terminal("D1").is_some())
            .await
            .unwrap();
        assert_eq!(results.terminal("D1").unwrap().params, json!({"completion": "completed"}));
        assert!(!dispatcher.monitors().contains("D1"));
    }

    // ==========================================================================
    // Sequences And Values
    // ==========================================================================

    #[tokio::test]
    async fn sequence_emits_each_item_then_final() {
        let Fixture { dispatcher, .. } = fixture();

        dispatcher.poll([exec("I1", "contacts|getItems", json!({}))]);
        let results = poll_until(&dispatcher, TIMEOUT, |r| r.terminal("I1").is_some())
            .await
            .unwrap();

        let records = results.for_execution("I1");
        assert_eq!(records.len(), 4);
        let ids: Vec<&Value> = records[..3]
            .iter()
            .map(|record| {
                assert_eq!(record.kind, ResultType::Partial);
                &record.params["item"]["id"]
            })
            .collect();
        assert_eq!(ids, [&json!("c1"), &json!("c2"), &json!("c3")]);
        assert_eq!(records[3].kind, ResultType::Final);
        assert_eq!(records[3].params, json!({"completion": "completed"}));
    }

    #[tokio::test]
    async fn drained_results_are_not_replayed() {
        let Fixture { dispatcher, .. } = fixture();

        dispatcher.poll([exec("P1", "ping", Value::Null), exec("P2", "ping", Value::Null)]);
        let results = poll_until(&dispatcher, TIMEOUT, |r| r.len() == 2).await.unwrap();
        assert_eq!(results.len(), 2);

        let again = dispatcher.poll(Vec::new());
        assert!(again.results.is_empty());
        assert!(again.errors.is_empty());
    }

    #[tokio::test]
    async fn null_values_finalize_as_empty_object() {
        let Fixture { dispatcher, .. } = fixture();
        let record = run_one(&dispatcher, "faulty|nothing", json!({})).await;
        assert_eq!(record.kind, ResultType::Final);
        assert_eq!(record.params, json!({}));
    }

    #[tokio::test]
    async fn many_concurrent_executions_each_finalize_once() {
        let Fixture { dispatcher, .. } = fixture();

        let batch: Vec<Value> = (0..200)
            .map(|n| exec(&format!("P{n}"), "contacts|getLength", json!({})))
            .collect();
        dispatcher.poll(batch);
        dispatcher.wait_idle().await;

        let results = dispatcher.drain();
        assert_eq!(results.len(), 200);
        for n in 0..200 {
            let records = results.for_execution(&format!("P{n}"));
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].params, json!(3));
        }
    }

    // ==========================================================================
    // Errors
    // ==========================================================================

    #[tokio::test]
    async fn structured_errors_keep_their_shape() {
        let Fixture { dispatcher, .. } = fixture();
        let record = run_one(&dispatcher, "faulty|structured", json!({})).await;

        assert_eq!(record.kind, ResultType::Error);
        assert_eq!(record.params["name"], "SendFailed");
        assert_eq!(record.params["message"], "could not send");
        assert_eq!(record.params["params"], json!({"chatId": "ch1"}));
    }

    #[tokio::test]
    async fn opaque_errors_are_wrapped() {
        let Fixture { dispatcher, .. } = fixture();
        let record = run_one(&dispatcher, "faulty|opaque", json!({})).await;

        assert_eq!(record.kind, ResultType::Error);
        assert_eq!(record.params, json!({"err": 42}));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_error_record() {
        let Fixture { dispatcher, .. } = fixture();
        let record = run_one(&dispatcher, "faulty|explode", json!({})).await;

        assert_eq!(record.kind, ResultType::Error);
        assert_eq!(record.params["name"], "Panic");
        assert!(record.params["message"].as_str().unwrap().contains("kaboom"));

        // The dispatcher keeps working afterwards.
        let pong = run_one(&dispatcher, "ping", json!({})).await;
        assert_eq!(pong.params, json!("pong"));
    }

    #[tokio::test]
    async fn unknown_paths_fail_per_execution() {
        let Fixture { dispatcher, .. } = fixture();

        let missing_cmd = run_one(&dispatcher, "missingCmd", json!({})).await;
        assert_eq!(missing_cmd.params["name"], "CommandNotFound");

        let missing_child = run_one(&dispatcher, "missingChild|cmd", json!({})).await;
        assert_eq!(missing_child.params["name"], "ManagerNotFound");
        assert_eq!(missing_child.params["message"], "Manager missingChild not found");

        let missing_item = run_one(&dispatcher, "contacts|getItemById", json!({"id": "zz"})).await;
        assert_eq!(missing_item.params["name"], "ModelNotFound");
    }

    // ==========================================================================
    // Tree Resolution
    // ==========================================================================

    #[tokio::test]
    async fn items_resolve_through_root_handle() {
        let Fixture {
            dispatcher, chats, ..
        } = fixture();

        let contact = run_one(&dispatcher, "chats|ch1|getContact", json!({})).await;
        assert_eq!(contact.kind, ResultType::Final);
        assert_eq!(contact.params["name"], "Bob");

        // Inherited from the model manager.
        let chat = run_one(&dispatcher, "chats|ch1|getModel", json!({})).await;
        assert_eq!(chat.params["contactId"], "c2");

        chats.model("ch1").unwrap().set_field("contactId", json!("c3"));
        let contact = run_one(&dispatcher, "chats|ch1|getContact", json!({})).await;
        assert_eq!(contact.params["name"], "Cy");
    }

    #[tokio::test]
    async fn get_commands_enumerates_the_whole_tree() {
        let Fixture { dispatcher, .. } = fixture();
        run_one(&dispatcher, "chats|createModelManager", json!({"id": "ch1"})).await;

        let first = run_one(&dispatcher, "getCommands", json!({})).await;
        let second = run_one(&dispatcher, "getCommands", json!({})).await;
        assert_eq!(first.params, second.params);

        let commands = &first.params;
        assert_eq!(commands["ping"], json!({"type": "command"}));
        assert_eq!(commands["contacts|monitorAdd"], json!({"type": "monitor"}));
        assert_eq!(commands["chats|ch1|getContact"], json!({"type": "command"}));
        assert_eq!(commands["chats|ch1|monitorField"], json!({"type": "monitor"}));
        assert_eq!(commands["faulty|explode"], json!({"type": "command"}));

        let submanagers = run_one(&dispatcher, "chats|getSubmanagers", json!({})).await;
        assert_eq!(submanagers.params, json!({"ch1": {"class": "ChatManager"}}));
    }

    // ==========================================================================
    // Configuration And Delivery Modes
    // ==========================================================================

    #[tokio::test]
    async fn push_mode_delivers_records_to_the_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::builder().push_results(tx).build().unwrap();
        let Fixture { dispatcher, .. } = fixture_with(dispatcher);

        let response = dispatcher.poll([exec("P1", "ping", json!({}))]);
        assert!(response.results.is_empty());

        let pushed = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(pushed.execution_id, "P1");
        assert_eq!(pushed.params, json!("pong"));
        assert!(dispatcher.poll(None).results.is_empty());
    }

    #[tokio::test]
    async fn pending_limit_drops_oldest_records() {
        let config = SwitchboardConfig {
            max_pending_results: Some(2),
            ..SwitchboardConfig::default()
        };
        let dispatcher = Dispatcher::builder().config(config).build().unwrap();

        dispatcher.poll([
            exec("A", "ping", json!({})),
            exec("B", "ping", json!({})),
            exec("C", "ping", json!({})),
        ]);
        dispatcher.wait_idle().await;

        let results = dispatcher.drain();
        assert_eq!(results.len(), 2);
        assert_eq!(dispatcher.results().dropped(), 1);
    }
}
