//! Line-driven driver for a switchboard dispatcher over an in-memory host.
//!
//! Reads one JSON value per line from stdin and prints one poll response per
//! line to stdout. Logs go to stderr.
//!
//! | Line                                   | Effect                             |
//! |----------------------------------------|------------------------------------|
//! | `[{...}, {...}]`                       | poll with that batch               |
//! | `{"exId": ..., "command": ...}`        | poll with a one-item batch         |
//! | empty line or `null`                   | poll with nothing (pure drain)     |
//! | `{"host": "add", ...}` and friends     | mutate the in-memory host, then poll |
//!
//! Host mutations:
//!
//! ```text
//! {"host": "add",    "collection": "contacts", "item": {"id": "c9", "name": "Zed"}}
//! {"host": "remove", "collection": "contacts", "id": "c9"}
//! {"host": "set",    "collection": "contacts", "id": "c1", "field": "name", "value": "Anna"}
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use switchboard::{
    CollectionManager, Dispatcher, MemoryCollection, MemoryModel, PollResponse, SwitchboardConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Drive a switchboard dispatcher from JSON lines on stdin")]
struct Cli {
    /// JSON file mapping collection names to arrays of items (each with an "id")
    #[arg(long, global = true)]
    seed: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read batches from stdin and print poll responses (default)
    Run {
        /// How long to let executions run before each poll
        #[arg(long, default_value_t = 20)]
        settle_ms: u64,

        /// Print records as they are produced instead of on poll
        #[arg(long)]
        push: bool,

        /// How long to wait for executions to finish at end of input
        #[arg(long, default_value_t = 5)]
        drain_timeout_secs: u64,
    },

    /// Print every command reachable from the root and exit
    Commands,
}

type Host = BTreeMap<String, Arc<MemoryCollection>>;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchboard=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .init();

    let cli = Cli::parse();
    let config = SwitchboardConfig::from_env().context("invalid switchboard configuration")?;

    let seed = match &cli.seed {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read seed file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("seed file {} is not valid JSON", path.display()))?
        }
        None => demo_seed(),
    };

    match cli.command.unwrap_or(Commands::Run {
        settle_ms: 20,
        push: false,
        drain_timeout_secs: 5,
    }) {
        Commands::Run {
            settle_ms,
            push,
            drain_timeout_secs,
        } => {
            run(
                config,
                &seed,
                Duration::from_millis(settle_ms),
                push,
                Duration::from_secs(drain_timeout_secs),
            )
            .await
        }
        Commands::Commands => print_commands(config, &seed).await,
    }
}

fn demo_seed() -> Value {
    json!({
        "contacts": [
            {"id": "c1", "name": "Ann", "pushname": "ann"},
            {"id": "c2", "name": "Bob", "pushname": "bob"}
        ],
        "chats": [
            {"id": "ch1", "contactId": "c1", "unreadCount": 0},
            {"id": "ch2", "contactId": "c2", "unreadCount": 3}
        ]
    })
}

fn build_host(dispatcher: &Dispatcher, seed: &Value) -> Result<Host> {
    let Some(collections) = seed.as_object() else {
        bail!("seed must be an object of collection name to item array");
    };

    let mut host = Host::new();
    for (name, items) in collections {
        let items = items
            .as_array()
            .with_context(|| format!("seed collection {name} must be an array"))?;
        let collection = Arc::new(MemoryCollection::new());
        for item in items {
            collection.add(model_from(item)?);
        }
        dispatcher.add_submanager(name, Arc::new(CollectionManager::new(collection.clone())));
        tracing::info!(collection = %name, items = items.len(), "seeded collection");
        host.insert(name.clone(), collection);
    }
    Ok(host)
}

fn model_from(item: &Value) -> Result<Arc<MemoryModel>> {
    let id = match item.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => bail!("seed item has no id: {item}"),
    };
    let mut fields = item.clone();
    if let Some(fields) = fields.as_object_mut() {
        fields.remove("id");
    }
    Ok(MemoryModel::new(id, fields))
}

async fn print_commands(config: SwitchboardConfig, seed: &Value) -> Result<()> {
    let dispatcher = Dispatcher::builder().config(config).build()?;
    build_host(&dispatcher, seed)?;

    let commands = dispatcher
        .root_handle()
        .execute_command("getCommands", Value::Null)
        .await
        .context("getCommands failed")?;
    match commands {
        switchboard::CommandOutput::Value(table) => {
            println!("{}", serde_json::to_string_pretty(&table)?);
            Ok(())
        }
        other => bail!("getCommands returned a {}", other.shape()),
    }
}

async fn run(
    config: SwitchboardConfig,
    seed: &Value,
    settle: Duration,
    push: bool,
    drain_timeout: Duration,
) -> Result<()> {
    let mut builder = Dispatcher::builder().config(config);
    let printer = if push {
        let (tx, mut rx) = mpsc::unbounded_channel();
        builder = builder.push_results(tx);
        Some(tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                match serde_json::to_string(&record) {
                    Ok(line) => println!("{line}"),
                    Err(err) => tracing::error!(error = %err, "failed to encode pushed record"),
                }
            }
        }))
    } else {
        None
    };

    let dispatcher = builder.build()?;
    let host = build_host(&dispatcher, seed)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        let input: Value = if line.is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(line) {
                Ok(input) => input,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping line that is not JSON");
                    continue;
                }
            }
        };

        let batch = match input {
            Value::Object(ref object) if object.contains_key("host") => {
                if let Err(err) = apply_host_change(&host, &input) {
                    tracing::warn!(error = %err, "host change rejected");
                }
                Vec::new()
            }
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };

        let response = dispatcher.poll(batch);
        tokio::time::sleep(settle).await;
        let settled = dispatcher.poll(None);
        print_response(merge(response, settled))?;
    }

    let stopped = dispatcher.shutdown();
    if tokio::time::timeout(drain_timeout, dispatcher.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(
            inflight = dispatcher.inflight(),
            "executions still running at exit"
        );
    }
    tracing::info!(stopped, "input closed");
    print_response(dispatcher.poll(None))?;

    drop(dispatcher);
    if let Some(printer) = printer {
        // Exits once every sender, including spawned executions, is gone.
        let _ = tokio::time::timeout(drain_timeout, printer).await;
    }
    Ok(())
}

fn merge(mut first: PollResponse, second: PollResponse) -> PollResponse {
    first.results.extend(second.results);
    first.errors.extend(second.errors);
    first
}

fn print_response(response: PollResponse) -> Result<()> {
    if response.results.is_empty() && response.errors.is_empty() {
        return Ok(());
    }
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

fn apply_host_change(host: &Host, change: &Value) -> Result<()> {
    let collection_name = change["collection"]
        .as_str()
        .context("host change needs a collection")?;
    let collection = host
        .get(collection_name)
        .with_context(|| format!("unknown collection {collection_name}"))?;

    match change["host"].as_str() {
        Some("add") => collection.add(model_from(&change["item"])?),
        Some("remove") => {
            let id = change["id"].as_str().context("remove needs an id")?;
            collection
                .remove(id)
                .with_context(|| format!("no item {id} in {collection_name}"))?;
        }
        Some("set") => {
            let id = change["id"].as_str().context("set needs an id")?;
            let field = change["field"].as_str().context("set needs a field")?;
            let model = collection
                .model(id)
                .with_context(|| format!("no item {id} in {collection_name}"))?;
            model.set_field(field, change["value"].clone());
        }
        other => bail!("unknown host change {other:?}"),
    }
    Ok(())
}
