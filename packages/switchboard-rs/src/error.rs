//! Structured error types for command routing and execution.
//!
//! `CommandError` provides pattern-matchable failures instead of generic
//! `anyhow::Error`. Every variant knows how to render itself as the payload of
//! an `ERROR` result record, so the dispatcher never has to guess at shapes.
//!
//! # The Error Boundary Rule
//!
//! > **No error ever escapes `Dispatcher::poll`.**
//!
//! - Failures raised while executing one execution id become exactly one
//!   `ERROR` record for that id.
//! - Failures in the batch shape itself (no execution id, no command name)
//!   become [`BatchError`]s in the poll response, because there is no id to
//!   attach a record to.
//!
//! Stream termination (a monitor being stopped, a sequence running dry) is not
//! an error at all; see [`crate::Completion`].
//!
//! # Payload Shapes
//!
//! ```text
//! structured   {"name": "CommandNotFound", "message": "Command foo not found", "params": {}}
//! opaque       {"err": <whatever the handler failed with>}
//! ```

use std::borrow::Cow;

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Errors surfaced while resolving or executing a command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// A path segment named a submanager that is not bound.
    #[error("Manager {name} not found")]
    ManagerNotFound {
        /// The unresolved submanager name.
        name: String,
    },

    /// The terminal path segment is not a registered operation.
    #[error("Command {command} not found")]
    CommandNotFound {
        /// The unresolved operation name.
        command: String,
    },

    /// A host model lookup failed.
    #[error("{message}")]
    ModelNotFound {
        /// Human readable description of the missing model.
        message: String,
    },

    /// Command parameters were missing or malformed.
    #[error("{message}")]
    ValueError {
        /// Human readable description of the bad value.
        message: String,
    },

    /// A structured failure raised by the host object model.
    #[error("{name}: {message}")]
    Host {
        /// Error class name reported to the controller.
        name: String,
        /// Human readable message.
        message: String,
        /// Extra structured context.
        params: Value,
    },

    /// An unstructured failure value, forwarded as-is.
    #[error("unstructured failure: {0}")]
    Opaque(Value),

    /// The handler panicked while executing.
    #[error("handler panicked: {message}")]
    Panicked {
        /// The panic message, when one could be recovered.
        message: String,
    },

    /// Any other error raised by handler code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CommandError {
    /// Creates a manager-not-found error.
    pub fn manager_not_found(name: impl Into<String>) -> Self {
        Self::ManagerNotFound { name: name.into() }
    }

    /// Creates a command-not-found error.
    pub fn command_not_found(command: impl Into<String>) -> Self {
        Self::CommandNotFound {
            command: command.into(),
        }
    }

    /// Creates a model-not-found error.
    pub fn model_not_found(message: impl Into<String>) -> Self {
        Self::ModelNotFound {
            message: message.into(),
        }
    }

    /// Creates a value error.
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::ValueError {
            message: message.into(),
        }
    }

    /// Creates a structured host failure.
    pub fn host(name: impl Into<String>, message: impl Into<String>, params: Value) -> Self {
        Self::Host {
            name: name.into(),
            message: message.into(),
            params,
        }
    }

    /// Wraps an arbitrary value as an opaque failure.
    pub fn opaque(value: impl Into<Value>) -> Self {
        Self::Opaque(value.into())
    }

    /// Creates a panic error.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked {
            message: message.into(),
        }
    }

    /// The error class name reported to the controller.
    ///
    /// Returns `None` for opaque failures, which carry no name.
    pub fn name(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::ManagerNotFound { .. } => Some("ManagerNotFound".into()),
            Self::CommandNotFound { .. } => Some("CommandNotFound".into()),
            Self::ModelNotFound { .. } => Some("ModelNotFound".into()),
            Self::ValueError { .. } => Some("ValueError".into()),
            Self::Host { name, .. } => Some(Cow::Borrowed(name.as_str())),
            Self::Panicked { .. } => Some("Panic".into()),
            Self::Other(_) => Some("Error".into()),
            Self::Opaque(_) => None,
        }
    }

    /// Renders this error as the `params` of an `ERROR` result record.
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Opaque(value) => json!({ "err": value }),
            Self::Host {
                name,
                message,
                params,
            } => json!({
                "name": name,
                "message": message,
                "params": non_null_params(params),
            }),
            other => json!({
                "name": other.name(),
                "message": other.to_string(),
                "params": Value::Object(Map::new()),
            }),
        }
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(source: serde_json::Error) -> Self {
        Self::value_error(source.to_string())
    }
}

fn non_null_params(params: &Value) -> Value {
    if params.is_null() {
        Value::Object(Map::new())
    } else {
        params.clone()
    }
}

/// A batch item rejected before dispatch.
///
/// These never become result records: they are returned directly in the
/// `errors` list of the poll response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    /// Failure name (`RequiredExecutionId` or `RequiredCommandName`).
    pub name: &'static str,
    /// Human readable message.
    pub message: &'static str,
    /// The offending batch item, echoed back verbatim.
    #[serde(rename = "executionsObj")]
    pub executions_obj: Value,
}

impl BatchError {
    /// The item carries no usable execution id.
    pub fn missing_execution_id(item: Value) -> Self {
        Self {
            name: "RequiredExecutionId",
            message: "Execution ID is required",
            executions_obj: item,
        }
    }

    /// The item carries no usable command name.
    pub fn missing_command(item: Value) -> Self {
        Self {
            name: "RequiredCommandName",
            message: "Command name is required",
            executions_obj: item,
        }
    }
}

/// Errors raised while assembling a dispatcher.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// No runtime handle was supplied and none is current.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
