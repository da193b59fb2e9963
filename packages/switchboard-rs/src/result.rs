//! Result records and the drain-on-read result queue.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: a drained record is gone, there is no replay
//! - **In-memory only**: records are not persisted
//! - **Append order**: records are returned in the order they were appended
//!
//! Within one execution id the dispatcher appends partials in emission order
//! and the single `FINAL` or `ERROR` record last. Across execution ids only the
//! observed append order is preserved.
//!
//! # Push Mode
//!
//! A queue built with [`ResultQueue::with_push`] hands every record to the
//! supplied channel instead of buffering it. Polling such a queue returns
//! nothing unless the receiving side has gone away, in which case records fall
//! back to the buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

/// Outcome classification of a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultType {
    /// Terminal success record.
    Final,
    /// Intermediate record streamed by a monitor or sequence.
    Partial,
    /// Terminal failure record.
    Error,
}

/// One outcome record, correlated by execution id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// The caller-supplied execution id.
    #[serde(rename = "exId")]
    pub execution_id: String,
    /// Record classification.
    #[serde(rename = "type")]
    pub kind: ResultType,
    /// Record payload. `null` payloads are normalised to `{}`.
    pub params: Value,
}

impl ResultRecord {
    /// Creates a record, normalising a `null` payload to an empty object.
    pub fn new(execution_id: impl Into<String>, kind: ResultType, params: Value) -> Self {
        let params = if params.is_null() {
            Value::Object(Map::new())
        } else {
            params
        };
        Self {
            execution_id: execution_id.into(),
            kind,
            params,
        }
    }

    /// Whether this record terminates its execution id.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ResultType::Final | ResultType::Error)
    }
}

/// Ordered sink of result records, drained by the external poller.
pub struct ResultQueue {
    records: Mutex<VecDeque<ResultRecord>>,
    push: Option<mpsc::UnboundedSender<ResultRecord>>,
    max_pending: Option<usize>,
    dropped: AtomicU64,
}

impl ResultQueue {
    /// Creates an unbounded buffering queue.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            push: None,
            max_pending: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// Caps the number of undrained records.
    ///
    /// When the cap is reached the oldest buffered record is discarded to make
    /// room, and the discard is counted in [`ResultQueue::dropped`].
    pub fn with_limit(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending.map(|limit| limit.max(1));
        self
    }

    /// Delivers records to `sender` instead of buffering them.
    pub fn with_push(mut self, sender: mpsc::UnboundedSender<ResultRecord>) -> Self {
        self.push = Some(sender);
        self
    }

    /// Appends a record, or pushes it when a push channel is configured.
    pub fn set_result(&self, record: ResultRecord) {
        let record = match &self.push {
            Some(sender) => match sender.send(record) {
                Ok(()) => return,
                Err(mpsc::error::SendError(record)) => {
                    warn!(
                        execution_id = %record.execution_id,
                        "result push receiver closed, buffering record"
                    );
                    record
                }
            },
            None => record,
        };

        let mut records = self.lock();
        if let Some(limit) = self.max_pending {
            while records.len() >= limit {
                if let Some(discarded) = records.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        execution_id = %discarded.execution_id,
                        limit,
                        "result queue full, dropping oldest record"
                    );
                }
            }
        }
        records.push_back(record);
    }

    /// Appends a `FINAL` record.
    pub fn set_final(&self, execution_id: &str, params: Value) {
        self.set_result(ResultRecord::new(execution_id, ResultType::Final, params));
    }

    /// Appends a `PARTIAL` record.
    pub fn set_partial(&self, execution_id: &str, params: Value) {
        self.set_result(ResultRecord::new(execution_id, ResultType::Partial, params));
    }

    /// Appends an `ERROR` record.
    pub fn set_error(&self, execution_id: &str, params: Value) {
        self.set_result(ResultRecord::new(execution_id, ResultType::Error, params));
    }

    /// Takes every buffered record, leaving the queue empty.
    pub fn drain(&self) -> Vec<ResultRecord> {
        self.lock().drain(..).collect()
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether records are pushed rather than buffered.
    pub fn is_push(&self) -> bool {
        self.push.is_some()
    }

    // A panic while holding the lock cannot leave the deque half-written, so
    // a poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, VecDeque<ResultRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ResultQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResultQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultQueue")
            .field("pending", &self.len())
            .field("push", &self.is_push())
            .field("max_pending", &self.max_pending)
            .field("dropped", &self.dropped())
            .finish()
    }
}
