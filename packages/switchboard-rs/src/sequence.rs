//! Lazy, single-pass sequences streamed as partial results.
//!
//! A [`LazySequence`] is returned by a command handler when the result is a
//! list that should be delivered item by item instead of as one `FINAL`
//! payload. Every produced item becomes a `PARTIAL` record of the form
//! `{"item": <value>}`; the terminating `FINAL` follows once the producer
//! runs dry.
//!
//! Sequences are consumed by value, so restarting one is impossible by
//! construction.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};

use crate::error::CommandError;
use crate::monitor::{Completion, PartialSink};

type Producer = Box<dyn FnOnce(ItemSink) -> BoxFuture<'static, Result<(), CommandError>> + Send>;

/// Receives items from a sequence producer.
#[derive(Debug, Clone)]
pub struct ItemSink {
    sink: PartialSink,
}

impl ItemSink {
    /// Streams one item. Returns `false` once nobody is listening, which
    /// producers may treat as a request to stop early.
    pub fn push(&self, item: Value) -> bool {
        self.sink.emit(json!({ "item": item }))
    }
}

/// A lazily produced, finite stream of items.
pub struct LazySequence {
    producer: Producer,
}

impl LazySequence {
    /// Wraps an async producer.
    ///
    /// The producer is not called until the sequence is iterated.
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(ItemSink) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), CommandError>> + Send + 'static,
    {
        Self {
            producer: Box::new(move |sink| producer(sink).boxed()),
        }
    }

    /// A sequence over items already at hand.
    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        let items: Vec<Value> = items.into_iter().collect();
        Self::new(move |sink| async move {
            for item in items {
                if !sink.push(item) {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Runs the producer to completion, streaming every item into `sink`.
    pub async fn iter(self, sink: PartialSink) -> Result<Completion, CommandError> {
        (self.producer)(ItemSink { sink }).await?;
        Ok(Completion::Completed)
    }
}

impl std::fmt::Debug for LazySequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazySequence").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn items_are_wrapped_in_order() {
        let (sink, mut rx) = PartialSink::channel();
        let sequence = LazySequence::from_items(vec![json!("a"), json!("b"), json!("c")]);

        assert_eq!(sequence.iter(sink).await.unwrap(), Completion::Completed);

        assert_eq!(rx.recv().await.unwrap(), json!({"item": "a"}));
        assert_eq!(rx.recv().await.unwrap(), json!({"item": "b"}));
        assert_eq!(rx.recv().await.unwrap(), json!({"item": "c"}));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn empty_sequence_completes_without_items() {
        let (sink, mut rx) = PartialSink::channel();
        let sequence = LazySequence::from_items(Vec::new());

        assert_eq!(sequence.iter(sink).await.unwrap(), Completion::Completed);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn producer_errors_propagate() {
        let (sink, mut rx) = PartialSink::channel();
        let sequence = LazySequence::new(|items| async move {
            items.push(json!(1));
            Err(CommandError::value_error("ran out of pages"))
        });

        let err = sequence.iter(sink).await.unwrap_err();
        assert_eq!(err.to_string(), "ran out of pages");
        assert_eq!(rx.recv().await.unwrap(), json!({"item": 1}));
    }

    #[tokio::test]
    async fn producer_is_not_called_until_iterated() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let sequence = LazySequence::new(move |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(!called.load(Ordering::SeqCst));
        let (sink, _rx) = PartialSink::channel();
        sequence.iter(sink).await.unwrap();
        assert!(called.load(Ordering::SeqCst));
    }
}
