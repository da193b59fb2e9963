//! Testing utilities for dispatcher-level scenarios.
//!
//! Executions run on spawned tasks, so a test has to wait for results to
//! show up rather than read them right after `poll`. These helpers poll with
//! a deadline instead of sleeping for a fixed time.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! switchboard = { path = "../switchboard-rs", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use switchboard::testing::{poll_until, wait_until, RecordsExt};
//!
//! dispatcher.poll([json!({"exId": "E1", "command": "contacts|monitorAdd"})]);
//! wait_until(Duration::from_secs(1), || dispatcher.monitors().contains("E1")).await?;
//!
//! contacts.add(MemoryModel::new("c9", json!({})));
//! let results = poll_until(&dispatcher, Duration::from_secs(1), |r| {
//!     !r.for_execution("E1").is_empty()
//! })
//! .await?;
//! ```

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::{sleep, Instant};

use crate::dispatch::Dispatcher;
use crate::result::ResultRecord;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Polls `dispatcher` with empty batches until `predicate` holds for
/// everything collected so far.
///
/// Returns every record collected, including those that arrived in the same
/// drain as the one that satisfied the predicate.
pub async fn poll_until<F>(dispatcher: &Dispatcher, timeout: Duration, mut predicate: F) -> Result<Vec<ResultRecord>>
where
    F: FnMut(&[ResultRecord]) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    loop {
        collected.extend(dispatcher.poll(None).results);
        if predicate(&collected) {
            return Ok(collected);
        }
        if Instant::now() >= deadline {
            bail!(
                "timed out after {:?} with {} records: {:?}",
                timeout,
                collected.len(),
                collected
            );
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Waits until `condition` holds.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            bail!("condition not met within {:?}", timeout);
        }
        sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

/// Lookup helpers over collected result records.
pub trait RecordsExt {
    /// Records for one execution id, in arrival order.
    fn for_execution(&self, execution_id: &str) -> Vec<&ResultRecord>;

    /// The terminal record for one execution id, if it has arrived.
    fn terminal(&self, execution_id: &str) -> Option<&ResultRecord>;
}

impl RecordsExt for [ResultRecord] {
    fn for_execution(&self, execution_id: &str) -> Vec<&ResultRecord> {
        self.iter()
            .filter(|record| record.execution_id == execution_id)
            .collect()
    }

    fn terminal(&self, execution_id: &str) -> Option<&ResultRecord> {
        self.iter()
            .find(|record| record.execution_id == execution_id && record.is_terminal())
    }
}
