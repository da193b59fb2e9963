//! Counts executions that have been accepted but not yet terminated.
//!
//! The dispatcher takes an [`InflightGuard`] synchronously while handling a
//! poll, before spawning the execution task, so a caller that awaits
//! [`InflightTracker::wait_zero`] right after `poll` never misses work that
//! poll accepted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

// =============================================================================
// Inflight Tracking
// =============================================================================

/// Tracks how many executions are inflight.
#[derive(Default)]
pub struct InflightTracker {
    total: AtomicUsize,
    notify: Notify,
}

impl InflightTracker {
    /// Create a new inflight tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one execution as inflight until the returned guard is dropped.
    pub fn enter(self: &Arc<Self>) -> InflightGuard {
        self.total.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            tracker: self.clone(),
        }
    }

    fn exit(&self) {
        let prev = self.total.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Number of inflight executions.
    pub fn count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Waits until no executions are inflight.
    ///
    /// Monitors keep their execution inflight until they are stopped, so
    /// this only returns once every monitor has terminated.
    pub async fn wait_zero(&self) {
        loop {
            // Register before checking, notify_waiters is edge-triggered.
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for InflightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightTracker")
            .field("inflight", &self.count())
            .finish()
    }
}

// =============================================================================
// Inflight Guard (RAII)
// =============================================================================

/// RAII guard for decrementing the inflight count on drop.
///
/// Ensures the count is decremented even if the execution task panics or is
/// aborted, preventing hung `wait_idle` calls.
pub struct InflightGuard {
    tracker: Arc<InflightTracker>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.exit();
    }
}

impl std::fmt::Debug for InflightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightGuard").finish_non_exhaustive()
    }
}
