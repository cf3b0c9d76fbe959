//! Connection tracking for drain coordination.
//!
//! Every accepted connection holds a `ConnectionGuard`; the tracker is
//! drained once the last guard drops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Counts live connections for one listener.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    count: AtomicUsize,
    notify: Notify,
}

/// Decrements the owning tracker when dropped.
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    pub fn guard(&self) -> ConnectionGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current number of live connections.
    pub fn active(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolve once no connection is live.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a guard dropped in between still wakes us.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for all connections to complete, up to `timeout`.
    ///
    /// Returns `true` if all connections drained, `false` if timed out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let active = self.active();
        if active == 0 {
            debug!("No active connections, drain complete");
            return true;
        }

        debug!(
            active_connections = active,
            timeout_secs = timeout.as_secs(),
            "Draining active connections"
        );

        tokio::select! {
            _ = self.drained() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    remaining_connections = self.active(),
                    timeout_secs = timeout.as_secs(),
                    "Drain timeout expired"
                );
                false
            }
        }
    }
}
