//! Shutdown coordination shared by the storage backends.
//!
//! Every saver and loader holds a [`LifecycleGuard`] for as long as it is
//! alive. [`Lifecycle::shutdown`] stops handing out new guards and waits for
//! the outstanding ones to be released.

use crate::core::{HeapwatchError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Liveness check plus in-flight counter of one backend instance.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    token: CancellationToken,
    in_flight: Arc<InFlight>,
}

/// Registration of one in-flight saver or loader. Dropping it deregisters.
#[derive(Debug)]
pub struct LifecycleGuard {
    in_flight: Arc<InFlight>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new in-flight user, failing once shutdown has begun.
    pub fn acquire(&self) -> Result<LifecycleGuard> {
        // Register before checking so a concurrent shutdown either sees us or we see it.
        self.in_flight.count.fetch_add(1, Ordering::SeqCst);
        let guard = LifecycleGuard {
            in_flight: Arc::clone(&self.in_flight),
        };
        if self.token.is_cancelled() {
            return Err(HeapwatchError::storage("storage has been shut down"));
        }
        Ok(guard)
    }

    /// Non-blocking liveness check
    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of savers and loaders currently alive
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Stops accepting new users and waits until every guard is released.
    /// Safe to call repeatedly and concurrently.
    pub async fn shutdown(&self) {
        self.token.cancel();
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}
