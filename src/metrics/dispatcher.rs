//! Push delivery of session metrics to subscribers.
//!
//! Each subscriber owns a bounded queue. Broadcasting never blocks: an update
//! for a subscriber whose queue is full, or whose context is cancelled, is
//! dropped for that subscriber only.

use crate::core::{SessionDescription, SessionMetrics};
use futures::Stream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Subscriber {
    sender: mpsc::Sender<Arc<SessionMetrics>>,
    ctx: CancellationToken,
}

#[derive(Default)]
struct Subscribers {
    by_session: RwLock<HashMap<String, HashMap<u64, Subscriber>>>,
    next_id: AtomicU64,
}

impl Subscribers {
    fn remove(&self, session_key: &str, id: u64) {
        let mut table = self.by_session.write();
        if let Some(subscribers) = table.get_mut(session_key) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                table.remove(session_key);
            }
        }
    }
}

/// Registry of live subscriptions, keyed by session.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Subscribers>,
    buffer: usize,
}

impl Dispatcher {
    /// `buffer` is the per-subscriber queue depth.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Subscribers::default()),
            buffer: buffer.max(1),
        }
    }

    pub fn create_subscription(&self, ctx: CancellationToken, session: &SessionDescription) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let key = session.key();
        let (sender, receiver) = mpsc::channel(self.buffer);

        self.inner
            .by_session
            .write()
            .entry(key.clone())
            .or_default()
            .insert(id, Subscriber { sender, ctx: ctx.clone() });

        tracing::debug!("Subscription {} created for session {}", id, key);
        Subscription {
            id,
            session_key: key,
            receiver,
            ctx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Offers `metrics` to every subscriber of `session` without waiting.
    /// Returns how many subscribers accepted the update.
    pub fn broadcast(&self, session: &SessionDescription, metrics: Arc<SessionMetrics>) -> usize {
        let key = session.key();
        let table = self.inner.by_session.read();
        let Some(subscribers) = table.get(&key) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, subscriber) in subscribers {
            if subscriber.ctx.is_cancelled() {
                continue;
            }
            match subscriber.sender.try_send(Arc::clone(&metrics)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("Subscriber {} of {} is lagging, update dropped", id, key);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn has_subscribers(&self, session: &SessionDescription) -> bool {
        self.inner.by_session.read().contains_key(&session.key())
    }

    pub fn subscriber_count(&self, session: &SessionDescription) -> usize {
        self.inner
            .by_session
            .read()
            .get(&session.key())
            .map_or(0, HashMap::len)
    }

    /// Number of sessions with at least one subscriber
    pub fn session_count(&self) -> usize {
        self.inner.by_session.read().len()
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    session_key: String,
    receiver: mpsc::Receiver<Arc<SessionMetrics>>,
    ctx: CancellationToken,
    registry: Weak<Subscribers>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next update, or `None` once the context is cancelled.
    pub async fn recv(&mut self) -> Option<Arc<SessionMetrics>> {
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => None,
            update = self.receiver.recv() => update,
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<SessionMetrics>> {
        self.receiver.try_recv().ok()
    }

    /// Removes the subscription from the dispatcher.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Adapts the subscription into a stream of updates.
    pub fn into_stream(self) -> impl Stream<Item = Arc<SessionMetrics>> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            let update = subscription.recv().await?;
            Some((update, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.session_key, self.id);
            tracing::debug!("Subscription {} for session {} removed", self.id, self.session_key);
        }
    }
}
