//! Size-bounded result cache with time-to-live.
//!
//! Entries are evicted least recently used first once the summed entry size
//! would exceed the configured maximum. Expired entries are never served
//! and are removed by a periodic garbage collection task.

use crate::core::config::CacheConfig;
use crate::core::SessionMetrics;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// Entries inspected between two pause-budget checks during a GC pass.
const GC_CHECK_EVERY: usize = 64;

struct CacheEntry {
    value: Arc<SessionMetrics>,
    size: usize,
    inserted_at: Instant,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    total_size: usize,
}

/// Cache of computed session metrics keyed by session key.
pub struct ResultCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_size: 0,
            }),
        })
    }

    /// Stores `value`, evicting least recently used entries to make room.
    /// Returns false if the value alone exceeds the size bound.
    pub fn insert(&self, key: String, value: Arc<SessionMetrics>) -> bool {
        let size = value.approx_size() + key.len();
        if size > self.config.max_total_size {
            return false;
        }

        let mut state = self.state.lock();
        if let Some(old) = state.entries.pop(&key) {
            state.total_size -= old.size;
        }
        while state.total_size + size > self.config.max_total_size {
            match state.entries.pop_lru() {
                Some((_, evicted)) => state.total_size -= evicted.size,
                None => break,
            }
        }

        state.total_size += size;
        state.entries.put(
            key,
            CacheEntry {
                value,
                size,
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Returns the entry if present and not yet expired.
    pub fn get(&self, key: &str) -> Option<Arc<SessionMetrics>> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            None => return None,
            Some(entry) if entry.inserted_at.elapsed() < self.config.ttl => {
                return Some(Arc::clone(&entry.value));
            }
            Some(_) => true,
        };
        if expired {
            if let Some(entry) = state.entries.pop(key) {
                state.total_size -= entry.size;
            }
        }
        None
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.pop(key) {
            Some(entry) => {
                state.total_size -= entry.size;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summed approximate size of all entries in bytes
    pub fn total_size(&self) -> usize {
        self.state.lock().total_size
    }

    /// Removes expired entries, stopping early once the pass has held the
    /// lock for `gc_max_pause`. Returns the number of entries removed.
    pub fn collect_garbage(&self) -> usize {
        let started = std::time::Instant::now();
        let mut state = self.state.lock();

        let mut expired = Vec::new();
        for (inspected, (key, entry)) in state.entries.iter().enumerate() {
            if inspected > 0 && inspected % GC_CHECK_EVERY == 0 && started.elapsed() >= self.config.gc_max_pause {
                break;
            }
            if entry.inserted_at.elapsed() >= self.config.ttl {
                expired.push(key.clone());
            }
        }

        for key in &expired {
            if let Some(entry) = state.entries.pop(key) {
                state.total_size -= entry.size;
            }
        }
        expired.len()
    }

    /// Runs [`collect_garbage`](Self::collect_garbage) every `gc_frequency`
    /// until `shutdown` fires or the cache is dropped.
    pub fn spawn_gc(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let mut interval = tokio::time::interval(self.config.gc_frequency);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.collect_garbage();
                if removed > 0 {
                    tracing::debug!("Result cache GC removed {} expired entries", removed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CallStack, HeapConsumptionRates, LocationMetrics, StackFrame};
    use std::time::Duration;

    fn config(ttl_ms: u64, gc_ms: u64) -> CacheConfig {
        CacheConfig {
            max_total_size: 1024 * 1024,
            ttl: Duration::from_millis(ttl_ms),
            gc_frequency: Duration::from_millis(gc_ms),
            gc_max_pause: Duration::from_millis(10),
        }
    }

    fn metrics(frames: usize) -> Arc<SessionMetrics> {
        Arc::new(SessionMetrics {
            locations: vec![LocationMetrics {
                call_stack: CallStack::new((0..frames).map(|i| StackFrame::new(format!("f{i}"), "a.go", 1)).collect()),
                rates: HeapConsumptionRates::default(),
            }],
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_not_served() {
        let cache = ResultCache::new(config(1000, 60_000));
        cache.insert("s1".to_string(), metrics(1));
        assert!(cache.get("s1").is_some());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(cache.get("s1").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.total_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_task_removes_expired_entries() {
        let cache = ResultCache::new(config(1000, 2000));
        let handle = cache.spawn_gc(CancellationToken::new());

        cache.insert("s1".to_string(), metrics(1));
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(cache.len(), 0);

        drop(cache);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_size_bound_evicts_lru() {
        let one = metrics(4);
        let entry_size = one.approx_size() + 2;
        let cache = ResultCache::new(CacheConfig {
            max_total_size: entry_size * 2,
            ..config(60_000, 60_000)
        });

        cache.insert("s1".to_string(), Arc::clone(&one));
        cache.insert("s2".to_string(), Arc::clone(&one));
        // Touch s1 so s2 is the eviction candidate.
        assert!(cache.get("s1").is_some());
        cache.insert("s3".to_string(), one);

        assert!(cache.get("s1").is_some());
        assert!(cache.get("s2").is_none());
        assert!(cache.get("s3").is_some());
        assert!(cache.total_size() <= entry_size * 2);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let cache = ResultCache::new(CacheConfig {
            max_total_size: 16,
            ..config(60_000, 60_000)
        });
        assert!(!cache.insert("s1".to_string(), metrics(8)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_replacing_entry_keeps_size_consistent() {
        let cache = ResultCache::new(config(60_000, 60_000));
        cache.insert("s1".to_string(), metrics(1));
        let before = cache.total_size();
        cache.insert("s1".to_string(), metrics(1));
        assert_eq!(cache.total_size(), before);
        assert!(cache.remove("s1"));
        assert_eq!(cache.total_size(), 0);
    }
}
