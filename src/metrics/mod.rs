//! Heap consumption metrics engine.
//!
//! This module turns measurement streams into per call-site consumption
//! rates:
//! - Live sessions are kept resident and updated on every measurement
//! - Finished sessions are replayed from storage on demand (cold path)
//! - Subscribers of a live session are pushed fresh rates as they change

pub mod cache;
pub mod dispatcher;
pub mod location;
pub mod regression;
pub mod session;

pub use cache::ResultCache;
pub use dispatcher::{Dispatcher, Subscription};
pub use location::LocationData;
pub use regression::{compute_rates, location_rates, slope, HeapSeries};
pub use session::SessionData;

use crate::core::config::MetricsConfig;
use crate::core::{HeapwatchError, Measurement, Result, SessionDescription, SessionMetrics};
use crate::storage::{DataLoader, Storage};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Registry of resident sessions plus the cold path over storage.
pub struct MetricsService {
    sessions: RwLock<HashMap<SessionDescription, Arc<SessionData>>>,
    storage: Arc<dyn Storage>,
    dispatcher: Dispatcher,
    cold_cache: Option<Arc<ResultCache>>,
    window: usize,
}

impl MetricsService {
    /// `cold_cache` holds results of replayed sessions; `None` disables caching.
    pub fn new(
        storage: Arc<dyn Storage>,
        dispatcher: Dispatcher,
        config: &MetricsConfig,
        cold_cache: Option<Arc<ResultCache>>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            storage,
            dispatcher,
            cold_cache,
            window: config.window,
        }
    }

    fn resident(&self, session: &SessionDescription) -> Option<Arc<SessionData>> {
        self.sessions.read().get(session).cloned()
    }

    fn resident_or_insert(&self, session: &SessionDescription) -> Arc<SessionData> {
        if let Some(data) = self.resident(session) {
            return data;
        }
        let mut sessions = self.sessions.write();
        Arc::clone(
            sessions
                .entry(session.clone())
                .or_insert_with(|| Arc::new(SessionData::new(session.clone(), self.window))),
        )
    }

    /// Folds a live measurement into its session, creating the session state
    /// on first use, and pushes fresh rates to subscribers if there are any.
    pub async fn put_measurement(&self, session: &SessionDescription, measurement: &Measurement) -> Result<()> {
        let data = self.resident_or_insert(session);
        data.register_measurement(measurement)?;

        if self.dispatcher.has_subscribers(session) {
            let metrics = tokio::task::spawn_blocking(move || data.get_session_metrics()).await??;
            let delivered = self.dispatcher.broadcast(session, metrics);
            tracing::trace!("Pushed metrics of {} to {} subscribers", session, delivered);
        }
        Ok(())
    }

    /// Rates of `session`, sorted by in-use bytes rate descending.
    ///
    /// Resident sessions are served from memory. Anything else is replayed
    /// from storage into a temporary session that is never made resident.
    /// Undecodable records are skipped; any other failure or cancellation of
    /// `ctx` aborts the replay.
    pub async fn get_session_metrics(
        &self,
        ctx: &CancellationToken,
        session: &SessionDescription,
    ) -> Result<Arc<SessionMetrics>> {
        if let Some(data) = self.resident(session) {
            return tokio::task::spawn_blocking(move || data.get_session_metrics()).await?;
        }

        let key = session.key();
        if let Some(cached) = self.cold_cache.as_ref().and_then(|c| c.get(&key)) {
            tracing::debug!("Cold metrics of {} served from cache", session);
            return Ok(cached);
        }

        let metrics = self.replay(ctx, session).await?;
        if let Some(cache) = &self.cold_cache {
            cache.insert(key, Arc::clone(&metrics));
        }
        Ok(metrics)
    }

    async fn replay(&self, ctx: &CancellationToken, session: &SessionDescription) -> Result<Arc<SessionMetrics>> {
        let mut loader = self.storage.new_data_loader(session).await?;
        let data = SessionData::new(session.clone(), self.window);

        let replayed = replay_into(loader.as_mut(), ctx, &data).await;
        let closed = loader.close().await;
        let skipped = replayed?;
        closed?;

        tracing::debug!(
            "Replayed {} measurements of {} ({} skipped)",
            data.measurement_count(),
            session,
            skipped
        );
        tokio::task::spawn_blocking(move || data.get_session_metrics()).await?
    }

    pub fn subscribe(&self, ctx: CancellationToken, session: &SessionDescription) -> Subscription {
        self.dispatcher.create_subscription(ctx, session)
    }

    /// Drops the resident state of a session. Returns whether it was resident.
    pub fn forget_session(&self, session: &SessionDescription) -> bool {
        let removed = self.sessions.write().remove(session).is_some();
        if removed {
            tracing::debug!("Forgot resident session {}", session);
        }
        removed
    }

    pub fn is_resident(&self, session: &SessionDescription) -> bool {
        self.sessions.read().contains_key(session)
    }

    pub fn resident_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Feeds every loadable measurement into `data`. Returns the number of
/// skipped records.
async fn replay_into(loader: &mut dyn DataLoader, ctx: &CancellationToken, data: &SessionData) -> Result<usize> {
    let mut stream = loader.load(ctx.clone());
    let mut skipped = 0;

    loop {
        let item = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(HeapwatchError::Cancelled),
            item = stream.next() => item,
        };

        match item {
            None => return Ok(skipped),
            Some(Ok(measurement)) => {
                if let Err(e) = data.register_measurement(&measurement) {
                    tracing::warn!("Skipping measurement of {}: {}", data.session(), e);
                    skipped += 1;
                }
            }
            Some(Err(e)) if e.is_record_level() => {
                tracing::warn!("Skipping undecodable record of {}: {}", data.session(), e);
                skipped += 1;
            }
            Some(Err(e)) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CacheConfig;
    use crate::core::{CallStack, InstanceDescription, Location, MemoryUsage, StackFrame};
    use crate::storage::{FilesystemStorage, SqliteMetadataStorage};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn at(step: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(step)
    }

    fn measurement(step: i64) -> Measurement {
        Measurement {
            observed_at: at(step),
            locations: vec![Location {
                call_stack: CallStack::new(vec![StackFrame::new("grow", "leak.go", 9)]),
                memory_usage: MemoryUsage {
                    alloc_objects: step,
                    alloc_bytes: step * 1000,
                    free_objects: 0,
                    free_bytes: 0,
                },
            }],
        }
    }

    fn service(dir: &TempDir, cache: bool) -> (Arc<dyn Storage>, MetricsService) {
        let metadata = Arc::new(SqliteMetadataStorage::open_in_memory().unwrap());
        let storage: Arc<dyn Storage> =
            Arc::new(FilesystemStorage::open(dir.path().to_path_buf(), false, metadata).unwrap());
        let config = MetricsConfig::default();
        let cold_cache = cache.then(|| ResultCache::new(CacheConfig::default()));
        let metrics = MetricsService::new(Arc::clone(&storage), Dispatcher::new(4), &config, cold_cache);
        (storage, metrics)
    }

    async fn record(storage: &Arc<dyn Storage>, steps: i64) -> SessionDescription {
        let mut saver = storage
            .new_data_saver(&InstanceDescription::new("api", "api-1").unwrap())
            .await
            .unwrap();
        for step in 0..steps {
            saver.save(&measurement(step)).await.unwrap();
        }
        let session = saver.session().clone();
        saver.close().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_cold_path_matches_live_path() {
        let dir = TempDir::new().unwrap();
        let (storage, metrics) = service(&dir, false);
        let session = record(&storage, 5).await;

        for step in 0..5 {
            metrics.put_measurement(&session, &measurement(step)).await.unwrap();
        }
        let live = metrics.get_session_metrics(&CancellationToken::new(), &session).await.unwrap();

        assert!(metrics.forget_session(&session));
        let cold = metrics.get_session_metrics(&CancellationToken::new(), &session).await.unwrap();

        assert_eq!(live, cold);
        assert!((cold.locations[0].rates.alloc_bytes_rate - 1000.0).abs() < 1e-9);
        // Replays never become resident.
        assert!(!metrics.is_resident(&session));
    }

    #[tokio::test]
    async fn test_cold_path_skips_undecodable_records() {
        let dir = TempDir::new().unwrap();
        let (storage, metrics) = service(&dir, false);
        let session = record(&storage, 2).await;

        let path = dir
            .path()
            .join("api")
            .join("api-1")
            .join(format!("{}.ndjson", session.session_id));
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"\xff\xfe garbage\n");
        let mut line = serde_json::to_vec(&measurement(2)).unwrap();
        line.push(b'\n');
        raw.extend_from_slice(&line);
        std::fs::write(&path, raw).unwrap();

        let metrics = metrics.get_session_metrics(&CancellationToken::new(), &session).await.unwrap();
        assert_eq!(metrics.locations.len(), 1);
        // Rates come from the three intact records.
        assert!((metrics.locations[0].rates.alloc_bytes_rate - 1000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancelled_cold_path() {
        let dir = TempDir::new().unwrap();
        let (storage, metrics) = service(&dir, false);
        let session = record(&storage, 3).await;

        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = metrics.get_session_metrics(&ctx, &session).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_cold_path_cache() {
        let dir = TempDir::new().unwrap();
        let (storage, metrics) = service(&dir, true);
        let session = record(&storage, 3).await;

        let first = metrics.get_session_metrics(&CancellationToken::new(), &session).await.unwrap();
        let second = metrics.get_session_metrics(&CancellationToken::new(), &session).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (_, metrics) = service(&dir, false);
        let session = SessionDescription::new(InstanceDescription::new("api", "api-1").unwrap(), 99);

        let err = metrics
            .get_session_metrics(&CancellationToken::new(), &session)
            .await
            .unwrap_err();
        assert!(matches!(err, HeapwatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates() {
        let dir = TempDir::new().unwrap();
        let (_, metrics) = service(&dir, false);
        let session = SessionDescription::new(InstanceDescription::new("api", "api-1").unwrap(), 1);

        let mut subscription = metrics.subscribe(CancellationToken::new(), &session);
        metrics.put_measurement(&session, &measurement(0)).await.unwrap();
        metrics.put_measurement(&session, &measurement(1)).await.unwrap();

        let first = subscription.recv().await.unwrap();
        let second = subscription.recv().await.unwrap();
        assert_eq!(first.locations[0].rates.alloc_bytes_rate, 0.0);
        assert!((second.locations[0].rates.alloc_bytes_rate - 1000.0).abs() < 1e-9);
    }
}
