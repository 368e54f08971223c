//! Collector wiring and network surface.
//!
//! The [`Collector`] owns one instance of every long-lived component
//! (metadata store, storage backend, metrics engine, result cache) and hands
//! out per-stream [`SaveProtocol`]s. The [`http`] module exposes it over HTTP.

pub mod http;

use crate::core::{Config, Result};
use crate::metrics::{Dispatcher, MetricsService, ResultCache};
use crate::protocol::SaveProtocol;
use crate::storage::{self, MetadataStorage, SqliteMetadataStorage, Storage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The running collector.
pub struct Collector {
    config: Config,
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsService>,
    shutdown: CancellationToken,
    cache_gc: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl Collector {
    /// Opens storage under the configured data directory and starts the
    /// background tasks. Must run inside a Tokio runtime.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;

        let metadata: Arc<dyn MetadataStorage> = Arc::new(SqliteMetadataStorage::open(&config.metadata_path())?);
        let storage = storage::open_storage(&config, metadata)?;
        Ok(Self::with_storage(config, storage))
    }

    /// Builds a collector on top of an already opened backend.
    pub fn with_storage(config: Config, storage: Arc<dyn Storage>) -> Self {
        let shutdown = CancellationToken::new();
        let metrics_config = &config.metrics;

        let (cold_cache, cache_gc) = if metrics_config.cold_path_cache {
            let cache = ResultCache::new(metrics_config.cache.clone());
            let gc = cache.spawn_gc(shutdown.child_token());
            (Some(cache), Some(gc))
        } else {
            (None, None)
        };

        tracing::info!(
            "Metrics window {} points, averaging windows {:?} (reported only), cold cache {}",
            metrics_config.window,
            metrics_config.averaging_windows,
            if metrics_config.cold_path_cache { "on" } else { "off" }
        );

        let metrics = Arc::new(MetricsService::new(
            Arc::clone(&storage),
            Dispatcher::new(metrics_config.subscription_buffer),
            metrics_config,
            cold_cache,
        ));

        Self {
            config,
            storage,
            metrics,
            shutdown,
            cache_gc: Mutex::new(cache_gc),
            started_at: Instant::now(),
        }
    }

    /// Fresh protocol state machine for one ingestion stream.
    pub fn save_protocol(&self) -> SaveProtocol {
        SaveProtocol::new(Arc::clone(&self.storage), Arc::clone(&self.metrics))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStorage> {
        self.storage.metadata()
    }

    pub fn metrics(&self) -> &Arc<MetricsService> {
        &self.metrics
    }

    /// Context for request work; cancelled when shutdown begins.
    pub fn request_context(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Cancels in-flight requests and subscriptions. Does not wait.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancels outstanding work, stops background tasks and waits for
    /// storage to release every saver and loader.
    pub async fn shutdown(&self) {
        self.begin_shutdown();

        let gc = self.cache_gc.lock().take();
        if let Some(gc) = gc {
            if let Err(e) = gc.await {
                tracing::warn!("Result cache GC task ended abnormally: {}", e);
            }
        }

        self.storage.quit().await;
        tracing::info!("Collector stopped after {:?}", self.uptime());
    }
}
