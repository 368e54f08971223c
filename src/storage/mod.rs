//! Storage for profiling sessions.
//!
//! This module provides the storage interface, the metadata registry and
//! the two measurement backends:
//! - [`FilesystemStorage`]: one newline-delimited JSON file per session
//! - [`TimeseriesStorage`]: four labelled series per call-site in the
//!   embedded [`tsdb`] engine

pub mod backend;
pub mod codec;
pub mod filesystem;
pub mod lifecycle;
pub mod metadata;
pub mod timeseries;
pub mod tsdb;

pub use backend::{DataLoader, DataSaver, MeasurementStream, Storage};
pub use filesystem::FilesystemStorage;
pub use lifecycle::{Lifecycle, LifecycleGuard};
pub use metadata::{MetadataStorage, SqliteMetadataStorage};
pub use timeseries::TimeseriesStorage;

use crate::core::{Config, Result, StorageBackendKind};
use std::sync::Arc;

/// Builds the configured backend on top of `metadata`.
pub fn open_storage(config: &Config, metadata: Arc<dyn MetadataStorage>) -> Result<Arc<dyn Storage>> {
    let storage = &config.storage;
    let backend: Arc<dyn Storage> = match storage.backend {
        StorageBackendKind::Filesystem => Arc::new(FilesystemStorage::open(
            storage.data_dir.join("sessions"),
            storage.sync_write,
            metadata,
        )?),
        StorageBackendKind::Timeseries => Arc::new(TimeseriesStorage::open(
            &storage.data_dir.join("tsdb"),
            storage.sync_write,
            metadata,
        )?),
    };

    tracing::info!(
        "Storage backend {:?} ready at {}",
        storage.backend,
        storage.data_dir.display()
    );
    Ok(backend)
}
