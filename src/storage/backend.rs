//! Storage backend traits.

use super::metadata::MetadataStorage;
use crate::core::{InstanceDescription, Measurement, Result, SessionDescription};
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stream of measurements replayed from storage, in stored order.
pub type MeasurementStream<'a> = BoxStream<'a, Result<Measurement>>;

/// Trait for storage backend implementations.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Registers a new session for `instance` and opens a writer for it.
    ///
    /// If the backend cannot allocate its resource after the session was
    /// registered, the session is stopped again before the error is returned.
    async fn new_data_saver(&self, instance: &InstanceDescription) -> Result<Box<dyn DataSaver>>;

    /// Opens a reader over the stored measurements of `session`.
    async fn new_data_loader(&self, session: &SessionDescription) -> Result<Box<dyn DataLoader>>;

    /// Metadata store shared by this backend.
    fn metadata(&self) -> Arc<dyn MetadataStorage>;

    /// Refuses new savers and loaders, then waits for the live ones to close.
    async fn quit(&self);
}

/// Writer bound to exactly one session.
#[async_trait::async_trait]
pub trait DataSaver: Send {
    fn session(&self) -> &SessionDescription;

    /// Durably appends one measurement.
    async fn save(&mut self, measurement: &Measurement) -> Result<()>;

    /// Marks the session finished and releases the backend resource.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Reader bound to exactly one session.
#[async_trait::async_trait]
pub trait DataLoader: Send {
    fn session(&self) -> &SessionDescription;

    /// Streams the stored measurements. Once `ctx` is cancelled the stream
    /// yields a single [`HeapwatchError::Cancelled`](crate::core::HeapwatchError::Cancelled)
    /// and ends.
    fn load(&mut self, ctx: CancellationToken) -> MeasurementStream<'_>;

    async fn close(self: Box<Self>) -> Result<()>;
}
