//! Save protocol of one ingestion stream.
//!
//! A stream first describes the instance it comes from, then sends any
//! number of measurements, then closes. [`SaveProtocol`] enforces that order
//! as an explicit state machine:
//!
//! ```text
//! AwaitDescription --add_description--> AwaitMeasurement --close--> Finished
//!        |                                   |      ^
//!        +-------- any other call ----+      +------+ add_measurement
//!                                     v
//!                                  Finished
//! ```
//!
//! Any call that is not valid in the current state fails with
//! [`ProtocolError::UnexpectedCall`] and moves the machine to `Finished`.
//! The storage handle acquired by `add_description` is released exactly once,
//! whichever way the stream ends.

use crate::core::{HeapwatchError, InstanceDescription, Measurement, ProtocolError, Result, SessionDescription};
use crate::metrics::MetricsService;
use crate::storage::{DataSaver, Storage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One message of an ingestion stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveRequest {
    Description(InstanceDescription),
    Measurement(Measurement),
}

enum ProtocolState {
    AwaitDescription,
    AwaitMeasurement(Box<dyn DataSaver>),
    Finished,
}

impl ProtocolState {
    fn name(&self) -> &'static str {
        match self {
            ProtocolState::AwaitDescription => "await_description",
            ProtocolState::AwaitMeasurement(_) => "await_measurement",
            ProtocolState::Finished => "finished",
        }
    }
}

/// Per-stream state machine binding a saver and the metrics engine.
pub struct SaveProtocol {
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsService>,
    state: ProtocolState,
    session: Option<SessionDescription>,
    measurements: u64,
}

impl SaveProtocol {
    pub fn new(storage: Arc<dyn Storage>, metrics: Arc<MetricsService>) -> Self {
        Self {
            storage,
            metrics,
            state: ProtocolState::AwaitDescription,
            session: None,
            measurements: 0,
        }
    }

    /// Name of the current state, for logs and errors
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Session bound by `add_description`, if any
    pub fn session(&self) -> Option<&SessionDescription> {
        self.session.as_ref()
    }

    pub fn measurement_count(&self) -> u64 {
        self.measurements
    }

    /// Dispatches one stream message to the matching call.
    pub async fn handle(&mut self, request: SaveRequest) -> Result<()> {
        match request {
            SaveRequest::Description(instance) => self.add_description(&instance).await.map(|_| ()),
            SaveRequest::Measurement(measurement) => self.add_measurement(&measurement).await,
        }
    }

    /// Opens a session for `instance`. Only valid as the first call.
    pub async fn add_description(&mut self, instance: &InstanceDescription) -> Result<SessionDescription> {
        let state = std::mem::replace(&mut self.state, ProtocolState::Finished);
        if !matches!(state, ProtocolState::AwaitDescription) {
            return Err(violation("add_description", state).await);
        }

        instance.validate()?;
        let saver = self.storage.new_data_saver(instance).await?;
        let session = saver.session().clone();
        tracing::info!("Session {} started", session);
        self.session = Some(session.clone());
        self.state = ProtocolState::AwaitMeasurement(saver);
        Ok(session)
    }

    /// Persists the measurement, then feeds it to the metrics engine.
    /// The first failure is returned and the second step is skipped.
    pub async fn add_measurement(&mut self, measurement: &Measurement) -> Result<()> {
        let saver = match &mut self.state {
            ProtocolState::AwaitMeasurement(saver) => saver,
            _ => {
                let state = std::mem::replace(&mut self.state, ProtocolState::Finished);
                return Err(violation("add_measurement", state).await);
            }
        };

        saver.save(measurement).await?;
        let session = saver.session().clone();
        self.metrics.put_measurement(&session, measurement).await?;
        self.measurements += 1;
        Ok(())
    }

    /// Releases the saver if one is held. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, ProtocolState::Finished) {
            ProtocolState::AwaitMeasurement(saver) => {
                let session = saver.session().clone();
                saver.close().await?;
                tracing::info!("Session {} closed after {} measurements", session, self.measurements);
                Ok(())
            }
            ProtocolState::AwaitDescription | ProtocolState::Finished => Ok(()),
        }
    }
}

/// Builds the error for an out-of-order call and releases whatever the
/// abandoned state held.
async fn violation(method: &'static str, state: ProtocolState) -> HeapwatchError {
    let error = ProtocolError::UnexpectedCall {
        method,
        state: state.name(),
    };
    tracing::warn!("Save protocol violation: {}", error);
    if let ProtocolState::AwaitMeasurement(saver) = state {
        release(saver).await;
    }
    error.into()
}

async fn release(saver: Box<dyn DataSaver>) {
    let session = saver.session().clone();
    if let Err(e) = saver.close().await {
        tracing::error!("Failed to release saver of session {}: {}", session, e);
    }
}

impl Drop for SaveProtocol {
    fn drop(&mut self) {
        let ProtocolState::AwaitMeasurement(saver) =
            std::mem::replace(&mut self.state, ProtocolState::Finished)
        else {
            return;
        };
        tracing::warn!("Save protocol dropped without close; releasing {}", saver.session());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release(saver));
            }
            Err(_) => tracing::error!("No runtime to release saver of {}", saver.session()),
        }
    }
}

#[cfg(test)]
mod tests;
