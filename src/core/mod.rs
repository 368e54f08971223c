//! Core domain models for heapwatch.
//!
//! This module contains the fundamental types shared by the save protocol,
//! the storage backends and the metrics engine.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigBuilder, StorageBackendKind};
pub use error::{HeapwatchError, ProtocolError, Result};
pub use types::{
    CallStack, CallStackId, HeapConsumptionRates, InstanceDescription, Location, LocationMetrics,
    Measurement, MemoryUsage, SessionDescription, SessionInfo, SessionMetadata, SessionMetrics,
    StackFrame,
};
