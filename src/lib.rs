//! heapwatch - memory profiling telemetry collector.
//!
//! Profiled processes stream periodic heap snapshots grouped by call stack.
//! heapwatch persists every session and turns each one into per call-site
//! heap consumption rates, live or replayed from storage.
//!
//! # Architecture
//!
//! - `protocol`: save protocol state machine of one ingestion stream
//! - `metrics`: rolling-window regression of heap counters per call-site
//! - `storage`: filesystem and time-series backends plus the SQLite metadata store
//! - `server`: collector wiring and the HTTP surface
//! - `core`: domain types, errors and configuration
//! - `cli`: command-line interface
//!
//! # Example
//!
//! ```no_run
//! use heapwatch_lib::core::Config;
//! use heapwatch_lib::server::Collector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let collector = Collector::start(Config::default()).await?;
//!     let protocol = collector.save_protocol();
//!     assert_eq!(protocol.state_name(), "await_description");
//!     collector.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cli;
pub mod core;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod storage;

pub use crate::core::{Config, HeapwatchError, Result};
