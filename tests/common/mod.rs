//! Common test utilities and fixtures.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use heapwatch_lib::core::{
    CallStack, Config, ConfigBuilder, InstanceDescription, Location, Measurement, MemoryUsage,
    StackFrame, StorageBackendKind,
};
use std::path::Path;

/// Fixed epoch so expected rates are exact.
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(seconds)
}

pub fn instance(service: &str, name: &str) -> InstanceDescription {
    InstanceDescription::new(service, name).unwrap()
}

pub fn call_stack(function: &str, line: i32) -> CallStack {
    CallStack::new(vec![
        StackFrame::new(function, "alloc.go", line),
        StackFrame::new("main.main", "main.go", 12),
    ])
}

/// Test fixture builder for measurements with linearly growing counters.
pub struct MeasurementBuilder {
    observed_at: DateTime<Utc>,
    locations: Vec<Location>,
}

impl MeasurementBuilder {
    pub fn at(seconds: i64) -> Self {
        Self {
            observed_at: at(seconds),
            locations: Vec::new(),
        }
    }

    /// Adds a site whose counters grow by the given amounts per second.
    pub fn growing(mut self, function: &str, alloc_bytes_per_sec: i64, free_bytes_per_sec: i64) -> Self {
        let elapsed = (self.observed_at - at(0)).num_seconds();
        self.locations.push(Location {
            call_stack: call_stack(function, 10),
            memory_usage: MemoryUsage {
                alloc_objects: elapsed,
                alloc_bytes: elapsed * alloc_bytes_per_sec,
                free_objects: 0,
                free_bytes: elapsed * free_bytes_per_sec,
            },
        });
        self
    }

    pub fn location(mut self, call_stack: CallStack, usage: MemoryUsage) -> Self {
        self.locations.push(Location {
            call_stack,
            memory_usage: usage,
        });
        self
    }

    pub fn build(self) -> Measurement {
        Measurement {
            observed_at: self.observed_at,
            locations: self.locations,
        }
    }
}

/// A leaking site and a steady site sampled once per second.
pub fn leak_series(points: i64) -> Vec<Measurement> {
    (0..points)
        .map(|t| {
            MeasurementBuilder::at(t)
                .growing("cache.Put", 4096, 0)
                .growing("buf.Reset", 1024, 1024)
                .build()
        })
        .collect()
}

pub fn config(dir: &Path, backend: StorageBackendKind) -> Config {
    ConfigBuilder::new()
        .data_dir(dir.to_path_buf())
        .backend(backend)
        .build()
        .unwrap()
}

pub const BACKENDS: [StorageBackendKind; 2] = [StorageBackendKind::Filesystem, StorageBackendKind::Timeseries];
