//! Record codecs shared by the storage backends.
//!
//! Two encodings live here:
//! - newline-delimited JSON records for the filesystem backend
//! - label sets and sample values for the time-series backend

use crate::core::{CallStack, HeapwatchError, Location, Measurement, MemoryUsage, Result, SessionDescription};
use crate::storage::tsdb::{Labels, Matcher};

pub const LABEL_SESSION: &str = "session";
pub const LABEL_CALLSTACK_ID: &str = "callstack_id";
pub const LABEL_META: &str = "meta";
pub const LABEL_METRIC_TYPE: &str = "metric_type";

/// Serializes a measurement as one JSON line, delimiter included.
pub fn encode_record(measurement: &Measurement, buf: &mut Vec<u8>) -> Result<()> {
    serde_json::to_writer(&mut *buf, measurement)?;
    buf.push(b'\n');
    Ok(())
}

/// Parses one JSON line from raw bytes. Invalid UTF-8 and malformed JSON are
/// both record-level failures that readers may skip.
pub fn decode_record(line: &[u8]) -> Result<Measurement> {
    let line = std::str::from_utf8(line)
        .map_err(|e| HeapwatchError::codec(format!("measurement record is not UTF-8: {e}")))?;
    serde_json::from_str(line).map_err(|e| HeapwatchError::codec(format!("malformed measurement record: {e}")))
}

/// The four stored counters of a call-site, one series each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoredMetric {
    AllocBytes,
    AllocObjects,
    FreeBytes,
    FreeObjects,
}

impl StoredMetric {
    pub const ALL: [StoredMetric; 4] = [
        StoredMetric::AllocBytes,
        StoredMetric::AllocObjects,
        StoredMetric::FreeBytes,
        StoredMetric::FreeObjects,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StoredMetric::AllocBytes => "alloc_bytes",
            StoredMetric::AllocObjects => "alloc_objects",
            StoredMetric::FreeBytes => "free_bytes",
            StoredMetric::FreeObjects => "free_objects",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }

    pub fn read(self, usage: &MemoryUsage) -> i64 {
        match self {
            StoredMetric::AllocBytes => usage.alloc_bytes,
            StoredMetric::AllocObjects => usage.alloc_objects,
            StoredMetric::FreeBytes => usage.free_bytes,
            StoredMetric::FreeObjects => usage.free_objects,
        }
    }

    pub fn write(self, usage: &mut MemoryUsage, value: i64) {
        match self {
            StoredMetric::AllocBytes => usage.alloc_bytes = value,
            StoredMetric::AllocObjects => usage.alloc_objects = value,
            StoredMetric::FreeBytes => usage.free_bytes = value,
            StoredMetric::FreeObjects => usage.free_objects = value,
        }
    }
}

/// Matcher selecting every series of a session
pub fn session_matcher(session: &SessionDescription) -> Matcher {
    Matcher::equal(LABEL_SESSION, session.key())
}

/// Largest counter magnitude an `f64` sample holds exactly (2^53).
pub const MAX_EXACT_COUNTER: i64 = 1 << 53;

/// Expands one location into its four labelled values.
///
/// Samples are `f64`, so counters beyond [`MAX_EXACT_COUNTER`] in magnitude
/// would not read back unchanged. Such locations are rejected.
pub fn encode_location(session: &SessionDescription, location: &Location) -> Result<Vec<(Labels, f64)>> {
    for metric in StoredMetric::ALL {
        let value = metric.read(&location.memory_usage);
        if value.unsigned_abs() > MAX_EXACT_COUNTER as u64 {
            return Err(HeapwatchError::codec(format!(
                "{} counter {} exceeds the exactly storable range",
                metric.as_str(),
                value
            )));
        }
    }

    let meta = serde_json::to_string(&location.call_stack)?;
    let base = Labels::new()
        .with(LABEL_SESSION, session.key())
        .with(LABEL_CALLSTACK_ID, location.call_stack.id().as_str())
        .with(LABEL_META, meta);

    Ok(StoredMetric::ALL
        .into_iter()
        .map(|metric| {
            let labels = base.clone().with(LABEL_METRIC_TYPE, metric.as_str());
            (labels, metric.read(&location.memory_usage) as f64)
        })
        .collect())
}

pub fn decode_call_stack(labels: &Labels) -> Result<CallStack> {
    let meta = labels
        .get(LABEL_META)
        .ok_or_else(|| HeapwatchError::integrity(format!("series without {LABEL_META} label")))?;
    serde_json::from_str(meta).map_err(|e| HeapwatchError::integrity(format!("corrupt call stack label: {e}")))
}

pub fn decode_metric(labels: &Labels) -> Result<StoredMetric> {
    labels
        .get(LABEL_METRIC_TYPE)
        .and_then(StoredMetric::parse)
        .ok_or_else(|| HeapwatchError::integrity(format!("series with missing or unknown {LABEL_METRIC_TYPE}")))
}

/// Stored values are whole counters written from `i64`.
pub fn decode_value(value: f64) -> i64 {
    value.round() as i64
}
