use crate::core::error::{HeapwatchError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifies a distinct running process of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceDescription {
    /// Name of the profiled service
    pub service_name: String,
    /// Name of this particular process of the service
    pub instance_name: String,
}

impl InstanceDescription {
    /// Creates a new instance description after validation
    pub fn new<S: Into<String>, I: Into<String>>(service_name: S, instance_name: I) -> Result<Self> {
        let description = InstanceDescription {
            service_name: service_name.into(),
            instance_name: instance_name.into(),
        };
        description.validate()?;
        Ok(description)
    }

    /// Checks that both names are present and of sane length
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("service_name", &self.service_name),
            ("instance_name", &self.instance_name),
        ];
        for (field, value) in fields {
            if value.is_empty() {
                return Err(HeapwatchError::InvalidDescription(format!("{field} cannot be empty")));
            }
            if value.len() > 255 {
                return Err(HeapwatchError::InvalidDescription(format!(
                    "{field} cannot exceed 255 characters"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for InstanceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.service_name, self.instance_name)
    }
}

/// Identifies one measurement streaming session of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Instance that streamed the session
    pub instance: InstanceDescription,
    /// Session identifier assigned by the metadata store
    pub session_id: i64,
}

impl SessionDescription {
    pub fn new(instance: InstanceDescription, session_id: i64) -> Self {
        Self { instance, session_id }
    }

    /// Composite identity string `service::instance::session_id`
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.instance, self.session_id)
    }
}

/// Lifetime bounds of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionMetadata {
    /// Returns true while the session has not been stopped
    pub fn is_active(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// Session description together with its metadata, as listed by discovery queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub description: SessionDescription,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub name: String,
    pub file: String,
    pub line: i32,
}

impl StackFrame {
    pub fn new<N: Into<String>, F: Into<String>>(name: N, file: F, line: i32) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            line,
        }
    }
}

/// Stable digest of a call stack, used as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallStackId(String);

impl CallStackId {
    /// Wraps an already computed digest
    pub fn from_digest(digest: String) -> Self {
        CallStackId(digest)
    }

    /// Returns the hex representation of the digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallStackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered sequence of frames, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CallStack {
    pub frames: Vec<StackFrame>,
}

impl CallStack {
    pub fn new(frames: Vec<StackFrame>) -> Self {
        Self { frames }
    }

    /// Content digest over `name:file:line` of every frame. Identical frame
    /// sequences hash identically regardless of the reporting process.
    pub fn id(&self) -> CallStackId {
        let mut hasher = Sha256::new();
        for frame in &self.frames {
            hasher.update(frame.name.as_bytes());
            hasher.update(b":");
            hasher.update(frame.file.as_bytes());
            hasher.update(b":");
            hasher.update(frame.line.to_string().as_bytes());
            hasher.update(b"\n");
        }
        CallStackId(hex::encode(hasher.finalize()))
    }
}

/// Cumulative allocation counters since process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub alloc_objects: i64,
    pub alloc_bytes: i64,
    pub free_objects: i64,
    pub free_bytes: i64,
}

impl MemoryUsage {
    pub fn in_use_objects(&self) -> i64 {
        self.alloc_objects - self.free_objects
    }

    pub fn in_use_bytes(&self) -> i64 {
        self.alloc_bytes - self.free_bytes
    }
}

/// Snapshot of one call-site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub call_stack: CallStack,
    pub memory_usage: MemoryUsage,
}

/// One heap sample taken at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub locations: Vec<Location>,
}

/// First time-derivative (units per second) of every heap counter.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeapConsumptionRates {
    pub alloc_objects_rate: f64,
    pub alloc_bytes_rate: f64,
    pub free_objects_rate: f64,
    pub free_bytes_rate: f64,
    pub in_use_objects_rate: f64,
    pub in_use_bytes_rate: f64,
}

impl HeapConsumptionRates {
    /// Replaces NaN and infinite rates with zero
    pub fn sanitized(self) -> Self {
        let clean = |v: f64| if v.is_finite() { v } else { 0.0 };
        Self {
            alloc_objects_rate: clean(self.alloc_objects_rate),
            alloc_bytes_rate: clean(self.alloc_bytes_rate),
            free_objects_rate: clean(self.free_objects_rate),
            free_bytes_rate: clean(self.free_bytes_rate),
            in_use_objects_rate: clean(self.in_use_objects_rate),
            in_use_bytes_rate: clean(self.in_use_bytes_rate),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationMetrics {
    pub call_stack: CallStack,
    pub rates: HeapConsumptionRates,
}

/// Computed consumption rates of every call-site of a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub locations: Vec<LocationMetrics>,
}

impl SessionMetrics {
    /// Orders call-sites by in-use bytes rate, fastest growing first.
    pub fn sort_by_in_use_bytes_rate(&mut self) {
        self.locations
            .sort_by(|a, b| b.rates.in_use_bytes_rate.total_cmp(&a.rates.in_use_bytes_rate));
    }

    /// Copy with every non-finite rate replaced by zero, suitable for JSON.
    pub fn sanitized(&self) -> Self {
        Self {
            locations: self
                .locations
                .iter()
                .map(|l| LocationMetrics {
                    call_stack: l.call_stack.clone(),
                    rates: l.rates.sanitized(),
                })
                .collect(),
        }
    }

    /// Rough heap footprint, used to bound caches
    pub fn approx_size(&self) -> usize {
        let frames: usize = self
            .locations
            .iter()
            .flat_map(|l| l.call_stack.frames.iter())
            .map(|f| std::mem::size_of::<StackFrame>() + f.name.len() + f.file.len())
            .sum();
        std::mem::size_of::<Self>() + self.locations.len() * std::mem::size_of::<LocationMetrics>() + frames
    }
}

/// Converts a timestamp to nanoseconds since the Unix epoch.
pub fn to_unix_nanos(ts: DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| HeapwatchError::codec(format!("timestamp {ts} out of range")))
}

/// Converts nanoseconds since the Unix epoch back to a timestamp.
pub fn from_unix_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}
