use thiserror::Error;

/// Violations of the save protocol state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected call {method} in state {state}")]
    UnexpectedCall {
        method: &'static str,
        state: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum HeapwatchError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Data integrity error: {0}")]
    Integrity(String),

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias for heapwatch operations
pub type Result<T> = std::result::Result<T, HeapwatchError>;

impl HeapwatchError {
    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new data integrity error
    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        Self::Integrity(msg.into())
    }

    /// Creates a new computation error
    pub fn computation<S: Into<String>>(msg: S) -> Self {
        Self::Computation(msg.into())
    }

    /// Creates a new codec error
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Returns true if the error only concerns a single record, so a replay may
    /// skip it and carry on.
    pub fn is_record_level(&self) -> bool {
        matches!(self, Self::Codec(_))
    }

    /// Returns true if the operation was asked to stop rather than failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Storage(_) | Self::Database(_) | Self::Integrity(_) | Self::Io(_) => "storage",
            Self::Computation(_) | Self::Codec(_) | Self::Serialization(_) => "computation",
            Self::Cancelled => "cancellation",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::InvalidDescription(_) => "validation",
            Self::Join(_) => "async",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = HeapwatchError::storage("disk full");
        assert_eq!(err.to_string(), "Storage error: disk full");
        assert_eq!(err.category(), "storage");
    }

    #[test]
    fn test_protocol_error_message() {
        let err: HeapwatchError = ProtocolError::UnexpectedCall {
            method: "add_measurement",
            state: "await_description",
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Protocol error: unexpected call add_measurement in state await_description"
        );
        assert_eq!(err.category(), "protocol");
    }

    #[test]
    fn test_cancellation_is_distinct_from_storage() {
        assert!(HeapwatchError::Cancelled.is_cancellation());
        assert_eq!(HeapwatchError::Cancelled.category(), "cancellation");
        assert!(!HeapwatchError::storage("io").is_cancellation());
    }

    #[test]
    fn test_record_level_errors() {
        assert!(HeapwatchError::codec("bad json").is_record_level());
        assert!(!HeapwatchError::integrity("timestamp mismatch").is_record_level());
    }
}
