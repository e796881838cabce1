//! Error types for the collaborator backends

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for backend operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure reported by an object store, queue or keyed store
///
/// Queue and store failures are usually transient; `is_retryable` is the
/// single place that decides which ones the retry executor may repeat.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record, work item or dead letter failed to encode or decode
    #[error("Encoding error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),

    /// The lock was lost or could not be verified
    #[error("Lock error: {0}")]
    Lock(String),

    /// Missing object, container or key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another holder owns the lock
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The object name cannot address anything in a container
    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Invalid backend configuration: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// A bounded wait ran out, carrying how long was waited
    #[error("Gave up after waiting {0:?}")]
    Timeout(Duration),
}

impl StorageError {
    pub fn serialization(err: impl fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }

    pub fn backend(err: impl fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn lock(msg: impl fmt::Display) -> Self {
        Self::Lock(msg.to_string())
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn conflict(msg: impl fmt::Display) -> Self {
        Self::Conflict(msg.to_string())
    }

    pub fn unavailable(msg: impl fmt::Display) -> Self {
        Self::Unavailable(msg.to_string())
    }

    pub fn invalid_name(name: impl fmt::Display) -> Self {
        Self::InvalidName(name.to_string())
    }

    pub fn configuration(msg: impl fmt::Display) -> Self {
        Self::Configuration(msg.to_string())
    }

    pub fn connection(msg: impl fmt::Display) -> Self {
        Self::Connection(msg.to_string())
    }

    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() != std::io::ErrorKind::NotFound,
            Self::Backend(_)
            | Self::Lock(_)
            | Self::Unavailable(_)
            | Self::Connection(_)
            | Self::Timeout(_) => true,
            Self::Serialization(_)
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::InvalidName(_)
            | Self::Configuration(_) => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_invalid_name(&self) -> bool {
        matches!(self, Self::InvalidName(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::unavailable(err)
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::connection(err)
        } else {
            Self::backend(format!("Redis: {}", err))
        }
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::PoolError> for StorageError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::connection(format!("Redis pool: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StorageError::connection("refused").is_retryable());
        assert!(StorageError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(StorageError::backend("READONLY").is_retryable());
        assert!(!StorageError::serialization("bad json").is_retryable());
        assert!(!StorageError::not_found("p-1").is_retryable());
        assert!(!StorageError::conflict("held").is_retryable());
        assert!(!StorageError::invalid_name("../x").is_retryable());
    }

    #[test]
    fn test_io_not_found_is_final() {
        let err = StorageError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = StorageError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_serde_json_error_converts_to_serialization() {
        let err: StorageError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
