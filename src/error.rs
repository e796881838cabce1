use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::retry::Retryable;
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, AggregatorError>;

/// How a failure is handled by the merge loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff, then leave for redelivery
    Transient,
    /// Retrying cannot help; dead-letter and acknowledge
    Malformed,
    /// Lock not acquired in time; retry, then leave for redelivery
    Lock,
    /// Stop the process
    Fatal,
}

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Malformed work item: {0}")]
    MalformedWorkItem(String),

    #[error("Process record not found: {0}")]
    RecordNotFound(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid object name in work item: {0}")]
    InvalidObjectName(String),

    /// The object exists but reading it fails in a way retries cannot fix
    #[error("Object {name} cannot be read: {message}")]
    UnreadableObject { name: String, message: String },

    #[error("Corrupt process record {process_uuid}: {message}")]
    CorruptRecord {
        process_uuid: String,
        message: String,
    },

    #[error("Lock '{name}' not acquired within {waited:?}")]
    LockTimeout { name: String, waited: Duration },

    #[error("Reducer task failed: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl AggregatorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Storage(e) if e.is_retryable() => ErrorClass::Transient,
            Self::Storage(e) if e.is_not_found() || e.is_invalid_name() => ErrorClass::Malformed,
            // Remaining permanent backend failures (encoding, configuration)
            // are not tied to one message
            Self::Storage(_) => ErrorClass::Fatal,
            Self::MalformedWorkItem(_)
            | Self::RecordNotFound(_)
            | Self::ObjectNotFound(_)
            | Self::InvalidObjectName(_)
            | Self::UnreadableObject { .. }
            | Self::CorruptRecord { .. } => ErrorClass::Malformed,
            Self::LockTimeout { .. } => ErrorClass::Lock,
            Self::Task(_) => ErrorClass::Transient,
            Self::Config(_) => ErrorClass::Fatal,
        }
    }
}

impl Retryable for AggregatorError {
    fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Lock)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {message}")]
    Env { var: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let transient = AggregatorError::from(StorageError::connection("reset"));
        assert_eq!(transient.class(), ErrorClass::Transient);
        assert!(transient.is_retryable());

        let missing = AggregatorError::from(StorageError::not_found("bucket/a.txt"));
        assert_eq!(missing.class(), ErrorClass::Malformed);

        let lock = AggregatorError::LockTimeout {
            name: "trc-lock:p".into(),
            waited: Duration::from_secs(5),
        };
        assert_eq!(lock.class(), ErrorClass::Lock);
        assert!(lock.is_retryable());

        let bad = AggregatorError::MalformedWorkItem("expected value".into());
        assert_eq!(bad.class(), ErrorClass::Malformed);
        assert!(!bad.is_retryable());

        let escape = AggregatorError::from(StorageError::invalid_name("../x"));
        assert_eq!(escape.class(), ErrorClass::Malformed);
        let unreadable = AggregatorError::UnreadableObject {
            name: "bucket/a.txt".into(),
            message: "permission denied".into(),
        };
        assert_eq!(unreadable.class(), ErrorClass::Malformed);

        let config = AggregatorError::from(ConfigError::Invalid("zero".into()));
        assert_eq!(config.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_lock_timeout_message() {
        let err = AggregatorError::LockTimeout {
            name: "trc-mutex".into(),
            waited: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Lock 'trc-mutex' not acquired within 250ms");
    }
}
