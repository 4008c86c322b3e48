//! Error types for the migration pipeline and the local TSDB

use std::fmt;

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the migration pipeline
#[derive(Debug)]
pub enum Error {
    /// Network or HTTP transport failure reaching the source
    Transport(String),
    /// Unexpected status or response shape from the source
    Protocol {
        /// HTTP status, when the failure came from a response
        status: Option<u16>,
        /// What was wrong with the response
        message: String,
        /// Raw response body (lossy UTF-8, truncated)
        body: String,
    },
    /// Strict-mode ordering check failed on a fetched batch
    Validation(String),
    /// The destination engine rejected a sample
    EngineAppend(AppendError),
    /// The destination engine failed to commit a transaction
    EngineCommit(String),
    /// The destination engine could not be opened
    EngineOpen(String),
    /// Arrow-related errors
    Arrow(arrow::error::ArrowError),
    /// Parquet-related errors
    Parquet(parquet::errors::ParquetError),
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Internal error
    Internal(String),
}

/// Reasons the destination engine refuses a sample.
///
/// A stale series reference is not one of them: that case is reported as
/// [`AppendOutcome::StaleReference`](crate::tsdb::AppendOutcome) and handled
/// by the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendError {
    /// Sample is older than the newest sample already accepted for its series
    OutOfOrderSample { timestamp: i64, last_timestamp: i64 },
    /// Same timestamp as the newest sample, but a different value
    DuplicateSampleForTimestamp { timestamp: i64 },
    /// Sample falls into a range that has already been persisted as a block
    OutOfBounds { timestamp: i64, min_valid_time: i64 },
    /// Series has no labels
    EmptyLabelSet,
    /// Series carries the same label name more than once
    DuplicateLabelName { name: String },
}

impl fmt::Display for AppendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppendError::OutOfOrderSample {
                timestamp,
                last_timestamp,
            } => write!(
                f,
                "out of order sample: {} is before {}",
                timestamp, last_timestamp
            ),
            AppendError::DuplicateSampleForTimestamp { timestamp } => {
                write!(f, "duplicate sample for timestamp {}", timestamp)
            }
            AppendError::OutOfBounds {
                timestamp,
                min_valid_time,
            } => write!(
                f,
                "out of bounds: {} is before minimum valid time {}",
                timestamp, min_valid_time
            ),
            AppendError::EmptyLabelSet => write!(f, "empty label set"),
            AppendError::DuplicateLabelName { name } => {
                write!(f, "duplicate label name {:?}", name)
            }
        }
    }
}

impl Error {
    /// Whether this error came from reaching or decoding the source
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Protocol { .. } | Error::Validation(_)
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Arrow(e) => Some(e),
            Error::Parquet(e) => Some(e),
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::Protocol {
                status,
                message,
                body,
            } => {
                match status {
                    Some(status) => write!(f, "Protocol error (status {}): {}", status, message)?,
                    None => write!(f, "Protocol error: {}", message)?,
                }
                if !body.is_empty() {
                    write!(f, "\n{}", body)?;
                }
                Ok(())
            }
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::EngineAppend(e) => write!(f, "Append rejected: {}", e),
            Error::EngineCommit(msg) => write!(f, "Commit failed: {}", msg),
            Error::EngineOpen(msg) => write!(f, "Failed to open TSDB: {}", msg),
            Error::Arrow(e) => write!(f, "Arrow error: {}", e),
            Error::Parquet(e) => write!(f, "Parquet error: {}", e),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<AppendError> for Error {
    fn from(e: AppendError) -> Self {
        Error::EngineAppend(e)
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        Error::Arrow(e)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Error::Parquet(e)
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        // reqwest's Display omits the underlying cause (connection refused etc.)
        let mut msg = e.to_string();
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            msg.push_str(": ");
            msg.push_str(&cause.to_string());
            source = cause.source();
        }
        Error::Transport(msg)
    }
}
