//! Aggregator error types.
//!
//! [`AggregatorError`] covers consuming, persistence, fan-out, archival,
//! and the HTTP surface. A `From` conversion into [`OpsentraError`] lets
//! callers propagate with `?` across crate boundaries.

use opsentra_core::error::{OpsentraError, PipelineError};

/// Aggregator domain error.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// Broker connection failed.
    #[error("broker connect error: {0}")]
    Connect(String),

    /// Consuming from a queue failed.
    #[error("consume error: queue '{queue}': {reason}")]
    Consume {
        /// Queue the consumer was attached to.
        queue: String,
        /// Failure reason.
        reason: String,
    },

    /// A broker message could not be decoded.
    #[error("decode error: queue '{queue}': {reason}")]
    Decode {
        /// Queue the message arrived on.
        queue: String,
        /// Failure reason.
        reason: String,
    },

    /// Reconnect attempts exhausted.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Time-series store operation failed.
    #[error("store error: {operation}: {reason}")]
    Store {
        /// Operation that failed (connect, insert, update, query).
        operation: String,
        /// Failure reason.
        reason: String,
    },

    /// Archival operation failed.
    #[error("archive error: {operation}: {reason}")]
    Archive {
        /// Operation that failed (query, compress, upload, mark).
        operation: String,
        /// Failure reason.
        reason: String,
    },

    /// HTTP surface failure.
    #[error("api error: {0}")]
    Api(String),

    /// Configuration error.
    #[error("config error: {field}: {reason}")]
    Config {
        /// Offending configuration field.
        field: String,
        /// Failure reason.
        reason: String,
    },

    /// Channel communication error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AggregatorError {
    /// Shorthand for store errors.
    pub fn store(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for archive errors.
    pub fn archive(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Archive {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<AggregatorError> for OpsentraError {
    fn from(err: AggregatorError) -> Self {
        match err {
            AggregatorError::Connect(reason) => {
                OpsentraError::Broker(opsentra_core::error::BrokerError::Connection(reason))
            }
            AggregatorError::ReconnectExhausted { attempts } => OpsentraError::Broker(
                opsentra_core::error::BrokerError::ReconnectExhausted { attempts },
            ),
            AggregatorError::Store { operation, reason } => OpsentraError::Storage(
                opsentra_core::error::StorageError::Query(format!("{operation}: {reason}")),
            ),
            AggregatorError::Archive { operation, reason } => OpsentraError::Archive(
                opsentra_core::error::ArchiveError::Mark(format!("{operation}: {reason}")),
            ),
            other => OpsentraError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}
