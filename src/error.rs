//! Error taxonomy for the ingest core.
//!
//! Nothing in here is fatal to the process: fetch and store errors abort the
//! current cycle only, per-item rejections never abort a batch.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single feed request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider returned HTTP {0}")]
    HttpStatus(u16),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Network(_) => "network",
            FetchError::Timeout(_) => "timeout",
            FetchError::HttpStatus(_) => "http_status",
        }
    }
}

/// Why one feed item was dropped by the normalizer.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash, serde::Serialize)]
pub enum NormalizeRejection {
    #[error("missing magnitude")]
    MissingMagnitude,
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("coordinate out of range")]
    CoordinateOutOfRange,
    #[error("unparsable timestamp")]
    UnparsableTimestamp,
    #[error("malformed item")]
    MalformedItem,
}

impl NormalizeRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizeRejection::MissingMagnitude => "missing_magnitude",
            NormalizeRejection::MissingTimestamp => "missing_timestamp",
            NormalizeRejection::CoordinateOutOfRange => "coordinate_out_of_range",
            NormalizeRejection::UnparsableTimestamp => "unparsable_timestamp",
            NormalizeRejection::MalformedItem => "malformed_item",
        }
    }
}

/// The payload as a whole could not be read; aborts the cycle.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unreadable payload: {0}")]
    UnreadablePayload(String),
}

/// Persistence failure surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failure during {context}: {message}")]
    IoFailure {
        context: &'static str,
        message: String,
    },

    #[error("store schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::IoFailure { .. } => "io_failure",
            StoreError::SchemaMismatch(_) => "schema_mismatch",
        }
    }

    pub(crate) fn io(context: &'static str, err: impl std::fmt::Display) -> Self {
        StoreError::IoFailure {
            context,
            message: err.to_string(),
        }
    }

    /// Decode/column errors mean the table is not what we expect.
    pub(crate) fn from_sqlx(context: &'static str, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnNotFound(col) => {
                StoreError::SchemaMismatch(format!("{context}: column `{col}` not found"))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                StoreError::SchemaMismatch(format!("{context}: column {index}: {source}"))
            }
            sqlx::Error::TypeNotFound { type_name } => {
                StoreError::SchemaMismatch(format!("{context}: type `{type_name}` not found"))
            }
            other => StoreError::io(context, other),
        }
    }
}
