//! Error types for rate limit configuration and shared-store access.
//!
//! Only configuration errors ever reach a caller. Store errors are produced by
//! [`SharedStore`](crate::store::SharedStore) implementations and absorbed by the
//! distributed bucket store, which turns them into a denied request.
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid or unreadable rate limit configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A capacity, refill amount or refill period was zero.
    #[error("{field} must be > 0 (got {value})")]
    NonPositive {
        /// Dotted path of the offending setting, e.g. `routes.orders.user.capacity`.
        field: String,
        /// Value provided by the configuration.
        value: u64,
    },
    /// The configuration document could not be parsed.
    #[error("invalid rate limit configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// The configuration file could not be read.
    #[error("failed to read rate limit configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn non_positive(field: impl Into<String>, value: u64) -> Self {
        ConfigError::NonPositive { field: field.into(), value }
    }
}

/// Failure talking to the shared store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Transport or server-side failure.
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    /// The round trip did not finish in time.
    #[error("shared store round trip exceeded {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Build an `Unavailable` error from anything displayable.
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        StoreError::Unavailable(err.to_string())
    }

    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
