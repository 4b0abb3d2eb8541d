//! Worker-level error type.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::cache::CacheError;
use crate::delivery::DeliveryError;
use crate::provider::{ProviderError, parse_retry_after};
use crate::stats::StatsError;

/// Everything that can end the processing of one request.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The remote provider failed or rejected a call.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The cache could not be updated.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Archiving or splitting the download failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Uploading parts or notifying the requester failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The statistics record could not be written.
    #[error(transparent)]
    Stats(#[from] StatsError),

    /// Local work directory management failed.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The directory or file involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The requested path names a directory, which cannot be sent.
    #[error("{path} is a directory, only files can be requested")]
    NotAFile {
        /// The requested path.
        path: String,
    },

    /// A blocking archive task panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl RelayError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Server-requested delay before the next attempt, if the provider or the
    /// delivery API sent one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider(ProviderError::HttpStatus {
                retry_after: Some(value),
                ..
            }) => parse_retry_after(value),
            Self::Delivery(delivery) => delivery.retry_after(),
            _ => None,
        }
    }
}
