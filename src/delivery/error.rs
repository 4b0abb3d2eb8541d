//! Error types for the delivery module.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while uploading artifacts or sending notices.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Transport failure talking to the delivery API.
    #[error("network error calling {method}: {source}")]
    Network {
        /// Bot API method that was called.
        method: &'static str,
        /// The underlying transport error, stripped of the request URL.
        #[source]
        source: reqwest::Error,
    },

    /// The request timed out before a response arrived.
    #[error("timeout calling {method}")]
    Timeout {
        /// Bot API method that was called.
        method: &'static str,
    },

    /// The API answered with a non-success status or `ok: false`.
    #[error("{method} rejected with HTTP {status}: {description}")]
    Api {
        /// Bot API method that was called.
        method: &'static str,
        /// HTTP status code of the response.
        status: u16,
        /// Human-readable description returned by the API.
        description: String,
        /// Wait requested by the API before the next call (`parameters.retry_after`).
        retry_after: Option<Duration>,
    },

    /// The API answered with a body that could not be interpreted.
    #[error("malformed {method} response: {reason}")]
    Malformed {
        /// Bot API method that was called.
        method: &'static str,
        /// What was wrong with the body.
        reason: String,
    },

    /// A local part could not be read for upload.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// File that failed to read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build delivery HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl DeliveryError {
    /// Creates a transport error, promoting timeouts to [`DeliveryError::Timeout`].
    ///
    /// The request URL carries the bot token, so it is dropped from `source`.
    pub fn transport(method: &'static str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { method }
        } else {
            Self::Network {
                method,
                source: source.without_url(),
            }
        }
    }

    /// Creates an API rejection error.
    pub fn api(method: &'static str, status: u16, description: impl Into<String>) -> Self {
        Self::api_with_retry_after(method, status, description, None)
    }

    /// Creates an API rejection error carrying the API's requested wait.
    pub fn api_with_retry_after(
        method: &'static str,
        status: u16,
        description: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::Api {
            method,
            status,
            description: description.into(),
            retry_after,
        }
    }

    /// Creates a malformed-response error.
    pub fn malformed(method: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            method,
            reason: reason.into(),
        }
    }

    /// Wait the API asked for before retrying, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
