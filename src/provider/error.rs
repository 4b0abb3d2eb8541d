//! Error types for the remote provider client.
//!
//! Variants split into two families: request-level failures (transport,
//! status, malformed body) and staging-operation failures reported by the
//! provider's asynchronous operation endpoint.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the remote resource provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP status from the provider.
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// Response body did not have the expected shape.
    #[error("malformed response from {url}: {reason}")]
    Malformed {
        /// The URL whose response could not be interpreted.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A URL could not be built or parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
    },

    /// The provider reported a terminal failure for a staging operation.
    #[error("provider operation {operation} failed")]
    OperationFailed {
        /// Operation identifier (last segment of the status URL).
        operation: String,
    },

    /// A staging operation did not finish before the polling deadline.
    #[error("provider operation {operation} still in progress after {}s", waited.as_secs())]
    OperationTimedOut {
        /// Operation identifier (last segment of the status URL).
        operation: String,
        /// How long the client waited.
        waited: Duration,
    },

    /// Local file system error while writing a download.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build provider HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ProviderError {
    /// Creates a transport error, promoting timeouts to [`ProviderError::Timeout`].
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { url: url.into() }
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a malformed-response error.
    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for terminal failures of asynchronous staging operations.
    #[must_use]
    pub fn is_operation_failure(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed { .. } | Self::OperationTimedOut { .. }
        )
    }
}
