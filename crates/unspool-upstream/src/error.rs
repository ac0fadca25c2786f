//! Error type for upstream queue clients.

use thiserror::Error;

/// Result alias for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Failures talking to an upstream application.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Configured base URL could not be parsed.
    #[error("invalid upstream url")]
    InvalidUrl {
        /// URL as configured.
        url: String,
        /// Parse failure.
        source: url::ParseError,
    },
    /// HTTP client construction failed.
    #[error("failed to build upstream http client")]
    Client {
        /// Underlying reqwest error.
        source: reqwest::Error,
    },
    /// Request could not be sent or the response body not read.
    #[error("upstream request failed")]
    Request {
        /// Operation being performed.
        operation: &'static str,
        /// URL requested.
        url: String,
        /// Underlying reqwest error.
        source: reqwest::Error,
    },
    /// Server answered with a non-success status.
    #[error("upstream returned an error status")]
    Status {
        /// URL requested.
        url: String,
        /// HTTP status code.
        status: u16,
    },
}
