//! # Design
//!
//! - Centralize application-level errors for bootstrap and orchestration.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Only startup failures become errors; runtime failures are messages.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration could not be loaded or validated.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: unspool_config::ConfigError,
    },
    /// Telemetry could not be initialised.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: unspool_telemetry::TelemetryError,
    },
    /// Filesystem watcher could not be created or attached.
    #[error("folder watcher operation failed")]
    Watcher {
        /// Operation identifier.
        operation: &'static str,
        /// Watch root involved, when known.
        path: Option<PathBuf>,
        /// Source notify error.
        source: notify::Error,
    },
    /// The HTTP client for webhooks could not be built.
    #[error("webhook client construction failed")]
    HttpClient {
        /// Source reqwest error.
        source: reqwest::Error,
    },
    /// Signal handlers could not be installed.
    #[error("signal handler installation failed")]
    Signal {
        /// Source IO error.
        source: std::io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: unspool_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: unspool_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn watcher(
        operation: &'static str,
        path: Option<PathBuf>,
        source: notify::Error,
    ) -> Self {
        Self::Watcher {
            operation,
            path,
            source,
        }
    }
}
