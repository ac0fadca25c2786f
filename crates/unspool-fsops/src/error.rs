//! # Design
//!
//! - Provide structured, constant-message errors for the extraction pipeline.
//! - Capture operation context (paths, inputs) to make failures reproducible in tests.
//! - Preserve source errors without interpolating context into error messages.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for filesystem operations.
pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// Errors produced by archive discovery, extraction and cleanup.
#[derive(Debug, Error)]
pub enum FsOpsError {
    /// IO failures while interacting with the filesystem.
    #[error("fsops io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Walkdir traversal failures.
    #[error("fsops walkdir failure")]
    Walkdir {
        /// Operation that triggered the walkdir failure.
        operation: &'static str,
        /// Path involved in the walkdir failure.
        path: PathBuf,
        /// Underlying walkdir error.
        source: walkdir::Error,
    },
    /// Zip archive failures.
    #[error("fsops zip failure")]
    Zip {
        /// Operation that triggered the archive failure.
        operation: &'static str,
        /// Path involved in the archive failure.
        path: PathBuf,
        /// Underlying zip error.
        source: zip::result::ZipError,
    },
    /// Input validation failures.
    #[error("fsops invalid input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// Archive format recognised but not decoded natively.
    #[error("fsops unsupported archive format")]
    Unsupported {
        /// Operation that is unsupported.
        operation: &'static str,
        /// Archive that triggered the error.
        path: PathBuf,
    },
    /// The search path holds no archive.
    #[error("fsops found no archives")]
    NoArchives {
        /// Path that was searched.
        path: PathBuf,
    },
    /// The engine no longer accepts submissions.
    #[error("fsops engine stopped")]
    Stopped,
    /// Several independent steps failed; every step was still attempted.
    #[error("fsops partial failure")]
    Partial {
        /// Operation that collected the failures.
        operation: &'static str,
        /// Individual failures in the order they happened.
        failures: Vec<FsOpsError>,
    },
}

impl FsOpsError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn walkdir(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: walkdir::Error,
    ) -> Self {
        Self::Walkdir {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn zip(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: zip::result::ZipError,
    ) -> Self {
        Self::Zip {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Collapse a list of failures: none is `Ok`, one is returned as is.
    pub(crate) fn collect(operation: &'static str, mut failures: Vec<Self>) -> FsOpsResult<()> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(Self::Partial {
                operation,
                failures,
            }),
        }
    }

    /// One-line description including the context fields, for outcome reports.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Io {
                operation,
                path,
                source,
            } => format!("{operation} {}: {source}", path.display()),
            Self::Walkdir {
                operation,
                path,
                source,
            } => format!("{operation} {}: {source}", path.display()),
            Self::Zip {
                operation,
                path,
                source,
            } => format!("{operation} {}: {source}", path.display()),
            Self::InvalidInput {
                field,
                reason,
                value,
            } => format!("{field} {reason}: {}", value.as_deref().unwrap_or("-")),
            Self::Unsupported { operation, path } => {
                format!("{operation} {}: format not supported", path.display())
            }
            Self::Stopped => "extraction engine stopped".to_string(),
            Self::NoArchives { path } => format!("no archives found in {}", path.display()),
            Self::Partial {
                operation,
                failures,
            } => {
                let details: Vec<String> = failures.iter().map(Self::describe).collect();
                format!("{operation}: {} failures: {}", failures.len(), details.join("; "))
            }
        }
    }
}
