//! Error types for ledger operations.

use thiserror::Error;

use crate::model::{ItemStatus, Retirement};

/// Errors raised when a caller asks the ledger for an illegal change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// No item is tracked under the requested name.
    #[error("ledger item not found")]
    UnknownItem {
        /// Name that was looked up.
        name: String,
    },
    /// An item with the same name is already tracked.
    #[error("ledger item already tracked")]
    DuplicateItem {
        /// Name that collided.
        name: String,
        /// Status of the existing item.
        status: ItemStatus,
    },
    /// The requested edge is not part of the lifecycle graph.
    #[error("illegal status transition")]
    InvalidTransition {
        /// Item whose transition was rejected.
        name: String,
        /// Current status.
        from: ItemStatus,
        /// Requested status.
        to: ItemStatus,
    },
    /// The item cannot leave the ledger for the given reason in its current status.
    #[error("illegal ledger retirement")]
    InvalidRetirement {
        /// Item whose removal was rejected.
        name: String,
        /// Current status.
        status: ItemStatus,
        /// Reason supplied by the caller.
        reason: Retirement,
    },
}

/// Convenience alias for ledger results.
pub type LedgerResult<T> = Result<T, LedgerError>;
