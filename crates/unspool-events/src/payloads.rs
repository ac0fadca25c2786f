//! Event payload types carried from the orchestrator loop to hook delivery.

use chrono::{DateTime, Utc};
use unspool_core::{ItemStatus, Notice, SourceKind};

/// Identifier assigned to each event emitted by the orchestrator.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed lifecycle events.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A ledger item moved to a new status.
    ItemTransition(Notice),
    /// An extraction worker picked up a submission.
    ExtractionStarted {
        /// Ledger name of the submission.
        name: String,
        /// Submissions still waiting for a worker.
        queue_depth: usize,
    },
    /// An upstream queue could not be fetched; the previous snapshot is kept.
    QueuePollFailed {
        /// Application kind that failed.
        source: SourceKind,
        /// Server URL.
        origin: String,
        /// Error detail.
        message: String,
    },
}

impl Event {
    /// Machine-friendly discriminator used in logs and hook filters.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ItemTransition(_) => "item_transition",
            Self::ExtractionStarted { .. } => "extraction_started",
            Self::QueuePollFailed { .. } => "queue_poll_failed",
        }
    }

    /// Status carried by item transitions.
    #[must_use]
    pub const fn status(&self) -> Option<ItemStatus> {
        match self {
            Self::ItemTransition(notice) => Some(notice.status),
            _ => None,
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}
