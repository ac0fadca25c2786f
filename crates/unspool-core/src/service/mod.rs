//! Collaborator contracts driven by the orchestrator loop.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::{ExtractionOutcome, Notice, QueueEntry, SourceKind};

/// Work handed to an [`ExtractionEngine`].
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// Ledger name the updates are reported under.
    pub name: String,
    /// File or directory searched for archives.
    pub search_path: PathBuf,
    /// Move extracted files back next to the archives instead of leaving them
    /// in the sibling output directory.
    pub move_back: bool,
    /// Remove the archives after a successful extraction.
    pub delete_originals: bool,
    /// Extract archives found inside the output.
    pub recursion: bool,
    /// Channel receiving one `Started` and exactly one `Finished` update.
    pub updates: mpsc::Sender<ExtractionUpdate>,
}

/// Progress reported by an [`ExtractionEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionUpdate {
    /// A worker picked the submission up.
    Started {
        /// Ledger name.
        name: String,
        /// Submissions still waiting for a worker.
        queue_depth: usize,
    },
    /// Terminal report; `outcome.done` is always set.
    Finished {
        /// Ledger name.
        name: String,
        /// Result of the attempt.
        outcome: ExtractionOutcome,
    },
}

impl ExtractionUpdate {
    /// Ledger name the update belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Started { name, .. } | Self::Finished { name, .. } => name,
        }
    }
}

/// Archive extraction backend.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    /// Queue a submission and return the number of submissions in flight.
    ///
    /// # Errors
    ///
    /// Fails when the engine is stopping or the request is malformed.
    fn submit(&self, request: ExtractionRequest) -> anyhow::Result<usize>;

    /// Refuse new work and wait up to `timeout` for in-flight submissions;
    /// returns how many had to be abandoned.
    async fn stop(&self, timeout: Duration) -> usize;
}

/// Client for one upstream download queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Application kind served by this client.
    fn source(&self) -> SourceKind;

    /// Server URL, used as the item origin and in logs.
    fn origin(&self) -> &str;

    /// Fetch the current queue.
    ///
    /// # Errors
    ///
    /// Transport failures and non-success responses.
    async fn fetch_queue(&self) -> anyhow::Result<Vec<QueueEntry>>;
}

/// Fire-and-forget receiver of lifecycle notifications.
pub trait NotificationSink: Send + Sync {
    /// Deliver a notice; must not block the caller.
    fn notify(&self, notice: Notice);
}
