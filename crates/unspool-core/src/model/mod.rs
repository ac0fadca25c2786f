//! Domain models for the extraction lifecycle.
//!
//! # Design
//! - The status order lives in one table; callers use named predicates instead
//!   of comparing ranks, so a new state cannot slip in at the wrong position.
//! - Value objects are plain data so they can cross task boundaries as messages.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifiers forwarded from a source, used only in notification payloads.
pub type ExternalIds = BTreeMap<String, Value>;

/// Lifecycle state of a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Completed upstream, not yet checked for payloads or still settling.
    Waiting,
    /// Payload found; waiting for an extraction slot.
    Queued,
    /// Handed to the extraction engine.
    Extracting,
    /// Extraction reported an error.
    ExtractFailed,
    /// Extraction finished; waiting for the downstream consumer.
    Extracted,
    /// Downstream consumer claimed the item.
    Imported,
    /// Written files are being removed.
    Deleting,
    /// File removal reported an error.
    DeleteFailed,
    /// Written files were removed.
    Deleted,
}

impl ItemStatus {
    /// Every status in lifecycle order.
    pub const ORDER: [Self; 9] = [
        Self::Waiting,
        Self::Queued,
        Self::Extracting,
        Self::ExtractFailed,
        Self::Extracted,
        Self::Imported,
        Self::Deleting,
        Self::DeleteFailed,
        Self::Deleted,
    ];

    /// Legal in-ledger edges. Removals are modelled by [`Retirement`].
    const EDGES: [(Self, Self); 9] = [
        (Self::Waiting, Self::Queued),
        (Self::Queued, Self::Extracting),
        (Self::Extracting, Self::Extracted),
        (Self::Extracting, Self::ExtractFailed),
        (Self::Extracted, Self::Imported),
        (Self::Imported, Self::Waiting),
        (Self::Imported, Self::Deleting),
        (Self::Deleting, Self::Deleted),
        (Self::Deleting, Self::DeleteFailed),
    ];

    /// Position of the status in [`Self::ORDER`].
    #[must_use]
    pub fn rank(self) -> usize {
        Self::ORDER
            .iter()
            .position(|status| *status == self)
            .unwrap_or(Self::ORDER.len())
    }

    /// Whether `self` comes strictly before `other` in the lifecycle.
    #[must_use]
    pub fn precedes(self, other: Self) -> bool {
        self.rank() < other.rank()
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        Self::EDGES.contains(&(self, next))
    }

    /// Item has not been handed to the extraction engine yet.
    #[must_use]
    pub const fn is_pre_extraction(self) -> bool {
        matches!(self, Self::Waiting | Self::Queued)
    }

    /// Item is still expected to be claimed by the downstream consumer.
    #[must_use]
    pub fn awaits_import(self) -> bool {
        self.precedes(Self::Imported)
    }

    /// Item finished its deletion phase, successfully or not.
    #[must_use]
    pub const fn is_reclaimable(self) -> bool {
        matches!(self, Self::Deleted | Self::DeleteFailed)
    }

    /// Lowercase identifier used in logs, hooks and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Queued => "queued",
            Self::Extracting => "extracting",
            Self::ExtractFailed => "extract_failed",
            Self::Extracted => "extracted",
            Self::Imported => "imported",
            Self::Deleting => "deleting",
            Self::DeleteFailed => "delete_failed",
            Self::Deleted => "deleted",
        }
    }
}

impl Display for ItemStatus {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ORDER
            .iter()
            .copied()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("unknown item status '{value}'"))
    }
}

/// Why an item leaves the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retirement {
    /// Disappeared upstream before it was ever extracted.
    Vanished,
    /// Removed so that it can be re-created as `waiting` for another attempt.
    Retry,
    /// Deletion phase finished and the retention window passed.
    Reclaimed,
    /// Failed with no retries left and no longer wanted by its source.
    Abandoned,
}

impl Retirement {
    /// Whether an item in `status` may leave the ledger for this reason.
    #[must_use]
    pub const fn permits(self, status: ItemStatus) -> bool {
        match self {
            Self::Vanished => matches!(status, ItemStatus::Waiting),
            Self::Retry | Self::Abandoned => matches!(status, ItemStatus::ExtractFailed),
            Self::Reclaimed => status.is_reclaimable(),
        }
    }
}

/// Producing subsystem of a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Sonarr download queue.
    Sonarr,
    /// Radarr download queue.
    Radarr,
    /// Lidarr download queue.
    Lidarr,
    /// Readarr download queue.
    Readarr,
    /// Whisparr download queue.
    Whisparr,
    /// Watched filesystem folder.
    Folder,
    /// Origin not known.
    Unknown,
}

impl SourceKind {
    /// Upstream application kinds polled over HTTP.
    pub const UPSTREAM: [Self; 5] = [
        Self::Sonarr,
        Self::Radarr,
        Self::Lidarr,
        Self::Readarr,
        Self::Whisparr,
    ];

    /// Lowercase identifier used in logs, hooks and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sonarr => "sonarr",
            Self::Radarr => "radarr",
            Self::Lidarr => "lidarr",
            Self::Readarr => "readarr",
            Self::Whisparr => "whisparr",
            Self::Folder => "folder",
            Self::Unknown => "unknown",
        }
    }

    /// Whether items of this kind come from an upstream queue.
    #[must_use]
    pub const fn is_upstream(self) -> bool {
        !matches!(self, Self::Folder | Self::Unknown)
    }
}

impl Display for SourceKind {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Upper bound on automatic re-extraction attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RetryLimitRepr", into = "RetryLimitRepr")]
pub enum RetryLimit {
    /// At most this many retries; `Limited(0)` never retries.
    Limited(u32),
    /// Retry forever.
    Unlimited,
}

impl RetryLimit {
    /// Whether another attempt is allowed after `attempts` retries.
    #[must_use]
    pub const fn allows(self, attempts: u32) -> bool {
        match self {
            Self::Limited(max) => attempts < max,
            Self::Unlimited => true,
        }
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self::Limited(3)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetryLimitRepr {
    Count(u32),
    Keyword(String),
}

impl TryFrom<RetryLimitRepr> for RetryLimit {
    type Error = String;

    fn try_from(value: RetryLimitRepr) -> Result<Self, Self::Error> {
        match value {
            RetryLimitRepr::Count(count) => Ok(Self::Limited(count)),
            RetryLimitRepr::Keyword(word) if word.eq_ignore_ascii_case("unlimited") => {
                Ok(Self::Unlimited)
            }
            RetryLimitRepr::Keyword(word) => Err(format!(
                "max_retries must be an integer or \"unlimited\" (found '{word}')"
            )),
        }
    }
}

impl From<RetryLimit> for RetryLimitRepr {
    fn from(value: RetryLimit) -> Self {
        match value {
            RetryLimit::Limited(count) => Self::Count(count),
            RetryLimit::Unlimited => Self::Keyword("unlimited".to_string()),
        }
    }
}

/// Delay and bound for automatic re-extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Minimum time an item stays failed before it is retried.
    pub delay: Duration,
    /// Maximum number of retries.
    pub limit: RetryLimit,
}

impl RetryPolicy {
    /// Whether an item failed `elapsed` ago with `retry_count` retries behind it is due again.
    #[must_use]
    pub const fn is_due(&self, retry_count: u32, elapsed: Duration) -> bool {
        elapsed.as_nanos() >= self.delay.as_nanos() && self.limit.allows(retry_count)
    }

    /// Whether a failed item sat out its retry delay with no retries left.
    #[must_use]
    pub const fn is_exhausted(&self, retry_count: u32, elapsed: Duration) -> bool {
        elapsed.as_nanos() >= self.delay.as_nanos() && !self.limit.allows(retry_count)
    }
}

/// What happens to written and original files once an item is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Time between import and deletion; retirement happens at twice this value.
    pub delete_delay: Duration,
    /// Remove the archives after the import.
    pub delete_original: bool,
    /// Remove the extracted files after the import.
    pub delete_files: bool,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            delete_delay: Duration::from_secs(300),
            delete_original: false,
            delete_files: true,
        }
    }
}

/// Result of one extraction attempt as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    /// Engine finished processing the submission.
    pub done: bool,
    /// Error text when the attempt failed.
    pub error: Option<String>,
    /// Primary archives that were processed.
    pub archives: Vec<PathBuf>,
    /// Nested archives found in the output and processed afterwards.
    pub extras: Vec<PathBuf>,
    /// Files that did not exist before the attempt.
    pub new_files: Vec<PathBuf>,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Wall time spent on the attempt.
    pub elapsed: Duration,
    /// Submissions still queued in the engine when this one finished.
    pub queue_depth: usize,
    /// Directory the files ended up in.
    pub output_dir: Option<PathBuf>,
}

impl ExtractionOutcome {
    /// Finished without error.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.done && self.error.is_none()
    }

    /// Build a finished outcome carrying only an error.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            done: true,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// One entry of the item ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedItem {
    /// Identity key: title for upstream items, absolute path for folders.
    pub name: String,
    /// Subsystem that produced the item.
    pub source: SourceKind,
    /// Server URL or watch root the item came from.
    pub origin: String,
    /// Payload location.
    pub path: PathBuf,
    /// Identifiers forwarded to notifications.
    pub external_ids: ExternalIds,
    /// Current lifecycle state.
    pub status: ItemStatus,
    /// Time of the last transition.
    pub updated_at: DateTime<Utc>,
    /// Last extraction outcome.
    pub result: Option<ExtractionOutcome>,
    /// Automatic re-extraction attempts performed.
    pub retry_count: u32,
    /// Post-import file handling.
    pub retention: Retention,
}

impl TrackedItem {
    /// Time spent in the current status.
    #[must_use]
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        elapsed_since(self.updated_at, now)
    }
}

/// Non-negative duration between two timestamps.
#[must_use]
pub fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// Progress of a watched folder; a subset of [`ItemStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderStep {
    /// Collecting filesystem activity.
    Waiting,
    /// Quiet long enough; waiting for a slot.
    Queued,
    /// Handed to the extraction engine.
    Extracting,
    /// Extraction reported an error.
    ExtractFailed,
    /// Extraction finished.
    Extracted,
}

impl FolderStep {
    /// Matching ledger status.
    #[must_use]
    pub const fn status(self) -> ItemStatus {
        match self {
            Self::Waiting => ItemStatus::Waiting,
            Self::Queued => ItemStatus::Queued,
            Self::Extracting => ItemStatus::Extracting,
            Self::ExtractFailed => ItemStatus::ExtractFailed,
            Self::Extracted => ItemStatus::Extracted,
        }
    }
}

/// A tracked child of a watch root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFolder {
    /// Absolute path of the child.
    pub path: PathBuf,
    /// Watch root the child belongs to.
    pub root: PathBuf,
    /// Last filesystem event seen for the child.
    pub last_activity_at: DateTime<Utc>,
    /// Current step.
    pub step: FolderStep,
    /// Time the step last changed.
    pub updated_at: DateTime<Utc>,
    /// Files written by the last successful extraction.
    pub new_files: Vec<PathBuf>,
    /// Automatic re-extraction attempts performed.
    pub retry_count: u32,
}

impl WatchedFolder {
    /// Start tracking a child at `waiting`.
    #[must_use]
    pub const fn new(path: PathBuf, root: PathBuf, now: DateTime<Utc>) -> Self {
        Self {
            path,
            root,
            last_activity_at: now,
            step: FolderStep::Waiting,
            updated_at: now,
            new_files: Vec::new(),
            retry_count: 0,
        }
    }

    /// Record filesystem activity.
    pub const fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    /// Move to `step`.
    pub const fn set_step(&mut self, step: FolderStep, now: DateTime<Utc>) {
        self.step = step;
        self.updated_at = now;
    }

    /// Time since the last filesystem event.
    #[must_use]
    pub fn quiet_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed_since(self.last_activity_at, now)
    }

    /// Time spent in the current step.
    #[must_use]
    pub fn in_step_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed_since(self.updated_at, now)
    }
}

/// One record of an upstream queue snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Download title; becomes the ledger name.
    pub title: String,
    /// Download status reported by the application.
    pub status: String,
    /// Download protocol (`torrent`, `usenet`).
    pub protocol: String,
    /// Where the download client wrote the payload.
    pub output_path: Option<PathBuf>,
    /// Identifiers forwarded to notifications.
    pub external_ids: ExternalIds,
}

impl QueueEntry {
    /// Whether the download finished with one of the accepted protocols.
    #[must_use]
    pub fn is_complete(&self, protocols: &[String]) -> bool {
        self.status.eq_ignore_ascii_case("completed")
            && protocols
                .iter()
                .any(|protocol| protocol.eq_ignore_ascii_case(&self.protocol))
    }
}

/// Lifecycle notification handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Item name.
    pub name: String,
    /// Producing subsystem.
    pub source: SourceKind,
    /// Status the item moved to.
    pub status: ItemStatus,
    /// Payload location.
    pub path: PathBuf,
    /// Identifiers forwarded from the source.
    pub external_ids: ExternalIds,
    /// Extraction outcome, when one is attached.
    pub outcome: Option<ExtractionOutcome>,
    /// Time of the transition.
    pub at: DateTime<Utc>,
}

impl Notice {
    /// Build a notice describing the current state of `item`.
    #[must_use]
    pub fn from_item(item: &TrackedItem) -> Self {
        Self {
            name: item.name.clone(),
            source: item.source,
            status: item.status,
            path: item.path.clone(),
            external_ids: item.external_ids.clone(),
            outcome: item.result.clone(),
            at: item.updated_at,
        }
    }
}
