//! Default values for configuration documents.
//!
//! # Design
//! - Keep time-based defaults explicit and in one place.
//! - Durations are stored in whole seconds (or milliseconds where noted).

/// Config file used when neither `--config` nor `UNSPOOL_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "unspool.toml";
/// Instance name reported in logs and hook payloads.
pub(crate) const INSTANCE_NAME: &str = "unspool";
/// Concurrent extractions.
pub(crate) const PARALLEL: usize = 1;
/// Quiet time before an item may start extracting.
pub(crate) const START_DELAY_SECS: u64 = 60;
/// Time a failed extraction waits before it is retried.
pub(crate) const RETRY_DELAY_SECS: u64 = 300;
/// Automatic re-extraction attempts.
pub(crate) const MAX_RETRIES: u32 = 3;
/// Interval between upstream queue polls.
pub(crate) const POLL_INTERVAL_SECS: u64 = 120;
/// Interval between ledger and folder aging checks (milliseconds).
pub(crate) const RECONCILE_INTERVAL_MS: u64 = 1_000;
/// Interval between status lines.
pub(crate) const STATUS_INTERVAL_SECS: u64 = 300;
/// Time granted to in-flight work on shutdown.
pub(crate) const SHUTDOWN_TIMEOUT_SECS: u64 = 30;
/// Passes over extracted output looking for nested archives.
pub(crate) const MAX_NESTING_DEPTH: usize = 3;
/// Upstream request timeout.
pub(crate) const SERVER_TIMEOUT_SECS: u64 = 10;
/// Delay between import and deletion for upstream items.
pub(crate) const DELETE_DELAY_SECS: u64 = 300;
/// Queue records requested per page.
pub(crate) const PAGE_SIZE: u32 = 500;
/// Download protocol accepted when none is configured.
pub(crate) const PROTOCOL: &str = "torrent";
/// Delay between extraction and cleanup for watched folders.
pub(crate) const FOLDER_DELETE_AFTER_SECS: u64 = 600;
/// Hook delivery timeout.
pub(crate) const HOOK_TIMEOUT_SECS: u64 = 10;
/// Webhook delivery retries after the first attempt.
pub(crate) const WEBHOOK_RETRIES: u32 = 2;
/// Log level directive.
pub(crate) const LOG_LEVEL: &str = "info";
