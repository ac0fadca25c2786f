//! Typed configuration model.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use unspool_core::{ItemStatus, Retention, RetryLimit, RetryPolicy, SourceKind};

use crate::defaults;

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Instance name reported in logs and hook payloads.
    pub instance_name: String,
    /// Concurrent extractions; at least one.
    pub parallel: usize,
    /// Quiet time before an item may start extracting.
    pub start_delay_secs: u64,
    /// Time a failed extraction waits before it is retried.
    pub retry_delay_secs: u64,
    /// Automatic re-extraction attempts; an integer or `"unlimited"`.
    pub max_retries: RetryLimit,
    /// Interval between upstream queue polls.
    pub poll_interval_secs: u64,
    /// Interval between ledger and folder aging checks.
    pub reconcile_interval_ms: u64,
    /// Interval between status lines.
    pub status_interval_secs: u64,
    /// Time granted to in-flight work on shutdown.
    pub shutdown_timeout_secs: u64,
    /// Passes over extracted output looking for nested archives.
    pub max_nesting_depth: usize,
    /// Logging options.
    pub log: LogConfig,
    /// Sonarr servers.
    pub sonarr: Vec<ServerConfig>,
    /// Radarr servers.
    pub radarr: Vec<ServerConfig>,
    /// Lidarr servers.
    pub lidarr: Vec<ServerConfig>,
    /// Readarr servers.
    pub readarr: Vec<ServerConfig>,
    /// Whisparr servers.
    pub whisparr: Vec<ServerConfig>,
    /// Watched folders.
    #[serde(rename = "folder")]
    pub folders: Vec<FolderPolicy>,
    /// HTTP webhooks.
    #[serde(rename = "webhook")]
    pub webhooks: Vec<WebhookConfig>,
    /// Command hooks.
    #[serde(rename = "cmdhook")]
    pub cmdhooks: Vec<CommandHookConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            instance_name: defaults::INSTANCE_NAME.to_string(),
            parallel: defaults::PARALLEL,
            start_delay_secs: defaults::START_DELAY_SECS,
            retry_delay_secs: defaults::RETRY_DELAY_SECS,
            max_retries: RetryLimit::Limited(defaults::MAX_RETRIES),
            poll_interval_secs: defaults::POLL_INTERVAL_SECS,
            reconcile_interval_ms: defaults::RECONCILE_INTERVAL_MS,
            status_interval_secs: defaults::STATUS_INTERVAL_SECS,
            shutdown_timeout_secs: defaults::SHUTDOWN_TIMEOUT_SECS,
            max_nesting_depth: defaults::MAX_NESTING_DEPTH,
            log: LogConfig::default(),
            sonarr: Vec::new(),
            radarr: Vec::new(),
            lidarr: Vec::new(),
            readarr: Vec::new(),
            whisparr: Vec::new(),
            folders: Vec::new(),
            webhooks: Vec::new(),
            cmdhooks: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Quiet time before an item may start extracting.
    #[must_use]
    pub const fn start_delay(&self) -> Duration {
        Duration::from_secs(self.start_delay_secs)
    }

    /// Delay and bound for automatic re-extraction.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_secs(self.retry_delay_secs),
            limit: self.max_retries,
        }
    }

    /// Interval between upstream queue polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Interval between aging checks.
    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Interval between status lines.
    #[must_use]
    pub const fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    /// Time granted to in-flight work on shutdown.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Every configured server paired with its application kind.
    pub fn servers(&self) -> impl Iterator<Item = (SourceKind, &ServerConfig)> {
        SourceKind::UPSTREAM
            .into_iter()
            .flat_map(move |kind| self.servers_for(kind).iter().map(move |server| (kind, server)))
    }

    /// Servers configured for `kind`.
    #[must_use]
    pub fn servers_for(&self, kind: SourceKind) -> &[ServerConfig] {
        match kind {
            SourceKind::Sonarr => &self.sonarr,
            SourceKind::Radarr => &self.radarr,
            SourceKind::Lidarr => &self.lidarr,
            SourceKind::Readarr => &self.readarr,
            SourceKind::Whisparr => &self.whisparr,
            SourceKind::Folder | SourceKind::Unknown => &[],
        }
    }

    pub(crate) fn servers_for_mut(&mut self, kind: SourceKind) -> Option<&mut Vec<ServerConfig>> {
        match kind {
            SourceKind::Sonarr => Some(&mut self.sonarr),
            SourceKind::Radarr => Some(&mut self.radarr),
            SourceKind::Lidarr => Some(&mut self.lidarr),
            SourceKind::Readarr => Some(&mut self.readarr),
            SourceKind::Whisparr => Some(&mut self.whisparr),
            SourceKind::Folder | SourceKind::Unknown => None,
        }
    }
}

/// Logging options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Level directive used when `RUST_LOG` is not set.
    pub level: String,
    /// `pretty` or `json`; inferred from the build profile when absent.
    pub format: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            format: None,
        }
    }
}

/// One upstream application server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Base URL, e.g. `http://sonarr:8989`.
    pub url: String,
    /// Value sent in the `X-Api-Key` header.
    pub api_key: String,
    /// Download directories searched when a record carries no output path.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Download protocols whose completed records are extracted.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    /// Request timeout.
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
    /// Remove the archives once the item is imported.
    #[serde(default)]
    pub delete_original: bool,
    /// Delay between import and deletion.
    #[serde(default = "default_delete_delay")]
    pub delete_delay_secs: u64,
    /// Queue records requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl ServerConfig {
    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Post-import handling for items from this server.
    #[must_use]
    pub const fn retention(&self) -> Retention {
        Retention {
            delete_delay: Duration::from_secs(self.delete_delay_secs),
            delete_original: self.delete_original,
            delete_files: true,
        }
    }
}

/// One watched folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FolderPolicy {
    /// Watch root.
    pub path: PathBuf,
    /// Remove the archives after the cleanup delay.
    #[serde(default)]
    pub delete_original: bool,
    /// Remove the extracted files after the cleanup delay.
    #[serde(default)]
    pub delete_files: bool,
    /// Move extracted files into the original directory.
    #[serde(default)]
    pub move_back: bool,
    /// Delay between extraction and cleanup.
    #[serde(default = "default_folder_delete_after")]
    pub delete_after_secs: u64,
    /// Paths under the root that are never tracked.
    #[serde(default)]
    pub exclude_paths: Vec<PathBuf>,
    /// Skip archives found inside the extracted output.
    #[serde(default)]
    pub disable_recursion: bool,
}

impl FolderPolicy {
    /// Delay between extraction and cleanup.
    #[must_use]
    pub const fn delete_after(&self) -> Duration {
        Duration::from_secs(self.delete_after_secs)
    }

    /// Post-extraction handling for this folder.
    #[must_use]
    pub const fn retention(&self) -> Retention {
        Retention {
            delete_delay: self.delete_after(),
            delete_original: self.delete_original,
            delete_files: self.delete_files,
        }
    }

    /// Whether `path` equals or sits beneath one of the excluded paths.
    ///
    /// Relative exclusions are resolved against the watch root.
    #[must_use]
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_paths.iter().any(|excluded| {
            let excluded = if excluded.is_absolute() {
                excluded.clone()
            } else {
                self.path.join(excluded)
            };
            path.starts_with(&excluded)
        })
    }
}

/// HTTP webhook receiving item transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// Name used in logs; defaults to the URL.
    #[serde(default)]
    pub name: String,
    /// Endpoint receiving a JSON POST.
    pub url: String,
    /// Statuses delivered; empty means all.
    #[serde(default)]
    pub events: Vec<ItemStatus>,
    /// Request timeout.
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first failed attempt.
    #[serde(default = "default_webhook_retries")]
    pub retries: u32,
}

impl WebhookConfig {
    /// Whether transitions to `status` are delivered.
    #[must_use]
    pub fn wants(&self, status: ItemStatus) -> bool {
        self.events.is_empty() || self.events.contains(&status)
    }

    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Local command run for item transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandHookConfig {
    /// Name used in logs; defaults to the command.
    #[serde(default)]
    pub name: String,
    /// Command line.
    pub command: String,
    /// Run through `sh -c` instead of splitting on whitespace.
    #[serde(default)]
    pub shell: bool,
    /// Statuses delivered; empty means all.
    #[serde(default)]
    pub events: Vec<ItemStatus>,
    /// Time after which the command is killed.
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

impl CommandHookConfig {
    /// Whether transitions to `status` are delivered.
    #[must_use]
    pub fn wants(&self, status: ItemStatus) -> bool {
        self.events.is_empty() || self.events.contains(&status)
    }

    /// Time after which the command is killed.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_protocols() -> Vec<String> {
    vec![defaults::PROTOCOL.to_string()]
}

const fn default_server_timeout() -> u64 {
    defaults::SERVER_TIMEOUT_SECS
}

const fn default_delete_delay() -> u64 {
    defaults::DELETE_DELAY_SECS
}

const fn default_page_size() -> u32 {
    defaults::PAGE_SIZE
}

const fn default_folder_delete_after() -> u64 {
    defaults::FOLDER_DELETE_AFTER_SECS
}

const fn default_hook_timeout() -> u64 {
    defaults::HOOK_TIMEOUT_SECS
}

const fn default_webhook_retries() -> u32 {
    defaults::WEBHOOK_RETRIES
}
