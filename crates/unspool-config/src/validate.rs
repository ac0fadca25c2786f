//! Validation of a loaded configuration.
//!
//! Global problems are fatal. A broken server, folder or hook only removes
//! that resource; the rest of the configuration keeps running.

use std::fmt::{self, Display, Formatter};

use unspool_core::SourceKind;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{AppConfig, CommandHookConfig, FolderPolicy, ServerConfig, WebhookConfig};

/// A resource skipped during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// Table the resource came from (`sonarr`, `folder`, `webhook`, ...).
    pub section: &'static str,
    /// URL, path or command identifying the resource.
    pub resource: String,
    /// Why the resource was skipped.
    pub reason: &'static str,
}

impl Display for ConfigWarning {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "[{}] {}: {}",
            self.section, self.resource, self.reason
        )
    }
}

/// Check global settings and drop unusable resources.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] for global settings that prevent the
/// process from running at all.
pub fn validate(mut config: AppConfig) -> ConfigResult<(AppConfig, Vec<ConfigWarning>)> {
    validate_globals(&config)?;

    let mut warnings = Vec::new();
    for kind in SourceKind::UPSTREAM {
        if let Some(servers) = config.servers_for_mut(kind) {
            servers.retain(|server| {
                keep(kind.as_str(), &server.url, server_problem(server), &mut warnings)
            });
        }
    }
    config.folders.retain(|folder| {
        let resource = folder.path.display().to_string();
        keep("folder", &resource, folder_problem(folder), &mut warnings)
    });
    config
        .webhooks
        .retain(|hook| keep("webhook", &hook.url, webhook_problem(hook), &mut warnings));
    config
        .cmdhooks
        .retain(|hook| keep("cmdhook", &hook.command, command_problem(hook), &mut warnings));

    for hook in &mut config.webhooks {
        if hook.name.trim().is_empty() {
            hook.name.clone_from(&hook.url);
        }
    }
    for hook in &mut config.cmdhooks {
        if hook.name.trim().is_empty() {
            hook.name.clone_from(&hook.command);
        }
    }
    Ok((config, warnings))
}

fn validate_globals(config: &AppConfig) -> ConfigResult<()> {
    if config.instance_name.trim().is_empty() {
        return Err(invalid("instance_name", None, "must not be empty"));
    }
    if config.parallel == 0 {
        return Err(invalid("parallel", Some("0"), "must be at least 1"));
    }
    if config.poll_interval_secs == 0 {
        return Err(invalid("poll_interval_secs", Some("0"), "must be at least 1"));
    }
    if config.reconcile_interval_ms == 0 {
        return Err(invalid("reconcile_interval_ms", Some("0"), "must be at least 1"));
    }
    if config.status_interval_secs == 0 {
        return Err(invalid("status_interval_secs", Some("0"), "must be at least 1"));
    }
    Ok(())
}

fn invalid(field: &str, value: Option<&str>, reason: &'static str) -> ConfigError {
    ConfigError::InvalidField {
        section: "global",
        field: field.to_string(),
        value: value.map(str::to_string),
        reason,
    }
}

fn keep(
    section: &'static str,
    resource: &str,
    problem: Option<&'static str>,
    warnings: &mut Vec<ConfigWarning>,
) -> bool {
    problem.map_or(true, |reason| {
        warnings.push(ConfigWarning {
            section,
            resource: resource.to_string(),
            reason,
        });
        false
    })
}

fn server_problem(server: &ServerConfig) -> Option<&'static str> {
    if !is_http_url(&server.url) {
        Some("url must start with http:// or https:// and name a host")
    } else if server.api_key.trim().is_empty() {
        Some("api_key must not be empty")
    } else if server.protocols.is_empty() {
        Some("protocols must list at least one protocol")
    } else if server.page_size == 0 {
        Some("page_size must be at least 1")
    } else {
        None
    }
}

fn folder_problem(folder: &FolderPolicy) -> Option<&'static str> {
    if !folder.path.is_absolute() {
        Some("path must be absolute")
    } else if !folder.path.is_dir() {
        Some("path is not a readable directory")
    } else {
        None
    }
}

fn webhook_problem(hook: &WebhookConfig) -> Option<&'static str> {
    if is_http_url(&hook.url) {
        None
    } else {
        Some("url must start with http:// or https:// and name a host")
    }
}

fn command_problem(hook: &CommandHookConfig) -> Option<&'static str> {
    if hook.command.trim().is_empty() {
        Some("command must not be empty")
    } else {
        None
    }
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    rest.and_then(|rest| rest.split(['/', ':']).next())
        .is_some_and(|host| !host.is_empty())
}
