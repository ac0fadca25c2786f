//! TOML loading and environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;
use unspool_core::RetryLimit;

use crate::error::{ConfigError, ConfigResult};
use crate::model::AppConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "UNSPOOL_CONFIG";
/// Override for [`AppConfig::parallel`].
pub const PARALLEL_ENV: &str = "UNSPOOL_PARALLEL";
/// Override for [`AppConfig::start_delay_secs`].
pub const START_DELAY_ENV: &str = "UNSPOOL_START_DELAY_SECS";
/// Override for [`AppConfig::retry_delay_secs`].
pub const RETRY_DELAY_ENV: &str = "UNSPOOL_RETRY_DELAY_SECS";
/// Override for [`AppConfig::max_retries`].
pub const MAX_RETRIES_ENV: &str = "UNSPOOL_MAX_RETRIES";
/// Override for the log level.
pub const LOG_LEVEL_ENV: &str = "UNSPOOL_LOG_LEVEL";

/// Read and parse a configuration file.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when the file cannot be read and
/// [`ConfigError::Parse`] when it is not a valid document.
pub fn read_config(path: &Path) -> ConfigResult<AppConfig> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        operation: "config.read",
        path: path.to_path_buf(),
        source,
    })?;
    parse_document(&contents, Some(path.to_path_buf()))
}

/// Parse a configuration document held in memory.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] when the document is invalid.
pub fn parse_config(contents: &str) -> ConfigResult<AppConfig> {
    parse_document(contents, None)
}

fn parse_document(contents: &str, path: Option<PathBuf>) -> ConfigResult<AppConfig> {
    toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path,
        source: Box::new(source),
    })
}

/// Apply scalar overrides looked up through `lookup`.
///
/// The lookup is injected so callers decide where variables come from; the
/// binary passes `std::env::var`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] when an override does not parse.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(PARALLEL_ENV) {
        config.parallel = parse_env(PARALLEL_ENV, &value)?;
    }
    if let Some(value) = lookup(START_DELAY_ENV) {
        config.start_delay_secs = parse_env(START_DELAY_ENV, &value)?;
    }
    if let Some(value) = lookup(RETRY_DELAY_ENV) {
        config.retry_delay_secs = parse_env(RETRY_DELAY_ENV, &value)?;
    }
    if let Some(value) = lookup(MAX_RETRIES_ENV) {
        config.max_retries = parse_retry_limit(&value)?;
    }
    if let Some(value) = lookup(LOG_LEVEL_ENV) {
        let level = value.trim();
        if !level.is_empty() {
            config.log.level = level.to_string();
        }
    }
    Ok(())
}

fn parse_env<T: FromStr>(name: &'static str, value: &str) -> ConfigResult<T> {
    debug!(variable = name, "applying environment override");
    value.trim().parse().map_err(|_| ConfigError::InvalidField {
        section: "env",
        field: name.to_string(),
        value: Some(value.to_string()),
        reason: "must be a non-negative integer",
    })
}

fn parse_retry_limit(value: &str) -> ConfigResult<RetryLimit> {
    if value.trim().eq_ignore_ascii_case("unlimited") {
        return Ok(RetryLimit::Unlimited);
    }
    parse_env(MAX_RETRIES_ENV, value).map(RetryLimit::Limited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_document_yields_defaults() -> ConfigResult<()> {
        let config = parse_config("")?;
        assert_eq!(config, AppConfig::default());
        Ok(())
    }

    #[test]
    fn full_document_parses() -> ConfigResult<()> {
        let config = parse_config(
            r#"
            instance_name = "nas"
            parallel = 2
            start_delay_secs = 90
            max_retries = "unlimited"

            [log]
            level = "debug"
            format = "json"

            [[sonarr]]
            url = "http://sonarr:8989"
            api_key = "abc"
            paths = ["/downloads"]
            protocols = ["torrent", "usenet"]

            [[radarr]]
            url = "http://radarr:7878"
            api_key = "def"
            delete_original = true

            [[folder]]
            path = "/watch"
            move_back = true
            exclude_paths = ["/watch/incomplete"]

            [[webhook]]
            url = "http://hooks.local/unspool"
            events = ["extracted", "extract_failed"]

            [[cmdhook]]
            command = "/usr/local/bin/notify"
            shell = true
            "#,
        )?;
        assert_eq!(config.instance_name, "nas");
        assert_eq!(config.parallel, 2);
        assert_eq!(config.max_retries, RetryLimit::Unlimited);
        assert_eq!(config.log.format.as_deref(), Some("json"));
        assert_eq!(config.sonarr[0].protocols.len(), 2);
        assert_eq!(config.radarr[0].protocols, vec!["torrent".to_string()]);
        assert!(config.radarr[0].delete_original);
        assert_eq!(config.radarr[0].page_size, 500);
        assert!(config.folders[0].move_back);
        assert_eq!(config.folders[0].delete_after_secs, 600);
        assert_eq!(config.webhooks[0].events.len(), 2);
        assert!(config.cmdhooks[0].shell);
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse_config("paralel = 2");
        assert!(matches!(err, Err(ConfigError::Parse { path: None, .. })));
    }

    #[test]
    fn overrides_replace_scalars() -> ConfigResult<()> {
        let mut config = AppConfig::default();
        apply_env_overrides(
            &mut config,
            lookup(&[
                (PARALLEL_ENV, "4"),
                (START_DELAY_ENV, " 15 "),
                (RETRY_DELAY_ENV, "30"),
                (MAX_RETRIES_ENV, "UNLIMITED"),
                (LOG_LEVEL_ENV, "trace"),
            ]),
        )?;
        assert_eq!(config.parallel, 4);
        assert_eq!(config.start_delay_secs, 15);
        assert_eq!(config.retry_delay_secs, 30);
        assert_eq!(config.max_retries, RetryLimit::Unlimited);
        assert_eq!(config.log.level, "trace");
        Ok(())
    }

    #[test]
    fn malformed_override_names_the_variable() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, lookup(&[(MAX_RETRIES_ENV, "lots")]));
        match err {
            Err(ConfigError::InvalidField { field, value, .. }) => {
                assert_eq!(field, MAX_RETRIES_ENV);
                assert_eq!(value.as_deref(), Some("lots"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn read_config_reports_missing_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            read_config(&missing),
            Err(ConfigError::Io { .. })
        ));

        let path = dir.path().join("unspool.toml");
        let mut file = fs::File::create(&path)?;
        writeln!(file, "parallel = 3")?;
        assert_eq!(read_config(&path)?.parallel, 3);
        Ok(())
    }
}
