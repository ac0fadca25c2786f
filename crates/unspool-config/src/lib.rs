#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]
#![warn(missing_docs, unreachable_pub, unused)]
#![allow(clippy::module_name_repetitions)]

//! File-backed configuration: a TOML document, scalar environment overrides,
//! and validation that separates fatal problems from skippable resources.
//!
//! Layout: `model.rs` (typed config), `loader.rs` (file parsing and env
//! overrides), `validate.rs` (fatal checks and per-resource warnings),
//! `defaults.rs` (default values).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

use std::path::{Path, PathBuf};

pub use defaults::DEFAULT_CONFIG_PATH;
pub use error::{ConfigError, ConfigResult};
pub use loader::{CONFIG_PATH_ENV, apply_env_overrides, parse_config, read_config};
pub use model::{
    AppConfig, CommandHookConfig, FolderPolicy, LogConfig, ServerConfig, WebhookConfig,
};
pub use validate::{ConfigWarning, validate};

/// Configuration ready for use, plus the resources that were skipped.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Validated configuration.
    pub config: AppConfig,
    /// Resources removed during validation.
    pub warnings: Vec<ConfigWarning>,
    /// File the configuration was read from.
    pub source: PathBuf,
}

/// Read `path`, apply overrides from `lookup`, and validate the result.
///
/// # Errors
///
/// Any [`ConfigError`]; all of them are fatal at startup.
pub fn load<F>(path: &Path, lookup: F) -> ConfigResult<LoadedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = read_config(path)?;
    apply_env_overrides(&mut config, lookup)?;
    let (config, warnings) = validate(config)?;
    Ok(LoadedConfig {
        config,
        warnings,
        source: path.to_path_buf(),
    })
}
