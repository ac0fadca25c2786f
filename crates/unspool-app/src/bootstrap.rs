use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};
use unspool_config::{AppConfig, LoadedConfig};
use unspool_core::ExtractionEngine;
use unspool_events::EventBus;
use unspool_fsops::FsOpsEngine;
use unspool_telemetry::{
    GlobalContextGuard, LogFormat, LoggingConfig, Metrics, build_sha, init_logging,
};
use unspool_upstream::StarrClient;

use crate::cli::Cli;
use crate::error::{AppError, AppResult};
use crate::folders::{self, FolderWatcher};
use crate::hooks::HookDispatcher;
use crate::orchestrator::{LoopSettings, Orchestrator};
use crate::pollers::UpstreamServer;

/// Entry point for the unspool boot sequence.
///
/// # Errors
///
/// Returns an error when the configuration cannot be loaded, logging cannot
/// be installed, or signal handlers cannot be registered. Everything after
/// startup is reported through logs and events instead.
pub async fn run_app(cli: Cli) -> AppResult<()> {
    let LoadedConfig {
        config,
        warnings,
        source,
    } = unspool_config::load(&cli.config, |key| std::env::var(key).ok())
        .map_err(|err| AppError::config("config.load", err))?;

    init_logging(&LoggingConfig {
        level: &config.log.level,
        format: LogFormat::from_name(config.log.format.as_deref()),
        build_sha: build_sha(),
    })
    .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    let _context = GlobalContextGuard::new(config.instance_name.clone());

    info!(config = %source.display(), "unspool starting");
    for warning in &warnings {
        warn!(%warning, "configuration resource skipped");
    }

    let shutdown = shutdown_signal()?;
    run_with(config, EventBus::new(), shutdown).await
}

/// Wire every component from `config` and run until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error when the metrics registry or the webhook client cannot be
/// built.
pub async fn run_with<F>(config: AppConfig, events: EventBus, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()>,
{
    let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
    let max_depth = u32::try_from(config.max_nesting_depth).unwrap_or(u32::MAX);
    let engine = Arc::new(FsOpsEngine::new(config.parallel, max_depth));

    let dispatcher = HookDispatcher::new(
        config.instance_name.clone(),
        config.webhooks.clone(),
        config.cmdhooks.clone(),
        metrics.clone(),
    )?;
    let hooks = (!dispatcher.is_empty()).then(|| dispatcher.spawn(&events));

    let (orchestrator, inbox) = Orchestrator::new(
        LoopSettings::from_config(&config),
        build_servers(&config),
        config.folders.clone(),
        Arc::clone(&engine) as Arc<dyn ExtractionEngine>,
        events,
        metrics,
    );

    let folder_tx = orchestrator.folder_sender();
    let watcher = if config.folders.is_empty() {
        None
    } else {
        match FolderWatcher::start(&config.folders, folder_tx.clone()) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(error = ?err, "folder watching unavailable; relying on the startup scan");
                None
            }
        }
    };
    let existing = folders::initial_events(&config.folders);
    if !existing.is_empty() {
        info!(children = existing.len(), "queueing existing folder contents");
        tokio::spawn(async move {
            for event in existing {
                if folder_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    orchestrator.run(inbox, shutdown).await;

    drop(watcher);
    let timeout = config.shutdown_timeout();
    let abandoned = engine.stop(timeout).await;
    if abandoned > 0 {
        warn!(abandoned, "extractions abandoned at shutdown");
    }
    if let Some(hooks) = hooks
        && !hooks.shutdown(timeout).await
    {
        warn!("hook delivery did not finish before the shutdown timeout");
    }
    info!("unspool stopped");
    Ok(())
}

/// Build a queue client for every configured server; servers whose client
/// cannot be built are skipped.
#[must_use]
pub fn build_servers(config: &AppConfig) -> Vec<UpstreamServer> {
    config
        .servers()
        .filter_map(|(kind, server)| match StarrClient::new(kind, server) {
            Ok(client) => Some(UpstreamServer {
                client: Arc::new(client),
                config: server.clone(),
            }),
            Err(err) => {
                warn!(
                    source = %kind,
                    url = %server.url,
                    error = ?err,
                    "skipping upstream server"
                );
                None
            }
        })
        .collect()
}

#[cfg(unix)]
fn shutdown_signal() -> AppResult<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).map_err(|source| AppError::Signal { source })?;
    Ok(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "ctrl-c handler failed; waiting for SIGTERM");
                    let _ = terminate.recv().await;
                }
            }
            _ = terminate.recv() => {}
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> AppResult<impl Future<Output = ()>> {
    Ok(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    })
}
