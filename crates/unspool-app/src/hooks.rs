//! Delivery of lifecycle notices to webhooks and local commands.
//!
//! The dispatcher is a bus subscriber. It never talks back to the loop:
//! failures are logged and counted, and the ledger is unaffected.

use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use unspool_config::{CommandHookConfig, WebhookConfig};
use unspool_core::Notice;
use unspool_events::{Event, EventBus};
use unspool_telemetry::{HookKind, Metrics};

use crate::error::{AppError, AppResult};

const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
const MAX_JITTER_MS: u64 = 250;

/// JSON body posted to webhooks.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    instance: &'a str,
    #[serde(flatten)]
    notice: &'a Notice,
}

/// Sends item transitions to the configured hooks.
pub struct HookDispatcher {
    instance: String,
    webhooks: Vec<WebhookConfig>,
    cmdhooks: Vec<CommandHookConfig>,
    http: reqwest::Client,
    metrics: Metrics,
    backoff: Duration,
}

/// Running dispatcher task.
pub struct HookHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HookHandle {
    /// Ask the dispatcher to stop and wait up to `timeout` for it to finish
    /// the notice it is delivering. Returns `false` when the wait timed out.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let _ = self.stop.send(());
        let mut task = self.task;
        if tokio::time::timeout(timeout, &mut task).await.is_ok() {
            true
        } else {
            task.abort();
            false
        }
    }
}

impl HookDispatcher {
    /// Build a dispatcher for the given hooks.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::HttpClient`] when the HTTP client cannot be built.
    pub fn new(
        instance: impl Into<String>,
        webhooks: Vec<WebhookConfig>,
        cmdhooks: Vec<CommandHookConfig>,
        metrics: Metrics,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| AppError::HttpClient { source })?;
        Ok(Self {
            instance: instance.into(),
            webhooks,
            cmdhooks,
            http,
            metrics,
            backoff: DEFAULT_BACKOFF,
        })
    }

    /// Whether any hook is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.webhooks.is_empty() && self.cmdhooks.is_empty()
    }

    /// Subscribe to `bus` and deliver notices until stopped.
    #[must_use]
    pub fn spawn(self, bus: &EventBus) -> HookHandle {
        let mut stream = bus.subscribe(None);
        let (stop, mut stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            info!(
                webhooks = self.webhooks.len(),
                cmdhooks = self.cmdhooks.len(),
                "hook dispatcher started"
            );
            let mut dropped = 0;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    envelope = stream.next() => {
                        let Some(envelope) = envelope else { break };
                        dropped = self.record_dropped(dropped, stream.dropped());
                        if let Event::ItemTransition(notice) = envelope.event {
                            self.deliver(&notice).await;
                        }
                    }
                }
            }
            debug!("hook dispatcher stopped");
        });
        HookHandle { stop, task }
    }

    fn record_dropped(&self, seen: u64, total: u64) -> u64 {
        let skipped = total.saturating_sub(seen);
        if skipped > 0 {
            warn!(skipped, "hook dispatcher fell behind; notices were skipped");
            self.metrics.add_events_dropped(skipped);
        }
        total
    }

    /// Deliver one notice to every hook subscribed to its status.
    pub async fn deliver(&self, notice: &Notice) {
        for hook in self.webhooks.iter().filter(|hook| hook.wants(notice.status)) {
            let delivered = self.post_webhook(hook, notice).await;
            self.metrics.inc_hook_delivery(HookKind::Webhook, delivered);
        }
        for hook in self.cmdhooks.iter().filter(|hook| hook.wants(notice.status)) {
            let succeeded = run_command(hook, notice).await;
            self.metrics.inc_hook_delivery(HookKind::Command, succeeded);
        }
    }

    async fn post_webhook(&self, hook: &WebhookConfig, notice: &Notice) -> bool {
        let payload = WebhookPayload {
            instance: &self.instance,
            notice,
        };
        let mut attempt: u32 = 0;
        loop {
            let response = self
                .http
                .post(&hook.url)
                .timeout(hook.timeout())
                .json(&payload)
                .send()
                .await;
            let failure = match response {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        hook = %hook.name,
                        name = %notice.name,
                        status = %notice.status,
                        "webhook delivered"
                    );
                    return true;
                }
                Ok(response) => format!("status {}", response.status()),
                Err(err) => err.to_string(),
            };
            if attempt >= hook.retries {
                warn!(
                    hook = %hook.name,
                    name = %notice.name,
                    attempts = attempt + 1,
                    error = %failure,
                    "webhook delivery failed"
                );
                return false;
            }
            let delay = backoff_delay(self.backoff, attempt);
            debug!(
                hook = %hook.name,
                attempt,
                error = %failure,
                delay_ms = delay.as_millis(),
                "retrying webhook"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Exponential backoff with random jitter for retry `attempt` (zero based).
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1_u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    let jitter = rand::rng().random_range(0..=MAX_JITTER_MS);
    base.saturating_mul(factor) + Duration::from_millis(jitter)
}

fn command_for(hook: &CommandHookConfig) -> Option<Command> {
    if hook.shell {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&hook.command);
        return Some(command);
    }
    let mut parts = hook.command.split_whitespace();
    let mut command = Command::new(parts.next()?);
    command.args(parts);
    Some(command)
}

fn hook_env(notice: &Notice) -> Vec<(&'static str, String)> {
    let outcome = notice.outcome.as_ref();
    let new_files = outcome
        .map(|outcome| {
            outcome
                .new_files
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    vec![
        ("UN_NAME", notice.name.clone()),
        ("UN_STATUS", notice.status.as_str().to_string()),
        ("UN_PATH", notice.path.display().to_string()),
        ("UN_SOURCE", notice.source.as_str().to_string()),
        (
            "UN_ERROR",
            outcome
                .and_then(|outcome| outcome.error.clone())
                .unwrap_or_default(),
        ),
        ("UN_NEW_FILES", new_files),
        (
            "UN_BYTES",
            outcome
                .map_or(0, |outcome| outcome.bytes_written)
                .to_string(),
        ),
    ]
}

async fn run_command(hook: &CommandHookConfig, notice: &Notice) -> bool {
    let Some(mut command) = command_for(hook) else {
        warn!(hook = %hook.name, "command hook has nothing to run");
        return false;
    };
    command
        .envs(hook_env(notice))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match command.spawn() {
        Ok(child) => tokio::time::timeout(hook.timeout(), child.wait_with_output()).await,
        Err(err) => {
            warn!(hook = %hook.name, error = %err, "command hook failed to start");
            return false;
        }
    };
    match output {
        Ok(Ok(output)) if output.status.success() => {
            debug!(hook = %hook.name, name = %notice.name, "command hook finished");
            true
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                hook = %hook.name,
                name = %notice.name,
                code = ?output.status.code(),
                stderr = %stderr.trim(),
                "command hook exited with failure"
            );
            false
        }
        Ok(Err(err)) => {
            warn!(hook = %hook.name, error = %err, "command hook could not be awaited");
            false
        }
        Err(_) => {
            warn!(
                hook = %hook.name,
                timeout_secs = hook.timeout_secs,
                "command hook timed out and was killed"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use httpmock::prelude::*;
    use std::path::PathBuf;
    use unspool_core::{ExternalIds, ExtractionOutcome, ItemStatus, SourceKind};

    fn notice(status: ItemStatus) -> Notice {
        Notice {
            name: "Show.S01E01".into(),
            source: SourceKind::Sonarr,
            status,
            path: PathBuf::from("/downloads/Show.S01E01"),
            external_ids: ExternalIds::new(),
            outcome: Some(ExtractionOutcome {
                done: true,
                new_files: vec![PathBuf::from("/downloads/Show.S01E01/ep.mkv")],
                bytes_written: 42,
                ..ExtractionOutcome::default()
            }),
            at: Utc::now(),
        }
    }

    fn webhook(url: String, events: Vec<ItemStatus>, retries: u32) -> WebhookConfig {
        WebhookConfig {
            name: "test".into(),
            url,
            events,
            timeout_secs: 5,
            retries,
        }
    }

    fn cmdhook(command: &str, shell: bool) -> CommandHookConfig {
        CommandHookConfig {
            name: command.into(),
            command: command.into(),
            shell,
            events: Vec::new(),
            timeout_secs: 5,
        }
    }

    fn dispatcher(
        webhooks: Vec<WebhookConfig>,
        cmdhooks: Vec<CommandHookConfig>,
    ) -> anyhow::Result<HookDispatcher> {
        let mut dispatcher = HookDispatcher::new("nas", webhooks, cmdhooks, Metrics::new()?)?;
        dispatcher.backoff = Duration::from_millis(1);
        Ok(dispatcher)
    }

    #[test]
    fn webhook_payload_carries_instance_and_notice() -> anyhow::Result<()> {
        let notice = notice(ItemStatus::Extracted);
        let value = serde_json::to_value(WebhookPayload {
            instance: "nas",
            notice: &notice,
        })?;
        assert_eq!(value["instance"], "nas");
        assert_eq!(value["name"], "Show.S01E01");
        assert_eq!(value["status"], "extracted");
        assert_eq!(value["outcome"]["bytes_written"], 42);
        Ok(())
    }

    #[test]
    fn hook_env_exposes_outcome_fields() {
        let env = hook_env(&notice(ItemStatus::Extracted));
        let get = |key: &str| {
            env.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(get("UN_STATUS").as_deref(), Some("extracted"));
        assert_eq!(get("UN_SOURCE").as_deref(), Some("sonarr"));
        assert_eq!(get("UN_BYTES").as_deref(), Some("42"));
        assert_eq!(get("UN_ERROR").as_deref(), Some(""));
        assert_eq!(
            get("UN_NEW_FILES").as_deref(),
            Some("/downloads/Show.S01E01/ep.mkv")
        );
    }

    #[test]
    fn backoff_grows_exponentially() {
        let base = Duration::from_secs(1);
        let first = backoff_delay(base, 0);
        let third = backoff_delay(base, 2);
        assert!(first >= base && first <= base + Duration::from_millis(MAX_JITTER_MS));
        assert!(third >= base * 4);
        assert!(backoff_delay(base, 40) >= base);
    }

    #[tokio::test]
    async fn webhooks_are_filtered_by_status() -> anyhow::Result<()> {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .header("content-type", "application/json");
                then.status(204);
            })
            .await;
        let hook = webhook(server.url("/hook"), vec![ItemStatus::Extracted], 0);
        let dispatcher = dispatcher(vec![hook], Vec::new())?;

        dispatcher.deliver(&notice(ItemStatus::Extracted)).await;
        dispatcher.deliver(&notice(ItemStatus::Queued)).await;

        mock.assert_hits_async(1).await;
        assert_eq!(dispatcher.metrics.snapshot().webhooks_ok, 1);
        Ok(())
    }

    #[tokio::test]
    async fn failing_webhooks_are_retried_then_counted() -> anyhow::Result<()> {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(500);
            })
            .await;
        let hook = webhook(server.url("/hook"), Vec::new(), 2);
        let dispatcher = dispatcher(vec![hook], Vec::new())?;

        dispatcher.deliver(&notice(ItemStatus::ExtractFailed)).await;

        mock.assert_hits_async(3).await;
        let snapshot = dispatcher.metrics.snapshot();
        assert_eq!(snapshot.webhooks_ok, 0);
        assert_eq!(snapshot.webhooks_failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn command_hooks_see_the_notice_environment() -> anyhow::Result<()> {
        let dispatcher = dispatcher(
            Vec::new(),
            vec![
                cmdhook(
                    r#"test "$UN_NAME" = "Show.S01E01" && test "$UN_STATUS" = "extracted""#,
                    true,
                ),
                cmdhook("false", false),
            ],
        )?;

        dispatcher.deliver(&notice(ItemStatus::Extracted)).await;

        let snapshot = dispatcher.metrics.snapshot();
        assert_eq!(snapshot.cmdhooks_ok, 1);
        assert_eq!(snapshot.cmdhooks_failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn spawned_dispatcher_follows_the_bus_and_stops() -> anyhow::Result<()> {
        let bus = EventBus::new();
        let dispatcher = dispatcher(Vec::new(), vec![cmdhook("true", false)])?;
        let metrics = dispatcher.metrics.clone();
        let handle = dispatcher.spawn(&bus);

        bus.publish(Event::ExtractionStarted {
            name: "Show.S01E01".into(),
            queue_depth: 0,
        });
        bus.publish(Event::ItemTransition(notice(ItemStatus::Imported)));

        for _ in 0..100 {
            if metrics.snapshot().cmdhooks_ok == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(metrics.snapshot().cmdhooks_ok, 1);
        assert!(handle.shutdown(Duration::from_secs(5)).await);
        Ok(())
    }

    #[tokio::test]
    async fn lagging_dispatcher_counts_skipped_events() -> anyhow::Result<()> {
        let bus = EventBus::with_capacity(2);
        let dispatcher = dispatcher(Vec::new(), vec![cmdhook("true", false)])?;
        let metrics = dispatcher.metrics.clone();
        let handle = dispatcher.spawn(&bus);

        for n in 0..9 {
            bus.publish(Event::ExtractionStarted {
                name: format!("item-{n}"),
                queue_depth: n,
            });
        }
        bus.publish(Event::ItemTransition(notice(ItemStatus::Imported)));

        for _ in 0..100 {
            if metrics.snapshot().cmdhooks_ok == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cmdhooks_ok, 1);
        assert_eq!(snapshot.events_dropped, 8);
        assert!(handle.shutdown(Duration::from_secs(5)).await);
        Ok(())
    }
}
