//! Central event loop.
//!
//! The [`Orchestrator`] exclusively owns the ledger and the folder map. Pollers,
//! the folder watcher, the extraction engine and cleanup jobs only talk to it
//! through the bounded channels of its [`Inbox`]; every message is handled to
//! completion before the next one is taken.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use unspool_config::{AppConfig, FolderPolicy};
use unspool_core::{
    Admission, AdmissionGate, ExternalIds, ExtractionEngine, ExtractionOutcome, ExtractionRequest,
    ExtractionUpdate, FolderStep, ItemStatus, Ledger, NewItem, NotificationSink, Retirement,
    RetryPolicy, SourceKind, TrackedItem, WatchedFolder,
};
use unspool_events::{Event, EventBus};
use unspool_fsops::{CleanupReport, has_archives, is_marker_path, remove_paths, volume_set};
use unspool_telemetry::Metrics;

use crate::folders::FolderEvent;
use crate::pollers::{self, PollResult, UpstreamServer};
use crate::reconcile::{self, Change, Snapshots};

/// Capacity of every channel feeding the loop.
pub const CHANNEL_CAPACITY: usize = 256;

/// Timing and concurrency policy of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// Quiet time before an item may start extracting.
    pub start_delay: Duration,
    /// Maximum concurrent extractions.
    pub parallel: usize,
    /// Automatic retry policy for failed extractions.
    pub retry: RetryPolicy,
    /// Interval of the aging checks.
    pub reconcile_interval: Duration,
    /// Interval between upstream poll cycles.
    pub poll_interval: Duration,
    /// Interval between status lines.
    pub status_interval: Duration,
}

impl LoopSettings {
    /// Settings taken from a validated configuration.
    #[must_use]
    pub const fn from_config(config: &AppConfig) -> Self {
        Self {
            start_delay: config.start_delay(),
            parallel: config.parallel,
            retry: config.retry_policy(),
            reconcile_interval: config.reconcile_interval(),
            poll_interval: config.poll_interval(),
            status_interval: config.status_interval(),
        }
    }
}

/// Receiving ends of the loop's channels.
pub struct Inbox {
    updates: mpsc::Receiver<ExtractionUpdate>,
    polls: mpsc::Receiver<Vec<PollResult>>,
    folders: mpsc::Receiver<FolderEvent>,
    cleanups: mpsc::Receiver<CleanupDone>,
}

/// Result of a background deletion job.
#[derive(Debug)]
struct CleanupDone {
    name: String,
    error: Option<String>,
}

/// Files a deletion job removes.
#[derive(Debug, Default, PartialEq, Eq)]
struct CleanupPlan {
    paths: Vec<PathBuf>,
    archives: Vec<PathBuf>,
}

/// Owner of all lifecycle state.
pub struct Orchestrator {
    ledger: Ledger,
    folders: BTreeMap<PathBuf, WatchedFolder>,
    snapshots: Snapshots,
    servers: Arc<[UpstreamServer]>,
    policies: Vec<FolderPolicy>,
    gate: AdmissionGate,
    settings: LoopSettings,
    engine: Arc<dyn ExtractionEngine>,
    events: EventBus,
    metrics: Metrics,
    updates_tx: mpsc::Sender<ExtractionUpdate>,
    polls_tx: mpsc::Sender<Vec<PollResult>>,
    folders_tx: mpsc::Sender<FolderEvent>,
    cleanups_tx: mpsc::Sender<CleanupDone>,
    polling: bool,
}

impl Orchestrator {
    /// Build the loop state and the channels that feed it.
    #[must_use]
    pub fn new(
        settings: LoopSettings,
        servers: Vec<UpstreamServer>,
        policies: Vec<FolderPolicy>,
        engine: Arc<dyn ExtractionEngine>,
        events: EventBus,
        metrics: Metrics,
    ) -> (Self, Inbox) {
        let (updates_tx, updates) = mpsc::channel(CHANNEL_CAPACITY);
        let (polls_tx, polls) = mpsc::channel(CHANNEL_CAPACITY);
        let (folders_tx, folders) = mpsc::channel(CHANNEL_CAPACITY);
        let (cleanups_tx, cleanups) = mpsc::channel(CHANNEL_CAPACITY);
        let orchestrator = Self {
            ledger: Ledger::new(),
            folders: BTreeMap::new(),
            snapshots: Snapshots::default(),
            servers: Arc::from(servers),
            policies,
            gate: AdmissionGate::new(settings.start_delay, settings.parallel),
            settings,
            engine,
            events,
            metrics,
            updates_tx,
            polls_tx,
            folders_tx,
            cleanups_tx,
            polling: false,
        };
        let inbox = Inbox {
            updates,
            polls,
            folders,
            cleanups,
        };
        (orchestrator, inbox)
    }

    /// Sender for the folder watcher.
    #[must_use]
    pub fn folder_sender(&self) -> mpsc::Sender<FolderEvent> {
        self.folders_tx.clone()
    }

    /// Current ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Number of folders being tracked.
    #[must_use]
    pub fn watched_folders(&self) -> usize {
        self.folders.len()
    }

    /// Run until `shutdown` resolves.
    pub async fn run<F>(mut self, mut inbox: Inbox, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut reconcile_tick = time::interval(self.settings.reconcile_interval);
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll_tick = time::interval(self.settings.poll_interval);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_tick = time::interval_at(
            Instant::now() + self.settings.status_interval,
            self.settings.status_interval,
        );
        tokio::pin!(shutdown);

        info!(
            servers = self.servers.len(),
            folders = self.policies.len(),
            parallel = self.gate.parallel(),
            "orchestrator started"
        );
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested; leaving the event loop");
                    break;
                }
                _ = reconcile_tick.tick() => self.on_reconcile_tick(Utc::now()),
                _ = poll_tick.tick() => self.start_poll_cycle(),
                Some(results) = inbox.polls.recv() => self.on_poll_results(results, Utc::now()),
                Some(update) = inbox.updates.recv() => self.on_extraction_update(update, Utc::now()),
                Some(event) = inbox.folders.recv() => self.on_folder_event(&event, Utc::now()),
                Some(done) = inbox.cleanups.recv() => self.on_cleanup_done(done, Utc::now()),
                _ = status_tick.tick() => self.log_status(),
            }
        }
        self.log_status();
    }

    fn start_poll_cycle(&mut self) {
        if self.servers.is_empty() {
            return;
        }
        if self.polling {
            debug!("previous poll cycle still running");
            return;
        }
        self.polling = true;
        pollers::spawn_cycle(Arc::clone(&self.servers), self.polls_tx.clone());
    }

    fn on_poll_results(&mut self, results: Vec<PollResult>, now: DateTime<Utc>) {
        self.polling = false;
        for poll in results {
            let source = poll.source;
            let origin = poll.origin.clone();
            match self.snapshots.apply(poll) {
                Ok(count) => {
                    self.metrics.inc_queue_poll(source.as_str(), true);
                    trace!(
                        source = %source,
                        origin = %origin,
                        entries = count,
                        "queue snapshot stored"
                    );
                }
                Err(message) => {
                    self.metrics.inc_queue_poll(source.as_str(), false);
                    reconcile::report_failure(source, &origin, &message);
                    self.events.publish(Event::QueuePollFailed {
                        source,
                        origin,
                        message,
                    });
                }
            }
        }

        let reconciled =
            reconcile::reconcile(&mut self.ledger, &self.snapshots, &self.servers, now);
        let changes = match reconciled {
            Ok(changes) => changes,
            Err(err) => {
                error!(error = %err, "queue reconciliation violated the ledger");
                return;
            }
        };
        for change in changes {
            match change {
                Change::Tracked(name) => {
                    info!(name = %name, "tracking completed download");
                    self.notify_status(&name, ItemStatus::Waiting);
                }
                Change::Moved(transition) => {
                    debug!(
                        name = %transition.name,
                        from = %transition.from,
                        to = %transition.to,
                        "queue change"
                    );
                    self.notify_status(&transition.name, transition.to);
                }
                Change::Retired(item, Retirement::Abandoned) => {
                    warn!(
                        name = %item.name,
                        retries = item.retry_count,
                        "failed item left the queue; giving up"
                    );
                }
                Change::Retired(item, _) => {
                    info!(name = %item.name, "item imported without extraction");
                }
            }
        }
    }

    fn on_extraction_update(&mut self, update: ExtractionUpdate, now: DateTime<Utc>) {
        match update {
            ExtractionUpdate::Started { name, queue_depth } => {
                debug!(name = %name, queue_depth, "extraction started");
                self.events
                    .publish(Event::ExtractionStarted { name, queue_depth });
            }
            ExtractionUpdate::Finished { name, outcome } => self.finish(&name, outcome, now),
        }
    }

    fn finish(&mut self, name: &str, outcome: ExtractionOutcome, now: DateTime<Utc>) {
        let succeeded = outcome.succeeded();
        let new_files = outcome.new_files.clone();
        let detail = outcome.error.clone();
        if let Err(err) = self.ledger.record_outcome(name, outcome, now) {
            warn!(name, error = %err, "dropping extraction result");
            return;
        }
        self.metrics.inc_extraction(succeeded);
        let step = if succeeded {
            info!(name, files = new_files.len(), "extraction finished");
            FolderStep::Extracted
        } else {
            warn!(name, error = detail.as_deref().unwrap_or("unknown"), "extraction failed");
            FolderStep::ExtractFailed
        };
        if let Some(folder) = self.folder_of_mut(name) {
            folder.set_step(step, now);
            folder.new_files = new_files;
        }
        self.notify(name);
    }

    fn on_folder_event(&mut self, event: &FolderEvent, now: DateTime<Utc>) {
        let name = folder_name(&event.path);
        if let Some(folder) = self.folders.get_mut(&event.path) {
            if folder.step == FolderStep::Waiting && !event.path.exists() {
                self.folders.remove(&event.path);
                match self.ledger.retire(&name, Retirement::Vanished) {
                    Ok(_) => info!(
                        path = %event.path.display(),
                        "folder removed before extraction"
                    ),
                    Err(err) => warn!(
                        path = %event.path.display(),
                        error = %err,
                        "could not retire folder"
                    ),
                }
            } else {
                folder.touch(now);
            }
            return;
        }
        if self.ledger.contains(&name) || !event.path.exists() {
            return;
        }
        let Some(policy) = self.policy_for(&event.root) else {
            debug!(root = %event.root.display(), "event for an unknown watch root");
            return;
        };
        let item = NewItem {
            name: name.clone(),
            source: SourceKind::Folder,
            origin: event.root.display().to_string(),
            path: event.path.clone(),
            external_ids: ExternalIds::new(),
            retention: policy.retention(),
        };
        if let Err(err) = self.ledger.track(item, now) {
            warn!(path = %event.path.display(), error = %err, "could not track folder");
            return;
        }
        self.folders.insert(
            event.path.clone(),
            WatchedFolder::new(event.path.clone(), event.root.clone(), now),
        );
        info!(path = %event.path.display(), "tracking new folder");
        self.notify(&name);
    }

    fn on_reconcile_tick(&mut self, now: DateTime<Utc>) {
        self.age_folders(now);
        self.age_items(now);
        self.reclaim(now);
    }

    fn age_folders(&mut self, now: DateTime<Utc>) {
        let paths: Vec<PathBuf> = self.folders.keys().cloned().collect();
        for path in paths {
            let Some(folder) = self.folders.get(&path) else {
                continue;
            };
            let name = folder_name(&path);
            let settled = folder.quiet_for(now) >= self.gate.start_delay();
            match folder.step {
                FolderStep::Waiting if settled => self.queue_folder(&path, &name, now),
                FolderStep::Queued => self.admit(&name, now),
                FolderStep::ExtractFailed => {
                    if self.requeue_if_due(&name, now) {
                        let retry_count = self.ledger.get(&name).map_or(0, |item| item.retry_count);
                        if let Some(folder) = self.folders.get_mut(&path) {
                            folder.set_step(FolderStep::Waiting, now);
                            folder.touch(now);
                            folder.retry_count = retry_count;
                        }
                    } else {
                        self.abandon_folder_if_exhausted(&path, &name, now);
                    }
                }
                FolderStep::Extracted => self.delete_folder_if_due(&path, &name, now),
                FolderStep::Waiting | FolderStep::Extracting => {}
            }
        }
    }

    fn queue_folder(&mut self, path: &Path, name: &str, now: DateTime<Utc>) {
        match has_archives(path) {
            Ok(true) => {}
            Ok(false) => {
                trace!(name, "no archives in folder yet");
                self.touch_folder(path, now);
                return;
            }
            Err(err) => {
                debug!(name, error = %err.describe(), "folder not readable yet");
                self.touch_folder(path, now);
                return;
            }
        }
        match self.ledger.transition(name, ItemStatus::Queued, now) {
            Ok(_) => {
                self.set_folder_step(path, FolderStep::Queued, now);
                self.notify(name);
                self.admit(name, now);
            }
            Err(err) => warn!(name, error = %err, "could not queue folder"),
        }
    }

    fn touch_folder(&mut self, path: &Path, now: DateTime<Utc>) {
        if let Some(folder) = self.folders.get_mut(path) {
            folder.touch(now);
        }
    }

    fn abandon_folder_if_exhausted(&mut self, path: &Path, name: &str, now: DateTime<Utc>) {
        let exhausted = self.ledger.get(name).is_some_and(|item| {
            self.settings
                .retry
                .is_exhausted(item.retry_count, item.elapsed(now))
        });
        if !exhausted {
            return;
        }
        match self.ledger.retire(name, Retirement::Abandoned) {
            Ok(item) => {
                self.folders.remove(path);
                warn!(
                    name,
                    retries = item.retry_count,
                    "folder extraction failed with no retries left; giving up"
                );
            }
            Err(err) => warn!(name, error = %err, "could not abandon folder"),
        }
    }

    fn delete_folder_if_due(&mut self, path: &Path, name: &str, now: DateTime<Utc>) {
        let Some(item) = self.ledger.get(name) else {
            return;
        };
        if item.status != ItemStatus::Extracted || item.elapsed(now) < item.retention.delete_delay
        {
            return;
        }
        for status in [ItemStatus::Imported, ItemStatus::Deleting] {
            if let Err(err) = self.ledger.transition(name, status, now) {
                warn!(name, error = %err, "could not start folder deletion");
                return;
            }
            self.notify(name);
        }
        self.folders.remove(path);
        self.start_cleanup(name);
    }

    fn age_items(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, String, ItemStatus)> = self
            .ledger
            .iter()
            .filter(|item| item.source != SourceKind::Folder)
            .map(|item| (item.updated_at, item.name.clone(), item.status))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        for (_, name, status) in due {
            match status {
                ItemStatus::Queued => self.admit(&name, now),
                ItemStatus::ExtractFailed => {
                    self.requeue_if_due(&name, now);
                }
                ItemStatus::Imported => self.delete_item_if_due(&name, now),
                _ => {}
            }
        }
    }

    fn delete_item_if_due(&mut self, name: &str, now: DateTime<Utc>) {
        let due = self
            .ledger
            .get(name)
            .is_some_and(|item| item.elapsed(now) >= item.retention.delete_delay);
        if !due {
            return;
        }
        match self.ledger.transition(name, ItemStatus::Deleting, now) {
            Ok(_) => {
                self.notify(name);
                self.start_cleanup(name);
            }
            Err(err) => warn!(name, error = %err, "could not start deletion"),
        }
    }

    fn reclaim(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .ledger
            .iter()
            .filter(|item| item.status.is_reclaimable())
            .filter(|item| item.elapsed(now) >= item.retention.delete_delay.saturating_mul(2))
            .map(|item| item.name.clone())
            .collect();
        for name in expired {
            match self.ledger.retire(&name, Retirement::Reclaimed) {
                Ok(item) => {
                    self.metrics.inc_finished();
                    debug!(name = %name, status = %item.status, "item reclaimed");
                }
                Err(err) => warn!(name = %name, error = %err, "could not reclaim item"),
            }
        }
    }

    /// Replace a failed item with a fresh waiting one when its retry is due.
    fn requeue_if_due(&mut self, name: &str, now: DateTime<Utc>) -> bool {
        let due = self.ledger.get(name).is_some_and(|item| {
            self.settings
                .retry
                .is_due(item.retry_count, item.elapsed(now))
        });
        if !due {
            return false;
        }
        match self.ledger.requeue_failed(name, now) {
            Ok(item) => {
                info!(name, attempt = item.retry_count, "retrying extraction");
                self.metrics.inc_retried();
                self.notify(name);
                true
            }
            Err(err) => {
                warn!(name, error = %err, "could not requeue item");
                false
            }
        }
    }

    fn admit(&mut self, name: &str, now: DateTime<Utc>) {
        let settled_since = match self.ledger.get(name) {
            Some(item) if item.source == SourceKind::Folder => self
                .folders
                .get(&item.path)
                .map_or(item.updated_at, |folder| folder.last_activity_at),
            Some(item) => item.updated_at,
            None => return,
        };
        match self
            .gate
            .try_admit(&mut self.ledger, name, settled_since, now)
        {
            Ok(Admission::Admitted(_)) => {
                if let Some(folder) = self.folder_of_mut(name) {
                    folder.set_step(FolderStep::Extracting, now);
                }
                self.notify(name);
                self.submit(name, now);
            }
            Ok(Admission::Settling { remaining }) => {
                trace!(name, remaining_secs = remaining.as_secs(), "settling");
            }
            Ok(Admission::Saturated { extracting }) => {
                trace!(name, extracting, "all extraction slots busy");
            }
            Ok(Admission::NotQueued { .. }) => {}
            Err(err) => warn!(name, error = %err, "admission check failed"),
        }
    }

    fn submit(&mut self, name: &str, now: DateTime<Utc>) {
        let Some(item) = self.ledger.get(name) else {
            return;
        };
        let (move_back, recursion) = if item.source == SourceKind::Folder {
            self.folders
                .get(&item.path)
                .and_then(|folder| self.policy_for(&folder.root))
                .map_or((false, true), |policy| {
                    (policy.move_back, !policy.disable_recursion)
                })
        } else {
            (true, true)
        };
        let request = ExtractionRequest {
            name: name.to_string(),
            search_path: item.path.clone(),
            move_back,
            delete_originals: false,
            recursion,
            updates: self.updates_tx.clone(),
        };
        match self.engine.submit(request) {
            Ok(queue_depth) => debug!(name, queue_depth, "submitted for extraction"),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(name, error = %message, "extraction engine refused submission");
                self.finish(name, ExtractionOutcome::failed(message), now);
            }
        }
    }

    fn start_cleanup(&self, name: &str) {
        let Some(item) = self.ledger.get(name) else {
            return;
        };
        let plan = cleanup_plan(item);
        let name = name.to_string();
        let tx = self.cleanups_tx.clone();
        debug!(
            name = %name,
            paths = plan.paths.len(),
            archives = plan.archives.len(),
            "starting deletion"
        );
        tokio::spawn(async move {
            let error = match task::spawn_blocking(move || run_cleanup(&plan)).await {
                Ok(report) => report.error_message(),
                Err(err) => Some(format!("deletion task failed: {err}")),
            };
            if tx.send(CleanupDone { name, error }).await.is_err() {
                debug!("deletion result dropped; loop has stopped");
            }
        });
    }

    fn on_cleanup_done(&mut self, done: CleanupDone, now: DateTime<Utc>) {
        let to = if let Some(message) = &done.error {
            warn!(name = %done.name, error = %message, "deletion incomplete");
            ItemStatus::DeleteFailed
        } else {
            info!(name = %done.name, "files deleted");
            ItemStatus::Deleted
        };
        match self.ledger.transition(&done.name, to, now) {
            Ok(_) => self.notify(&done.name),
            Err(err) => warn!(name = %done.name, error = %err, "dropping deletion result"),
        }
    }

    fn log_status(&self) {
        let summary = self.ledger.summary();
        for status in ItemStatus::ORDER {
            self.metrics
                .set_ledger_items(status.as_str(), summary.count(status));
        }
        self.metrics.set_watched_folders(self.folders.len());
        let counters = self.metrics.snapshot();
        info!(
            waiting = summary.count(ItemStatus::Waiting),
            queued = summary.count(ItemStatus::Queued),
            extracting = summary.count(ItemStatus::Extracting),
            failed = summary.count(ItemStatus::ExtractFailed),
            extracted = summary.count(ItemStatus::Extracted),
            imported = summary.count(ItemStatus::Imported),
            deleted = summary.count(ItemStatus::Deleted) + summary.count(ItemStatus::DeleteFailed),
            folders = self.folders.len(),
            finished = summary.finished,
            retried = summary.retried,
            webhooks_ok = counters.webhooks_ok,
            webhooks_failed = counters.webhooks_failed,
            cmdhooks_ok = counters.cmdhooks_ok,
            cmdhooks_failed = counters.cmdhooks_failed,
            events_dropped = counters.events_dropped,
            "status"
        );
    }

    fn notify(&self, name: &str) {
        if let Some(notice) = self.ledger.notice(name) {
            self.events.notify(notice);
        }
    }

    /// Notify with `status` even when the item already moved further within
    /// the same handler.
    fn notify_status(&self, name: &str, status: ItemStatus) {
        if let Some(mut notice) = self.ledger.notice(name) {
            notice.status = status;
            self.events.notify(notice);
        }
    }

    fn policy_for(&self, root: &Path) -> Option<&FolderPolicy> {
        self.policies.iter().find(|policy| policy.path == root)
    }

    fn set_folder_step(&mut self, path: &Path, step: FolderStep, now: DateTime<Utc>) {
        if let Some(folder) = self.folders.get_mut(path) {
            folder.set_step(step, now);
        }
    }

    fn folder_of_mut(&mut self, name: &str) -> Option<&mut WatchedFolder> {
        let path = self
            .ledger
            .get(name)
            .filter(|item| item.source == SourceKind::Folder)
            .map(|item| item.path.clone())?;
        self.folders.get_mut(&path)
    }
}

fn folder_name(path: &Path) -> String {
    path.display().to_string()
}

fn cleanup_plan(item: &TrackedItem) -> CleanupPlan {
    let Some(outcome) = item.result.as_ref() else {
        return CleanupPlan::default();
    };
    let mut plan = CleanupPlan::default();
    if item.retention.delete_files {
        match &outcome.output_dir {
            Some(dir) if is_marker_path(dir) => plan.paths.push(dir.clone()),
            _ => plan.paths.extend(outcome.new_files.iter().cloned()),
        }
    }
    if item.retention.delete_original {
        plan.archives.clone_from(&outcome.archives);
    }
    plan
}

fn run_cleanup(plan: &CleanupPlan) -> CleanupReport {
    let mut paths = plan.paths.clone();
    for archive in &plan.archives {
        match volume_set(archive) {
            Ok(volumes) => paths.extend(volumes),
            Err(_) => paths.push(archive.clone()),
        }
    }
    remove_paths(&paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pollers::tests::server;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::{Mutex, PoisonError};
    use unspool_core::{QueueEntry, RetryLimit};
    use unspool_events::EventStream;

    #[derive(Default)]
    struct RecordingEngine {
        requests: Mutex<Vec<ExtractionRequest>>,
        refuse: bool,
    }

    impl RecordingEngine {
        fn submitted(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|request| request.name.clone())
                .collect()
        }

        fn request(&self, index: usize) -> Option<ExtractionRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(index)
                .cloned()
        }
    }

    #[async_trait]
    impl ExtractionEngine for RecordingEngine {
        fn submit(&self, request: ExtractionRequest) -> anyhow::Result<usize> {
            if self.refuse {
                anyhow::bail!("engine is stopping");
            }
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.push(request);
            Ok(requests.len())
        }

        async fn stop(&self, _timeout: Duration) -> usize {
            0
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        inbox: Inbox,
        engine: Arc<RecordingEngine>,
        stream: EventStream,
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn settings(parallel: usize, limit: RetryLimit) -> LoopSettings {
        LoopSettings {
            start_delay: Duration::from_secs(60),
            parallel,
            retry: RetryPolicy {
                delay: Duration::from_secs(10),
                limit,
            },
            reconcile_interval: Duration::from_millis(10),
            poll_interval: Duration::from_secs(3_600),
            status_interval: Duration::from_secs(3_600),
        }
    }

    fn harness(
        settings: LoopSettings,
        servers: Vec<UpstreamServer>,
        policies: Vec<FolderPolicy>,
        engine: RecordingEngine,
    ) -> anyhow::Result<Harness> {
        let engine = Arc::new(engine);
        let events = EventBus::new();
        let stream = events.subscribe(None);
        let (orchestrator, inbox) = Orchestrator::new(
            settings,
            servers,
            policies,
            Arc::clone(&engine) as Arc<dyn ExtractionEngine>,
            events,
            Metrics::new()?,
        );
        Ok(Harness {
            orchestrator,
            inbox,
            engine,
            stream,
        })
    }

    fn status_of(harness: &Harness, name: &str) -> Option<ItemStatus> {
        harness.orchestrator.ledger().get(name).map(|item| item.status)
    }

    async fn transitions(stream: &mut EventStream) -> Vec<ItemStatus> {
        let mut statuses = Vec::new();
        while let Ok(Some(envelope)) =
            time::timeout(Duration::from_millis(50), stream.next()).await
        {
            if let Some(status) = envelope.event.status() {
                statuses.push(status);
            }
        }
        statuses
    }

    fn completed(title: &str, root: &Path) -> QueueEntry {
        QueueEntry {
            title: title.to_string(),
            status: "completed".to_string(),
            protocol: "torrent".to_string(),
            output_path: Some(root.join(title)),
            external_ids: ExternalIds::new(),
        }
    }

    fn snapshot(entries: Vec<QueueEntry>) -> Vec<PollResult> {
        vec![PollResult {
            source: SourceKind::Sonarr,
            origin: "http://sonarr".to_string(),
            result: Ok(entries),
        }]
    }

    fn sonarr() -> UpstreamServer {
        server(SourceKind::Sonarr, "http://sonarr", None, Duration::ZERO)
    }

    fn download(root: &Path, title: &str) -> anyhow::Result<PathBuf> {
        let dir = root.join(title);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!("{title}.rar")), b"rar")?;
        Ok(dir)
    }

    fn success(files: Vec<PathBuf>, output_dir: &Path) -> ExtractionOutcome {
        ExtractionOutcome {
            done: true,
            new_files: files,
            output_dir: Some(output_dir.to_path_buf()),
            ..ExtractionOutcome::default()
        }
    }

    fn folder_policy(root: &Path) -> FolderPolicy {
        FolderPolicy {
            path: root.to_path_buf(),
            delete_original: false,
            delete_files: true,
            move_back: false,
            delete_after_secs: 600,
            exclude_paths: Vec::new(),
            disable_recursion: false,
        }
    }

    #[tokio::test]
    async fn queue_item_runs_the_full_lifecycle() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = download(temp.path(), "Show.S01E01")?;
        let extracted = dir.join("episode.mkv");
        let mut h = harness(
            settings(1, RetryLimit::Limited(3)),
            vec![sonarr()],
            Vec::new(),
            RecordingEngine::default(),
        )?;
        let name = "Show.S01E01";

        h.orchestrator
            .on_poll_results(snapshot(vec![completed(name, temp.path())]), at(0));
        assert_eq!(status_of(&h, name), Some(ItemStatus::Queued));

        h.orchestrator.on_reconcile_tick(at(30));
        assert!(h.engine.submitted().is_empty());
        h.orchestrator.on_reconcile_tick(at(61));
        assert_eq!(status_of(&h, name), Some(ItemStatus::Extracting));
        let request = h.engine.request(0).ok_or_else(|| anyhow::anyhow!("no request"))?;
        assert!(request.move_back);
        assert_eq!(request.search_path, dir);

        std::fs::write(&extracted, b"video")?;
        h.orchestrator.on_extraction_update(
            ExtractionUpdate::Finished {
                name: name.to_string(),
                outcome: success(vec![extracted.clone()], &dir),
            },
            at(70),
        );
        assert_eq!(status_of(&h, name), Some(ItemStatus::Extracted));

        h.orchestrator
            .on_poll_results(snapshot(vec![completed(name, temp.path())]), at(80));
        assert_eq!(status_of(&h, name), Some(ItemStatus::Extracted));
        h.orchestrator.on_poll_results(snapshot(Vec::new()), at(100));
        assert_eq!(status_of(&h, name), Some(ItemStatus::Imported));

        h.orchestrator.on_reconcile_tick(at(399));
        assert_eq!(status_of(&h, name), Some(ItemStatus::Imported));
        h.orchestrator.on_reconcile_tick(at(400));
        assert_eq!(status_of(&h, name), Some(ItemStatus::Deleting));

        let done = h
            .inbox
            .cleanups
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("no deletion result"))?;
        h.orchestrator.on_cleanup_done(done, at(401));
        assert_eq!(status_of(&h, name), Some(ItemStatus::Deleted));
        assert!(!extracted.exists());
        assert!(dir.join("Show.S01E01.rar").exists());

        h.orchestrator.on_reconcile_tick(at(1_000));
        assert!(h.orchestrator.ledger().contains(name));
        h.orchestrator.on_reconcile_tick(at(1_001));
        assert!(!h.orchestrator.ledger().contains(name));
        assert_eq!(h.orchestrator.ledger().finished(), 1);
        assert_eq!(h.orchestrator.metrics.snapshot().finished, 1);

        assert_eq!(
            transitions(&mut h.stream).await,
            vec![
                ItemStatus::Waiting,
                ItemStatus::Queued,
                ItemStatus::Extracting,
                ItemStatus::Extracted,
                ItemStatus::Imported,
                ItemStatus::Deleting,
                ItemStatus::Deleted,
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn admission_respects_the_parallel_limit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first_dir = download(temp.path(), "A")?;
        download(temp.path(), "B")?;
        let mut h = harness(
            settings(1, RetryLimit::Limited(3)),
            vec![sonarr()],
            Vec::new(),
            RecordingEngine::default(),
        )?;
        let entries = vec![completed("A", temp.path()), completed("B", temp.path())];
        h.orchestrator.on_poll_results(snapshot(entries), at(0));

        h.orchestrator.on_reconcile_tick(at(60));
        h.orchestrator.on_reconcile_tick(at(61));
        assert_eq!(h.engine.submitted().len(), 1);
        assert_eq!(
            h.orchestrator.ledger().count(ItemStatus::Extracting),
            1
        );

        let first = h.engine.submitted()[0].clone();
        h.orchestrator.on_extraction_update(
            ExtractionUpdate::Finished {
                name: first.clone(),
                outcome: success(Vec::new(), &first_dir),
            },
            at(62),
        );
        h.orchestrator.on_reconcile_tick(at(63));
        let submitted = h.engine.submitted();
        assert_eq!(submitted.len(), 2);
        assert_ne!(submitted[0], submitted[1]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_extractions_retry_until_the_limit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        download(temp.path(), "Movie")?;
        let mut h = harness(
            settings(2, RetryLimit::Limited(1)),
            vec![sonarr()],
            Vec::new(),
            RecordingEngine::default(),
        )?;
        let entries = vec![completed("Movie", temp.path())];
        let fail = |at_secs| {
            (
                ExtractionUpdate::Finished {
                    name: "Movie".to_string(),
                    outcome: ExtractionOutcome::failed("crc mismatch"),
                },
                at(at_secs),
            )
        };

        h.orchestrator.on_poll_results(snapshot(entries.clone()), at(0));
        h.orchestrator.on_reconcile_tick(at(60));
        let (update, when) = fail(61);
        h.orchestrator.on_extraction_update(update, when);
        assert_eq!(status_of(&h, "Movie"), Some(ItemStatus::ExtractFailed));

        h.orchestrator.on_reconcile_tick(at(65));
        assert_eq!(status_of(&h, "Movie"), Some(ItemStatus::ExtractFailed));
        h.orchestrator.on_reconcile_tick(at(71));
        assert_eq!(status_of(&h, "Movie"), Some(ItemStatus::Waiting));
        assert_eq!(
            h.orchestrator.ledger().get("Movie").map(|item| item.retry_count),
            Some(1)
        );

        h.orchestrator.on_poll_results(snapshot(entries), at(72));
        h.orchestrator.on_reconcile_tick(at(132));
        assert_eq!(h.engine.submitted().len(), 2);
        let (update, when) = fail(133);
        h.orchestrator.on_extraction_update(update, when);
        h.orchestrator.on_reconcile_tick(at(1_000));
        assert_eq!(status_of(&h, "Movie"), Some(ItemStatus::ExtractFailed));
        assert_eq!(h.orchestrator.metrics.snapshot().retried, 1);
        assert_eq!(h.orchestrator.metrics.snapshot().extractions_failed, 2);
        Ok(())
    }

    #[tokio::test]
    async fn refused_submissions_fail_the_item() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        download(temp.path(), "Album")?;
        let engine = RecordingEngine {
            refuse: true,
            ..RecordingEngine::default()
        };
        let mut h = harness(
            settings(1, RetryLimit::Limited(3)),
            vec![sonarr()],
            Vec::new(),
            engine,
        )?;
        h.orchestrator
            .on_poll_results(snapshot(vec![completed("Album", temp.path())]), at(0));
        h.orchestrator.on_reconcile_tick(at(60));

        let item = h
            .orchestrator
            .ledger()
            .get("Album")
            .ok_or_else(|| anyhow::anyhow!("item missing"))?;
        assert_eq!(item.status, ItemStatus::ExtractFailed);
        let error = item.result.as_ref().and_then(|outcome| outcome.error.clone());
        assert_eq!(error.as_deref(), Some("engine is stopping"));
        Ok(())
    }

    #[tokio::test]
    async fn watched_folder_is_debounced_extracted_and_cleaned() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        let folder = root.join("Show");
        std::fs::create_dir_all(&folder)?;
        std::fs::write(folder.join("show.zip"), b"zip")?;
        let output = root.join("Show_unspooled");
        let mut h = harness(
            settings(1, RetryLimit::Limited(3)),
            Vec::new(),
            vec![folder_policy(&root)],
            RecordingEngine::default(),
        )?;
        let event = FolderEvent {
            root: root.clone(),
            path: folder.clone(),
        };
        let name = folder_name(&folder);

        h.orchestrator.on_folder_event(&event, at(0));
        assert_eq!(h.orchestrator.watched_folders(), 1);
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Waiting));

        h.orchestrator.on_folder_event(&event, at(40));
        h.orchestrator.on_reconcile_tick(at(61));
        assert!(h.engine.submitted().is_empty());
        h.orchestrator.on_reconcile_tick(at(100));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Extracting));
        let request = h.engine.request(0).ok_or_else(|| anyhow::anyhow!("no request"))?;
        assert!(!request.move_back);
        assert!(request.recursion);

        std::fs::create_dir_all(&output)?;
        std::fs::write(output.join("episode.mkv"), b"video")?;
        h.orchestrator.on_extraction_update(
            ExtractionUpdate::Finished {
                name: name.clone(),
                outcome: success(vec![output.join("episode.mkv")], &output),
            },
            at(110),
        );
        assert_eq!(
            h.orchestrator.folders.get(&folder).map(|folder| folder.step),
            Some(FolderStep::Extracted)
        );

        h.orchestrator.on_reconcile_tick(at(709));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Extracted));
        h.orchestrator.on_reconcile_tick(at(710));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Deleting));
        assert_eq!(h.orchestrator.watched_folders(), 0);

        let done = h
            .inbox
            .cleanups
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("no deletion result"))?;
        h.orchestrator.on_cleanup_done(done, at(711));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Deleted));
        assert!(!output.exists());
        assert!(folder.join("show.zip").exists());
        Ok(())
    }

    #[tokio::test]
    async fn folders_without_archives_stay_waiting() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        let folder = root.join("Loose");
        std::fs::create_dir_all(&folder)?;
        std::fs::write(folder.join("movie.mkv"), b"video")?;
        let mut h = harness(
            settings(1, RetryLimit::Limited(3)),
            Vec::new(),
            vec![folder_policy(&root)],
            RecordingEngine::default(),
        )?;
        let name = folder_name(&folder);
        h.orchestrator.on_folder_event(
            &FolderEvent {
                root: root.clone(),
                path: folder.clone(),
            },
            at(0),
        );

        h.orchestrator.on_reconcile_tick(at(61));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Waiting));
        assert!(h.engine.submitted().is_empty());

        std::fs::write(folder.join("movie.zip"), b"zip")?;
        h.orchestrator.on_reconcile_tick(at(62));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Waiting));
        h.orchestrator.on_reconcile_tick(at(121));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Extracting));
        assert_eq!(h.engine.submitted(), vec![name]);
        Ok(())
    }

    #[tokio::test]
    async fn folder_retries_settle_again_and_stop_at_the_limit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        let folder = root.join("Season");
        std::fs::create_dir_all(&folder)?;
        std::fs::write(folder.join("season.zip"), b"zip")?;
        let mut h = harness(
            settings(1, RetryLimit::Limited(1)),
            Vec::new(),
            vec![folder_policy(&root)],
            RecordingEngine::default(),
        )?;
        let name = folder_name(&folder);
        let fail = |h: &mut Harness, secs| {
            h.orchestrator.on_extraction_update(
                ExtractionUpdate::Finished {
                    name: folder_name(&folder),
                    outcome: ExtractionOutcome::failed("crc mismatch"),
                },
                at(secs),
            );
        };
        let folder_retries = |h: &Harness| {
            h.orchestrator
                .folders
                .get(&folder)
                .map(|watched| watched.retry_count)
        };

        h.orchestrator.on_folder_event(
            &FolderEvent {
                root: root.clone(),
                path: folder.clone(),
            },
            at(0),
        );
        h.orchestrator.on_reconcile_tick(at(60));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Extracting));
        fail(&mut h, 61);

        h.orchestrator.on_reconcile_tick(at(70));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::ExtractFailed));
        h.orchestrator.on_reconcile_tick(at(71));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Waiting));
        assert_eq!(
            h.orchestrator.ledger().get(&name).map(|item| item.retry_count),
            Some(1)
        );
        assert_eq!(folder_retries(&h), Some(1));

        h.orchestrator.on_reconcile_tick(at(72));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Waiting));
        assert_eq!(h.engine.submitted().len(), 1);
        h.orchestrator.on_reconcile_tick(at(131));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::Extracting));
        assert_eq!(h.engine.submitted().len(), 2);
        fail(&mut h, 132);

        h.orchestrator.on_reconcile_tick(at(141));
        assert_eq!(status_of(&h, &name), Some(ItemStatus::ExtractFailed));
        assert_eq!(h.orchestrator.watched_folders(), 1);
        h.orchestrator.on_reconcile_tick(at(142));
        assert!(!h.orchestrator.ledger().contains(&name));
        assert_eq!(h.orchestrator.watched_folders(), 0);
        assert_eq!(h.engine.submitted().len(), 2);
        assert_eq!(h.orchestrator.metrics.snapshot().retried, 1);
        assert_eq!(h.orchestrator.ledger().finished(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn folders_removed_before_extraction_are_dropped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();
        let folder = root.join("Partial");
        std::fs::create_dir_all(&folder)?;
        let mut h = harness(
            settings(1, RetryLimit::Limited(3)),
            Vec::new(),
            vec![folder_policy(&root)],
            RecordingEngine::default(),
        )?;
        let event = FolderEvent {
            root: root.clone(),
            path: folder.clone(),
        };
        h.orchestrator.on_folder_event(&event, at(0));
        std::fs::remove_dir_all(&folder)?;
        h.orchestrator.on_folder_event(&event, at(5));

        assert_eq!(h.orchestrator.watched_folders(), 0);
        assert!(h.orchestrator.ledger().is_empty());

        h.orchestrator.on_folder_event(&event, at(6));
        assert!(h.orchestrator.ledger().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_polls_are_published_and_counted() -> anyhow::Result<()> {
        let mut h = harness(
            settings(1, RetryLimit::Limited(3)),
            vec![sonarr()],
            Vec::new(),
            RecordingEngine::default(),
        )?;
        h.orchestrator.on_poll_results(
            vec![PollResult {
                source: SourceKind::Sonarr,
                origin: "http://sonarr".to_string(),
                result: Err("connection refused".to_string()),
            }],
            at(0),
        );
        let envelope = time::timeout(Duration::from_secs(1), h.stream.next()).await?;
        assert!(matches!(
            envelope.map(|envelope| envelope.event),
            Some(Event::QueuePollFailed { source: SourceKind::Sonarr, .. })
        ));
        let rendered = h.orchestrator.metrics.render()?;
        assert!(rendered.contains("result=\"failed\""));
        Ok(())
    }

    #[tokio::test]
    async fn run_polls_on_start_and_stops_on_shutdown() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        download(temp.path(), "Show")?;
        let entries = vec![completed("Show", temp.path())];
        let servers = vec![server(
            SourceKind::Sonarr,
            "http://sonarr",
            Some(entries),
            Duration::ZERO,
        )];
        let h = harness(
            settings(1, RetryLimit::Limited(3)),
            servers,
            Vec::new(),
            RecordingEngine::default(),
        )?;
        let Harness {
            orchestrator,
            inbox,
            mut stream,
            ..
        } = h;
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(orchestrator.run(inbox, async move {
            let _ = stopped.await;
        }));

        let first = time::timeout(Duration::from_secs(5), stream.next()).await?;
        assert_eq!(
            first.and_then(|envelope| envelope.event.status()),
            Some(ItemStatus::Waiting)
        );
        let _ = stop.send(());
        time::timeout(Duration::from_secs(5), running).await??;
        Ok(())
    }

    #[test]
    fn cleanup_plans_follow_retention() {
        let mut item = TrackedItem {
            name: "Show".into(),
            source: SourceKind::Folder,
            origin: "/watch".into(),
            path: PathBuf::from("/watch/Show"),
            external_ids: ExternalIds::new(),
            status: ItemStatus::Deleting,
            updated_at: at(0),
            result: Some(ExtractionOutcome {
                done: true,
                archives: vec![PathBuf::from("/watch/Show/a.part1.rar")],
                new_files: vec![PathBuf::from("/watch/Show_unspooled/a.mkv")],
                output_dir: Some(PathBuf::from("/watch/Show_unspooled")),
                ..ExtractionOutcome::default()
            }),
            retry_count: 0,
            retention: unspool_core::Retention {
                delete_delay: Duration::from_secs(60),
                delete_original: true,
                delete_files: true,
            },
        };
        let plan = cleanup_plan(&item);
        assert_eq!(plan.paths, vec![PathBuf::from("/watch/Show_unspooled")]);
        assert_eq!(plan.archives, vec![PathBuf::from("/watch/Show/a.part1.rar")]);

        item.retention.delete_files = false;
        item.retention.delete_original = false;
        assert_eq!(cleanup_plan(&item), CleanupPlan::default());

        item.result = None;
        item.retention.delete_files = true;
        assert_eq!(cleanup_plan(&item), CleanupPlan::default());
    }
}
