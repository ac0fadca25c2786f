//! Queue snapshot reconciliation.
//!
//! Snapshots are kept per server. A failed poll leaves the previous snapshot
//! in place, and an item is only considered gone from a source once every
//! server of that kind that ever answered no longer lists it. Applying the
//! same snapshots twice produces no further changes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use unspool_core::{
    ItemStatus, Ledger, LedgerResult, NewItem, QueueEntry, Retirement, SourceKind, TrackedItem,
    Transition,
};
use unspool_fsops::has_archives;

use crate::pollers::{PollResult, UpstreamServer};

/// Latest successful snapshot of every server.
#[derive(Debug, Default)]
pub(crate) struct Snapshots {
    by_server: HashMap<(SourceKind, String), Vec<QueueEntry>>,
}

impl Snapshots {
    /// Store a poll result. Failures keep the previous snapshot and return the
    /// error text.
    pub(crate) fn apply(&mut self, poll: PollResult) -> Result<usize, String> {
        match poll.result {
            Ok(entries) => {
                let count = entries.len();
                self.by_server.insert((poll.source, poll.origin), entries);
                Ok(count)
            }
            Err(message) => Err(message),
        }
    }

    fn entries(&self, source: SourceKind, origin: &str) -> Option<&[QueueEntry]> {
        self.by_server
            .get(&(source, origin.to_string()))
            .map(Vec::as_slice)
    }

    fn knows(&self, source: SourceKind) -> bool {
        self.by_server.keys().any(|(kind, _)| *kind == source)
    }

    fn lists(&self, source: SourceKind, title: &str) -> bool {
        self.by_server
            .iter()
            .filter(|((kind, _), _)| *kind == source)
            .any(|(_, entries)| entries.iter().any(|entry| entry.title == title))
    }
}

/// A ledger change made during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Change {
    /// A completed entry started being tracked.
    Tracked(String),
    /// An existing item moved along an edge.
    Moved(Transition),
    /// An item left the queue without ever producing files to clean up.
    Retired(TrackedItem, Retirement),
}

impl Change {
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Tracked(name) => name,
            Self::Moved(transition) => &transition.name,
            Self::Retired(item, _) => &item.name,
        }
    }
}

/// Walk every snapshot against the ledger.
///
/// # Errors
///
/// Only ledger invariant violations are returned; the checks before each
/// call make them unreachable in practice.
pub(crate) fn reconcile(
    ledger: &mut Ledger,
    snapshots: &Snapshots,
    servers: &[UpstreamServer],
    now: DateTime<Utc>,
) -> LedgerResult<Vec<Change>> {
    let mut changes = Vec::new();
    for server in servers {
        let Some(entries) = snapshots.entries(server.source(), server.origin()) else {
            continue;
        };
        for entry in entries {
            reconcile_entry(ledger, server, entry, now, &mut changes)?;
        }
    }
    reconcile_absent(ledger, snapshots, now, &mut changes)?;
    Ok(changes)
}

fn reconcile_entry(
    ledger: &mut Ledger,
    server: &UpstreamServer,
    entry: &QueueEntry,
    now: DateTime<Utc>,
    changes: &mut Vec<Change>,
) -> LedgerResult<()> {
    let complete = entry.is_complete(&server.config.protocols);
    let status = ledger.get(&entry.title).map(|item| (item.status, item.source));
    match status {
        None => {
            if !complete {
                return Ok(());
            }
            let Some(path) = entry.output_path.clone() else {
                debug!(name = %entry.title, "completed entry has no output path");
                return Ok(());
            };
            ledger.track(
                NewItem {
                    name: entry.title.clone(),
                    source: server.source(),
                    origin: server.origin().to_string(),
                    path,
                    external_ids: entry.external_ids.clone(),
                    retention: server.config.retention(),
                },
                now,
            )?;
            changes.push(Change::Tracked(entry.title.clone()));
            queue_if_ready(ledger, &entry.title, now, changes)
        }
        Some((ItemStatus::Imported, source)) if source == server.source() => {
            let transition = ledger.transition(&entry.title, ItemStatus::Waiting, now)?;
            debug!(name = %entry.title, "imported item reappeared in the queue");
            changes.push(Change::Moved(transition));
            Ok(())
        }
        Some((ItemStatus::Waiting, source)) if complete && source == server.source() => {
            queue_if_ready(ledger, &entry.title, now, changes)
        }
        Some(_) => Ok(()),
    }
}

fn queue_if_ready(
    ledger: &mut Ledger,
    name: &str,
    now: DateTime<Utc>,
    changes: &mut Vec<Change>,
) -> LedgerResult<()> {
    let Some(path) = ledger.get(name).map(|item| item.path.clone()) else {
        return Ok(());
    };
    match has_archives(&path) {
        Ok(true) => {
            let transition = ledger.transition(name, ItemStatus::Queued, now)?;
            changes.push(Change::Moved(transition));
        }
        Ok(false) => debug!(name, path = %path.display(), "no archives to extract"),
        Err(err) => debug!(name, error = %err.describe(), "payload not readable yet"),
    }
    Ok(())
}

fn reconcile_absent(
    ledger: &mut Ledger,
    snapshots: &Snapshots,
    now: DateTime<Utc>,
    changes: &mut Vec<Change>,
) -> LedgerResult<()> {
    let gone: Vec<(String, ItemStatus)> = ledger
        .iter()
        .filter(|item| item.source.is_upstream() && snapshots.knows(item.source))
        .filter(|item| {
            matches!(
                item.status,
                ItemStatus::Waiting | ItemStatus::ExtractFailed | ItemStatus::Extracted
            )
        })
        .filter(|item| !snapshots.lists(item.source, &item.name))
        .map(|item| (item.name.clone(), item.status))
        .collect();

    for (name, status) in gone {
        let reason = match status {
            ItemStatus::Waiting => Retirement::Vanished,
            ItemStatus::ExtractFailed => Retirement::Abandoned,
            _ => {
                let transition = ledger.transition(&name, ItemStatus::Imported, now)?;
                changes.push(Change::Moved(transition));
                continue;
            }
        };
        let item = ledger.retire(&name, reason)?;
        debug!(name = %name, status = %status, "item left the queue before extraction succeeded");
        changes.push(Change::Retired(item, reason));
    }
    Ok(())
}

/// Log a failed poll.
pub(crate) fn report_failure(source: SourceKind, origin: &str, message: &str) {
    warn!(
        source = %source,
        origin,
        error = message,
        "queue poll failed; keeping previous snapshot"
    );
}
