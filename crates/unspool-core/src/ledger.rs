//! The item ledger: one authoritative entry per name, mutated only through
//! legal lifecycle edges.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    ExternalIds, ExtractionOutcome, ItemStatus, Notice, Retention, Retirement, SourceKind,
    TrackedItem,
};

/// Data required to start tracking an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    /// Identity key.
    pub name: String,
    /// Producing subsystem.
    pub source: SourceKind,
    /// Server URL or watch root.
    pub origin: String,
    /// Payload location.
    pub path: PathBuf,
    /// Identifiers forwarded to notifications.
    pub external_ids: ExternalIds,
    /// Post-import file handling.
    pub retention: Retention,
}

/// A status change applied by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// Item name.
    pub name: String,
    /// Status before the change.
    pub from: ItemStatus,
    /// Status after the change.
    pub to: ItemStatus,
    /// Time the change was applied.
    pub at: DateTime<Utc>,
}

/// Per-status counts plus the lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    per_status: [usize; ItemStatus::ORDER.len()],
    /// Items reclaimed after their deletion phase.
    pub finished: u64,
    /// Automatic re-extraction attempts started.
    pub retried: u64,
}

impl LedgerSummary {
    /// Number of items currently in `status`.
    #[must_use]
    pub fn count(&self, status: ItemStatus) -> usize {
        self.per_status.get(status.rank()).copied().unwrap_or(0)
    }

    /// Number of tracked items.
    #[must_use]
    pub fn total(&self) -> usize {
        self.per_status.iter().sum()
    }
}

/// Authoritative map of tracked items.
#[derive(Debug, Default)]
pub struct Ledger {
    items: HashMap<String, TrackedItem>,
    finished: u64,
    retried: u64,
}

impl Ledger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an item by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TrackedItem> {
        self.items.get(name)
    }

    /// Whether an item with `name` is tracked.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    /// Number of tracked items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over all tracked items in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedItem> {
        self.items.values()
    }

    /// Sorted names of the items currently in `status`.
    #[must_use]
    pub fn names_in(&self, status: ItemStatus) -> Vec<String> {
        let mut names: Vec<String> = self
            .items
            .values()
            .filter(|item| item.status == status)
            .map(|item| item.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of items currently in `status`.
    #[must_use]
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items
            .values()
            .filter(|item| item.status == status)
            .count()
    }

    /// Items reclaimed after their deletion phase.
    #[must_use]
    pub const fn finished(&self) -> u64 {
        self.finished
    }

    /// Automatic re-extraction attempts started.
    #[must_use]
    pub const fn retried(&self) -> u64 {
        self.retried
    }

    /// Per-status counts and counters.
    #[must_use]
    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary {
            finished: self.finished,
            retried: self.retried,
            ..LedgerSummary::default()
        };
        for item in self.items.values() {
            if let Some(slot) = summary.per_status.get_mut(item.status.rank()) {
                *slot += 1;
            }
        }
        summary
    }

    /// Notification describing the current state of `name`.
    #[must_use]
    pub fn notice(&self, name: &str) -> Option<Notice> {
        self.items.get(name).map(Notice::from_item)
    }

    /// Start tracking a new item at `waiting`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DuplicateItem`] when the name is already tracked.
    pub fn track(&mut self, item: NewItem, now: DateTime<Utc>) -> LedgerResult<&TrackedItem> {
        self.insert_waiting(item, 0, now)
    }

    /// Move `name` along one lifecycle edge.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownItem`] or [`LedgerError::InvalidTransition`].
    pub fn transition(
        &mut self,
        name: &str,
        to: ItemStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<Transition> {
        let item = self.item_mut(name)?;
        let from = item.status;
        if !from.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                name: name.to_string(),
                from,
                to,
            });
        }
        item.status = to;
        item.updated_at = now;
        Ok(Transition {
            name: name.to_string(),
            from,
            to,
            at: now,
        })
    }

    /// Attach an engine outcome to an `extracting` item and move it to
    /// `extracted` or `extract_failed`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownItem`] or [`LedgerError::InvalidTransition`]
    /// when the item is not extracting.
    pub fn record_outcome(
        &mut self,
        name: &str,
        outcome: ExtractionOutcome,
        now: DateTime<Utc>,
    ) -> LedgerResult<Transition> {
        let to = if outcome.succeeded() {
            ItemStatus::Extracted
        } else {
            ItemStatus::ExtractFailed
        };
        let transition = self.transition(name, to, now)?;
        self.item_mut(name)?.result = Some(outcome);
        Ok(transition)
    }

    /// Remove `name` from the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownItem`] or [`LedgerError::InvalidRetirement`]
    /// when `reason` does not apply to the current status.
    pub fn retire(&mut self, name: &str, reason: Retirement) -> LedgerResult<TrackedItem> {
        let status = self.item_mut(name)?.status;
        if !reason.permits(status) {
            return Err(LedgerError::InvalidRetirement {
                name: name.to_string(),
                status,
                reason,
            });
        }
        let item = self
            .items
            .remove(name)
            .ok_or_else(|| LedgerError::UnknownItem {
                name: name.to_string(),
            })?;
        if reason == Retirement::Reclaimed {
            self.finished += 1;
        }
        Ok(item)
    }

    /// Replace an `extract_failed` item with a fresh `waiting` one carrying an
    /// incremented retry count.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownItem`] or [`LedgerError::InvalidRetirement`]
    /// when the item has not failed.
    pub fn requeue_failed(
        &mut self,
        name: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<&TrackedItem> {
        let previous = self.retire(name, Retirement::Retry)?;
        self.retried += 1;
        let item = NewItem {
            name: previous.name,
            source: previous.source,
            origin: previous.origin,
            path: previous.path,
            external_ids: previous.external_ids,
            retention: previous.retention,
        };
        self.insert_waiting(item, previous.retry_count + 1, now)
    }

    fn insert_waiting(
        &mut self,
        item: NewItem,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> LedgerResult<&TrackedItem> {
        if let Some(existing) = self.items.get(&item.name) {
            return Err(LedgerError::DuplicateItem {
                name: item.name,
                status: existing.status,
            });
        }
        let name = item.name.clone();
        let tracked = TrackedItem {
            name: item.name,
            source: item.source,
            origin: item.origin,
            path: item.path,
            external_ids: item.external_ids,
            status: ItemStatus::Waiting,
            updated_at: now,
            result: None,
            retry_count,
            retention: item.retention,
        };
        Ok(self.items.entry(name).or_insert(tracked))
    }

    fn item_mut(&mut self, name: &str) -> LedgerResult<&mut TrackedItem> {
        self.items
            .get_mut(name)
            .ok_or_else(|| LedgerError::UnknownItem {
                name: name.to_string(),
            })
    }
}
