//! Concurrency-limited, delay-gated admission into extraction.
//!
//! The gate holds no queue of its own. A denied item simply stays `queued` and
//! is evaluated again on the next reconciliation tick; admitting moves it to
//! `extracting` inside the same call, so a slot can never be handed out twice.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{Ledger, Transition};
use crate::model::{ItemStatus, elapsed_since};

/// Decision returned by [`AdmissionGate::try_admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Slot granted; the item is now `extracting`.
    Admitted(Transition),
    /// Item has not been quiet for long enough.
    Settling {
        /// Time left before the item may start.
        remaining: Duration,
    },
    /// Every slot is taken.
    Saturated {
        /// Items currently extracting.
        extracting: usize,
    },
    /// Item is not waiting for a slot.
    NotQueued {
        /// Current status.
        status: ItemStatus,
    },
}

impl Admission {
    /// Whether a slot was granted.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// Start-delay and parallelism policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionGate {
    start_delay: Duration,
    parallel: usize,
}

impl AdmissionGate {
    /// Build a gate; a parallelism of zero is treated as one.
    #[must_use]
    pub fn new(start_delay: Duration, parallel: usize) -> Self {
        Self {
            start_delay,
            parallel: parallel.max(1),
        }
    }

    /// Maximum number of concurrent extractions.
    #[must_use]
    pub const fn parallel(&self) -> usize {
        self.parallel
    }

    /// Minimum quiet time before an item may start.
    #[must_use]
    pub const fn start_delay(&self) -> Duration {
        self.start_delay
    }

    /// Admit `name` when it has been settled since `settled_since` for at least
    /// the start delay and a slot is free.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownItem`] when `name` is not tracked.
    pub fn try_admit(
        &self,
        ledger: &mut Ledger,
        name: &str,
        settled_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Admission> {
        let status = ledger
            .get(name)
            .map(|item| item.status)
            .ok_or_else(|| LedgerError::UnknownItem {
                name: name.to_string(),
            })?;
        if status != ItemStatus::Queued {
            return Ok(Admission::NotQueued { status });
        }

        let settled = elapsed_since(settled_since, now);
        if settled < self.start_delay {
            return Ok(Admission::Settling {
                remaining: self.start_delay.saturating_sub(settled),
            });
        }

        let extracting = ledger.count(ItemStatus::Extracting);
        if extracting >= self.parallel {
            return Ok(Admission::Saturated { extracting });
        }

        ledger
            .transition(name, ItemStatus::Extracting, now)
            .map(Admission::Admitted)
    }
}
