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

//! Engine-agnostic extraction lifecycle: the ordered status table, the item
//! ledger, the admission gate, and the collaborator traits the orchestrator
//! drives.
//!
//! Layout: `model/` (status table and value objects), `ledger.rs` (the single
//! authoritative item map), `admission.rs` (concurrency and start-delay gate),
//! `service/` (extraction engine, queue client and notification contracts).

pub mod admission;
pub mod error;
pub mod ledger;
pub mod model;
pub mod service;

pub use admission::{Admission, AdmissionGate};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{Ledger, LedgerSummary, NewItem, Transition};
pub use model::{
    ExternalIds, ExtractionOutcome, FolderStep, ItemStatus, Notice, QueueEntry, Retention,
    Retirement, RetryLimit, RetryPolicy, SourceKind, TrackedItem, WatchedFolder, elapsed_since,
};
pub use service::{
    ExtractionEngine, ExtractionRequest, ExtractionUpdate, NotificationSink, QueueClient,
};
