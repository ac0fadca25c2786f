#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Unspool application wiring.
//!
//! Layout: `bootstrap.rs` (service wiring and shutdown), `orchestrator.rs`
//! (the event loop that owns the ledger and folder map), `reconcile.rs`
//! (queue snapshot reconciliation), `folders.rs` (filesystem watcher and
//! event normalisation), `pollers.rs` (concurrent queue polling),
//! `hooks.rs` (webhook and command hook delivery).

/// Application bootstrap.
pub mod bootstrap;
/// Command-line arguments.
pub mod cli;
/// Application error type.
pub mod error;
/// Folder watcher.
pub mod folders;
/// Notification hooks.
pub mod hooks;
/// Central event loop.
pub mod orchestrator;
/// Upstream queue pollers.
pub mod pollers;
mod reconcile;

pub use bootstrap::run_app;
pub use cli::Cli;
pub use error::{AppError, AppResult};
