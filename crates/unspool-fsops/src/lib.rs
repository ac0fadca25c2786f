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

//! Filesystem side of extraction: archive discovery, decoding, nested
//! passes, move-back and best-effort deletion, plus the worker pool that
//! implements [`unspool_core::ExtractionEngine`].
//!
//! # Design
//! - Discovery selects exactly one first volume per multi-part set.
//! - Output always lands in a marked sibling directory first so a consumer
//!   never sees a half-written folder.
//! - Failures become message values; nothing here panics on bad input.

pub mod cleanup;
pub mod diff;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod extract;
pub mod pipeline;

/// Suffix of the temporary output directories; watchers ignore paths that
/// carry it.
pub const MARKER_SUFFIX: &str = "_unspooled";

pub use cleanup::{CleanupReport, prune_empty_dirs, remove_paths};
pub use diff::{difference, snapshot};
pub use discovery::{
    ArchiveKind, ArchiveName, Volume, classify, find_archives, has_archives, is_marker_path,
    volume_set,
};
pub use engine::FsOpsEngine;
pub use error::{FsOpsError, FsOpsResult};
pub use extract::extract_archive;
pub use pipeline::{ExtractionJob, run};
