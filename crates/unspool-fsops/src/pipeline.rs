//! One extraction attempt from discovery to move-back.
//!
//! The pipeline is synchronous and runs on the blocking pool. It never
//! returns an error: every failure is folded into the
//! [`ExtractionOutcome`] together with whatever file listing could be
//! collected.

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};
use unspool_core::ExtractionOutcome;
use walkdir::WalkDir;

use crate::MARKER_SUFFIX;
use crate::cleanup::{prune_empty_dirs, remove_paths};
use crate::diff::{difference, snapshot};
use crate::discovery::{find_archives, volume_set};
use crate::error::{FsOpsError, FsOpsResult};
use crate::extract::extract_archive;

/// Parameters of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionJob {
    /// File or directory searched for archives.
    pub search_path: PathBuf,
    /// Rename extracted files back next to the archives.
    pub move_back: bool,
    /// Remove archive volume sets after a successful attempt.
    pub delete_originals: bool,
    /// Extract archives that appear inside the output.
    pub recursion: bool,
    /// Maximum number of nested passes when `recursion` is set.
    pub max_depth: u32,
}

impl ExtractionJob {
    /// Directory the archives live in and extracted files move back to.
    #[must_use]
    pub fn base_dir(&self) -> PathBuf {
        if self.search_path.is_dir() {
            self.search_path.clone()
        } else {
            self.search_path
                .parent()
                .map_or_else(|| self.search_path.clone(), Path::to_path_buf)
        }
    }

    /// Sibling `<name>_unspooled` directory the archives are extracted into.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        let stem = if self.search_path.is_dir() {
            self.search_path.file_name()
        } else {
            self.search_path.file_stem()
        };
        let mut name = stem.map_or_else(|| OsString::from("archive"), OsString::from);
        name.push(MARKER_SUFFIX);
        self.search_path
            .parent()
            .map_or_else(|| PathBuf::from(&name), |parent| parent.join(&name))
    }
}

/// Run one attempt and describe what happened.
#[must_use]
pub fn run(job: &ExtractionJob) -> ExtractionOutcome {
    let started = Instant::now();
    let output_dir = job.output_dir();
    let final_dir = if job.move_back {
        job.base_dir()
    } else {
        output_dir.clone()
    };
    let mut outcome = ExtractionOutcome {
        done: true,
        output_dir: Some(final_dir.clone()),
        ..ExtractionOutcome::default()
    };

    let archives = match find_archives(&job.search_path) {
        Ok(archives) if archives.is_empty() => {
            outcome.error = Some(
                FsOpsError::NoArchives {
                    path: job.search_path.clone(),
                }
                .describe(),
            );
            outcome.elapsed = started.elapsed();
            return outcome;
        }
        Ok(archives) => archives,
        Err(err) => {
            outcome.error = Some(err.describe());
            outcome.elapsed = started.elapsed();
            return outcome;
        }
    };
    info!(
        path = %job.search_path.display(),
        archives = archives.len(),
        output = %output_dir.display(),
        "extraction started"
    );

    let before = snapshot(&output_dir).unwrap_or_else(|err| {
        warn!(error = %err.describe(), "failed to snapshot output directory");
        BTreeSet::new()
    });

    let mut failures = Vec::new();
    for archive in &archives {
        match extract_archive(archive, &output_dir) {
            Ok(bytes) => outcome.bytes_written += bytes,
            Err(err) => failures.push(err),
        }
    }
    outcome.archives = archives;

    if job.recursion && failures.is_empty() {
        extract_nested(job.max_depth, &output_dir, &mut outcome, &mut failures);
    }

    if job.move_back && failures.is_empty() {
        let (mut moved, result) = move_back(&output_dir, &final_dir);
        if let Err(err) = result {
            failures.push(err);
        }
        moved.extend(list_files(&output_dir));
        moved.sort();
        outcome.new_files = moved;
    } else {
        outcome.output_dir = Some(output_dir.clone());
        outcome.new_files = difference(&before, &list_files(&output_dir));
    }

    if job.delete_originals && failures.is_empty() {
        delete_originals(&outcome.archives);
    }

    if let Err(err) = FsOpsError::collect("extract", failures) {
        outcome.error = Some(err.describe());
    }
    outcome.elapsed = started.elapsed();
    outcome
}

fn list_files(dir: &Path) -> BTreeSet<PathBuf> {
    snapshot(dir).unwrap_or_else(|err| {
        warn!(error = %err.describe(), "failed to list extracted files");
        BTreeSet::new()
    })
}

/// Re-scan the output for archives that appeared during the previous pass
/// and extract each in place, up to `max_depth` passes.
fn extract_nested(
    max_depth: u32,
    output_dir: &Path,
    outcome: &mut ExtractionOutcome,
    failures: &mut Vec<FsOpsError>,
) {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    for depth in 1..=max_depth {
        let nested: Vec<PathBuf> = match find_archives(output_dir) {
            Ok(found) => found.into_iter().filter(|path| !seen.contains(path)).collect(),
            Err(err) => {
                failures.push(err);
                return;
            }
        };
        if nested.is_empty() {
            return;
        }
        debug!(depth, count = nested.len(), "extracting nested archives");
        for archive in nested {
            seen.insert(archive.clone());
            let target = archive
                .parent()
                .map_or_else(|| output_dir.to_path_buf(), Path::to_path_buf);
            match extract_archive(&archive, &target) {
                Ok(bytes) => {
                    outcome.bytes_written += bytes;
                    if let Ok(members) = volume_set(&archive) {
                        let report = remove_paths(&members);
                        for removed in report.removed {
                            seen.insert(removed);
                        }
                    }
                    outcome.extras.push(archive);
                }
                Err(err) => failures.push(err),
            }
        }
    }
    if find_archives(output_dir).is_ok_and(|found| found.iter().any(|path| !seen.contains(path))) {
        warn!(
            output = %output_dir.display(),
            max_depth,
            "nested archives left unextracted at the depth limit"
        );
    }
}

/// Rename every file below `from` into the same relative place below `to`.
/// Every file is attempted; the destinations that were written are returned
/// with the combined error of the renames that failed.
pub(crate) fn move_back(from: &Path, to: &Path) -> (Vec<PathBuf>, FsOpsResult<()>) {
    let mut failures = Vec::new();
    let mut files = Vec::new();
    for entry in WalkDir::new(from).follow_links(false) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(err) => failures.push(FsOpsError::walkdir("move_back.walk", from, err)),
        }
    }

    let mut moved = Vec::with_capacity(files.len());
    for file in files {
        let Ok(relative) = file.strip_prefix(from) else {
            continue;
        };
        let destination = to.join(relative);
        if let Some(parent) = destination.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            failures.push(FsOpsError::io("move_back.create_parent", parent, err));
            continue;
        }
        match fs::rename(&file, &destination) {
            Ok(()) => moved.push(destination),
            Err(err) => {
                warn!(
                    from = %file.display(),
                    to = %destination.display(),
                    error = %err,
                    "failed to move extracted file"
                );
                failures.push(FsOpsError::io("move_back.rename", &file, err));
            }
        }
    }

    prune_empty_dirs(from);
    (moved, FsOpsError::collect("move_back", failures))
}

fn delete_originals(archives: &[PathBuf]) {
    for archive in archives {
        let members = match volume_set(archive) {
            Ok(members) => members,
            Err(err) => {
                warn!(error = %err.describe(), "failed to list archive volumes");
                vec![archive.clone()]
            }
        };
        let report = remove_paths(&members);
        if let Some(message) = report.error_message() {
            warn!(archive = %archive.display(), error = %message, "failed to delete archives");
        }
    }
}
