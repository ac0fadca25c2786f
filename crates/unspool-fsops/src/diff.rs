//! File-set snapshots used to report what an extraction wrote.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{FsOpsError, FsOpsResult};

/// Every regular file below `dir`. A missing directory is an empty snapshot.
///
/// # Errors
///
/// Returns an error when an existing directory cannot be traversed.
pub fn snapshot(dir: &Path) -> FsOpsResult<BTreeSet<PathBuf>> {
    if !dir.exists() {
        return Ok(BTreeSet::new());
    }
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|source| FsOpsError::walkdir("snapshot.walk", dir, source))?;
        if entry.file_type().is_file() {
            files.insert(entry.into_path());
        }
    }
    Ok(files)
}

/// Paths present in `after` but not in `before`, in sorted order.
#[must_use]
pub fn difference(before: &BTreeSet<PathBuf>, after: &BTreeSet<PathBuf>) -> Vec<PathBuf> {
    after.difference(before).cloned().collect()
}
