//! Best-effort removal of archives and extracted files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::FsOpsError;

/// What a removal pass managed to do.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Paths that were removed.
    pub removed: Vec<PathBuf>,
    /// Paths that could not be removed.
    pub failures: Vec<FsOpsError>,
}

impl CleanupReport {
    /// Every path was removed or already absent.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Summary of the failures, `None` when clean.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let details: Vec<String> = self.failures.iter().map(FsOpsError::describe).collect();
        Some(details.join("; "))
    }
}

/// Remove every path in `paths`; directories are removed recursively.
///
/// Missing paths count as removed. A failure on one path never stops the
/// remaining removals.
#[must_use]
pub fn remove_paths(paths: &[PathBuf]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for path in paths {
        let result = match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "removed");
                report.removed.push(path.clone());
            }
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                report.removed.push(path.clone());
            }
            Err(source) => {
                warn!(path = %path.display(), error = %source, "failed to remove path");
                report
                    .failures
                    .push(FsOpsError::io("cleanup.remove", path, source));
            }
        }
    }
    report
}

/// Remove empty directories below `root` deepest first, then `root` itself
/// when it ended up empty. Non-empty directories are left alone.
pub fn prune_empty_dirs(root: &Path) {
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_dir() => Some(entry.into_path()),
            Ok(_) => None,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "failed to walk directory while pruning");
                None
            }
        })
        .collect();
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        if let Err(err) = fs::remove_dir(&dir)
            && err.kind() != io::ErrorKind::NotFound
        {
            debug!(path = %dir.display(), error = %err, "directory kept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_paths_handles_files_directories_and_missing_paths() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let file = temp.path().join("movie.mkv");
        let dir = temp.path().join("extras");
        fs::write(&file, b"video")?;
        fs::create_dir_all(dir.join("nested"))?;
        fs::write(dir.join("nested").join("note.nfo"), b"junk")?;

        let report = remove_paths(&[file.clone(), dir.clone(), temp.path().join("gone")]);
        assert!(report.is_clean());
        assert_eq!(report.removed.len(), 3);
        assert!(report.error_message().is_none());
        assert!(!file.exists());
        assert!(!dir.exists());
        Ok(())
    }

    #[test]
    fn prune_keeps_directories_with_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("out");
        fs::create_dir_all(root.join("empty").join("deeper"))?;
        fs::create_dir_all(root.join("full"))?;
        fs::write(root.join("full").join("keep.txt"), b"1")?;

        prune_empty_dirs(&root);
        assert!(!root.join("empty").exists());
        assert!(root.join("full").join("keep.txt").exists());

        fs::remove_file(root.join("full").join("keep.txt"))?;
        prune_empty_dirs(&root);
        assert!(!root.exists());
        Ok(())
    }
}
