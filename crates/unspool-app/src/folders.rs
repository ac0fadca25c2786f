//! Filesystem watcher for the configured folders.
//!
//! The watcher runs on notify's own thread. It drops events from our output
//! directories and from excluded paths, reduces every path to the top-level
//! child of its watch root, and forwards the result through a bounded
//! channel. A full channel blocks the watcher thread. The folder map itself
//! lives in the orchestrator.

use std::fs;
use std::path::{Component, Path, PathBuf};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use unspool_config::FolderPolicy;
use unspool_fsops::is_marker_path;

use crate::error::{AppError, AppResult};

/// Activity below a watch root, reduced to the root's direct child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEvent {
    /// Watch root the child belongs to.
    pub root: PathBuf,
    /// Direct child of the root.
    pub path: PathBuf,
}

/// Map a raw event path onto the child of the watch root that contains it.
///
/// Returns `None` for our own output directories, the roots themselves, and
/// excluded paths.
#[must_use]
pub fn normalize(policies: &[FolderPolicy], raw: &Path) -> Option<FolderEvent> {
    if is_marker_path(raw) {
        return None;
    }
    let policy = policies
        .iter()
        .filter(|policy| raw.starts_with(&policy.path))
        .max_by_key(|policy| policy.path.components().count())?;
    let relative = raw.strip_prefix(&policy.path).ok()?;
    let Some(Component::Normal(first)) = relative.components().next() else {
        return None;
    };
    let child = policy.path.join(first);
    if policy.is_excluded(raw) || policy.is_excluded(&child) {
        debug!(path = %raw.display(), "ignoring excluded path");
        return None;
    }
    Some(FolderEvent {
        root: policy.path.clone(),
        path: child,
    })
}

/// Children already present under each watch root at startup.
#[must_use]
pub fn initial_events(policies: &[FolderPolicy]) -> Vec<FolderEvent> {
    let mut events = Vec::new();
    for policy in policies {
        let entries = match fs::read_dir(&policy.path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(root = %policy.path.display(), error = %err, "failed to scan watch root");
                continue;
            }
        };
        let mut children: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        children.sort();
        events.extend(
            children
                .iter()
                .filter_map(|child| normalize(std::slice::from_ref(policy), child)),
        );
    }
    events
}

/// Handle keeping the OS watcher alive.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl FolderWatcher {
    /// Watch every folder in `policies`, forwarding normalised events to `tx`.
    ///
    /// A root that cannot be watched is skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Watcher`] when the OS watcher cannot be created.
    pub fn start(policies: &[FolderPolicy], tx: mpsc::Sender<FolderEvent>) -> AppResult<Self> {
        let routing = policies.to_vec();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => forward(&routing, &event, &tx),
                Err(err) => warn!(error = %err, "folder watcher error"),
            }
        })
        .map_err(|source| AppError::watcher("watcher.create", None, source))?;

        let mut roots = Vec::new();
        for policy in policies {
            match watcher.watch(&policy.path, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!(root = %policy.path.display(), "watching folder");
                    roots.push(policy.path.clone());
                }
                Err(source) => {
                    let err = AppError::watcher("watcher.watch", Some(policy.path.clone()), source);
                    warn!(root = %policy.path.display(), error = ?err, "skipping unwatchable folder");
                }
            }
        }
        Ok(Self {
            _watcher: watcher,
            roots,
        })
    }

    /// Roots that are actively watched.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

fn forward(policies: &[FolderPolicy], event: &notify::Event, tx: &mpsc::Sender<FolderEvent>) {
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }
    let mut last: Option<FolderEvent> = None;
    for raw in &event.paths {
        let Some(folder_event) = normalize(policies, raw) else {
            continue;
        };
        if last.as_ref() == Some(&folder_event) {
            continue;
        }
        if tx.blocking_send(folder_event.clone()).is_err() {
            debug!("folder event receiver closed");
            return;
        }
        last = Some(folder_event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(path: &str, exclude: &[&str]) -> FolderPolicy {
        FolderPolicy {
            path: PathBuf::from(path),
            delete_original: false,
            delete_files: false,
            move_back: false,
            delete_after_secs: 600,
            exclude_paths: exclude.iter().map(PathBuf::from).collect(),
            disable_recursion: false,
        }
    }

    #[test]
    fn events_reduce_to_the_top_level_child() {
        let policies = vec![policy("/watch", &[])];
        assert_eq!(
            normalize(&policies, Path::new("/watch/Show/season/ep.rar")),
            Some(FolderEvent {
                root: PathBuf::from("/watch"),
                path: PathBuf::from("/watch/Show"),
            })
        );
        assert_eq!(
            normalize(&policies, Path::new("/watch/movie.zip")).map(|event| event.path),
            Some(PathBuf::from("/watch/movie.zip"))
        );
        assert!(normalize(&policies, Path::new("/watch")).is_none());
        assert!(normalize(&policies, Path::new("/elsewhere/file")).is_none());
    }

    #[test]
    fn marker_and_excluded_paths_are_dropped() {
        let policies = vec![policy("/watch", &["/watch/incomplete", "tmp/deep"])];
        assert!(normalize(&policies, Path::new("/watch/Show_unspooled/a.mkv")).is_none());
        assert!(normalize(&policies, Path::new("/watch/incomplete")).is_none());
        assert!(normalize(&policies, Path::new("/watch/incomplete/x/y.rar")).is_none());
        assert!(normalize(&policies, Path::new("/watch/tmp/deep/a.rar")).is_none());
        assert!(normalize(&policies, Path::new("/watch/tmp/other.rar")).is_some());
    }

    #[test]
    fn nested_roots_prefer_the_deepest_match() {
        let policies = vec![policy("/data", &[]), policy("/data/watch", &[])];
        let event = normalize(&policies, Path::new("/data/watch/Show/a.rar"));
        assert_eq!(
            event.map(|event| event.root),
            Some(PathBuf::from("/data/watch"))
        );
    }

    #[test]
    fn initial_scan_lists_existing_children() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::create_dir_all(temp.path().join("Show"))?;
        fs::create_dir_all(temp.path().join("Show_unspooled"))?;
        fs::write(temp.path().join("movie.zip"), b"zip")?;
        let root = temp.path().to_path_buf();
        let mut folder = policy("/", &[]);
        folder.path.clone_from(&root);

        let events = initial_events(&[folder]);
        let paths: Vec<PathBuf> = events.into_iter().map(|event| event.path).collect();
        assert_eq!(paths, vec![root.join("Show"), root.join("movie.zip")]);
        Ok(())
    }

    #[tokio::test]
    async fn forward_deduplicates_paths_of_one_event() {
        let policies = vec![policy("/watch", &[])];
        let (tx, mut rx) = mpsc::channel(4);
        let event = notify::Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/watch/Show/a.rar"))
            .add_path(PathBuf::from("/watch/Show/b.rar"))
            .add_path(PathBuf::from("/watch/Other/c.rar"));
        let handle = tokio::task::spawn_blocking(move || forward(&policies, &event, &tx));
        assert!(handle.await.is_ok());

        let first = rx.recv().await.map(|event| event.path);
        let second = rx.recv().await.map(|event| event.path);
        assert_eq!(first, Some(PathBuf::from("/watch/Show")));
        assert_eq!(second, Some(PathBuf::from("/watch/Other")));
        assert!(rx.recv().await.is_none());
    }
}
