//! Archive discovery with multi-part first-volume selection.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::MARKER_SUFFIX;
use crate::error::{FsOpsError, FsOpsResult};

/// Archive container formats recognised by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    /// `.zip`
    Zip,
    /// `.tar`
    Tar,
    /// `.tar.gz` or `.tgz`
    TarGz,
    /// `.rar`, `.partN.rar` and legacy `.rNN` volumes.
    Rar,
    /// `.7z` and `.7z.NNN` volumes.
    SevenZip,
}

/// Position of a file inside a multi-volume set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Volume {
    /// Single-file archive or the unmarked head of a set.
    Whole,
    /// Numbered part (`.part3.rar`, `.7z.003`).
    Part(u32),
    /// Legacy rar continuation (`.r00`, `.r01`, ...).
    Legacy(u32),
}

/// Classification of an archive file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    /// Container format.
    pub kind: ArchiveKind,
    /// Lowercased name shared by every volume of the set.
    pub set: String,
    /// Volume position.
    pub volume: Volume,
}

impl ArchiveName {
    /// Whether this file starts its set. `.r00` only counts when the
    /// directory holds no `.rar` file.
    #[must_use]
    pub const fn is_first_part(&self, rar_in_dir: bool) -> bool {
        match self.volume {
            Volume::Whole => true,
            Volume::Part(number) => number == 1,
            Volume::Legacy(number) => number == 0 && !rar_in_dir,
        }
    }
}

/// Classify a file by name; `None` when it is not an archive.
#[must_use]
pub fn classify(path: &Path) -> Option<ArchiveName> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();

    if let Some(base) = name.strip_suffix(".rar") {
        return Some(match split_volume(base, ".part") {
            Some((stem, number)) => archive(ArchiveKind::Rar, stem, Volume::Part(number)),
            None => archive(ArchiveKind::Rar, base, Volume::Whole),
        });
    }
    if let Some((stem, number)) = split_volume(&name, ".7z.") {
        return Some(archive(ArchiveKind::SevenZip, stem, Volume::Part(number)));
    }
    if let Some(stem) = name.strip_suffix(".7z") {
        return Some(archive(ArchiveKind::SevenZip, stem, Volume::Whole));
    }
    if let Some((stem, number)) = split_volume(&name, ".r") {
        return Some(archive(ArchiveKind::Rar, stem, Volume::Legacy(number)));
    }

    let kind = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        ArchiveKind::TarGz
    } else if name.ends_with(".tar") {
        ArchiveKind::Tar
    } else if name.ends_with(".zip") {
        ArchiveKind::Zip
    } else {
        return None;
    };
    Some(archive(kind, &name, Volume::Whole))
}

fn archive(kind: ArchiveKind, set: &str, volume: Volume) -> ArchiveName {
    ArchiveName {
        kind,
        set: set.to_string(),
        volume,
    }
}

/// Split `movie.part01` at `.part` into `("movie", 1)`. The suffix after the
/// marker must be two or three digits for legacy rar volumes and any digit
/// run otherwise.
fn split_volume<'a>(name: &'a str, marker: &str) -> Option<(&'a str, u32)> {
    let index = name.rfind(marker)?;
    let (stem, rest) = name.split_at(index);
    let digits = &rest[marker.len()..];
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    if marker == ".r" && !(2..=3).contains(&digits.len()) {
        return None;
    }
    if stem.is_empty() {
        return None;
    }
    Some((stem, digits.parse().ok()?))
}

/// Find the first volume of every archive set under `path`.
///
/// `path` may be a directory, searched recursively while skipping our own
/// `*_unspooled` output directories, or a single archive file. Results are
/// sorted.
///
/// # Errors
///
/// Returns an error when `path` cannot be read or traversed.
pub fn find_archives(path: &Path) -> FsOpsResult<Vec<PathBuf>> {
    let metadata =
        fs::metadata(path).map_err(|source| FsOpsError::io("discover.stat", path, source))?;
    if metadata.is_file() {
        let Some(parent) = path.parent() else {
            return Ok(Vec::new());
        };
        let siblings = list_files(parent)?;
        return Ok(select_first_parts(siblings)
            .into_iter()
            .filter(|candidate| candidate == path)
            .collect());
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !(entry.file_type().is_dir() && is_marker_dir(entry.path()))
        });
    for entry in walker {
        let entry = entry.map_err(|source| FsOpsError::walkdir("discover.walk", path, source))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(select_first_parts(files))
}

/// Whether `path` holds at least one extractable archive set.
///
/// # Errors
///
/// Returns an error when `path` cannot be read or traversed.
pub fn has_archives(path: &Path) -> FsOpsResult<bool> {
    find_archives(path).map(|archives| !archives.is_empty())
}

/// Every file in the same directory belonging to the set that `first` starts.
///
/// # Errors
///
/// Returns an error when the directory cannot be listed.
pub fn volume_set(first: &Path) -> FsOpsResult<Vec<PathBuf>> {
    let (Some(parent), Some(name)) = (first.parent(), classify(first)) else {
        return Ok(vec![first.to_path_buf()]);
    };
    let mut members: Vec<PathBuf> = list_files(parent)?
        .into_iter()
        .filter(|candidate| {
            classify(candidate)
                .is_some_and(|other| other.kind == name.kind && other.set == name.set)
        })
        .collect();
    members.sort();
    Ok(members)
}

fn is_marker_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(MARKER_SUFFIX))
}

/// Whether any component of `path` is one of our output directories.
#[must_use]
pub fn is_marker_path(path: &Path) -> bool {
    path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .is_some_and(|name| name.ends_with(MARKER_SUFFIX))
    })
}

fn list_files(dir: &Path) -> FsOpsResult<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).map_err(|source| FsOpsError::io("discover.read_dir", dir, source))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| FsOpsError::io("discover.read_dir", dir, source))?;
        let file_type = entry
            .file_type()
            .map_err(|source| FsOpsError::io("discover.file_type", entry.path(), source))?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

fn select_first_parts(files: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut by_dir: BTreeMap<PathBuf, Vec<(PathBuf, ArchiveName)>> = BTreeMap::new();
    for file in files {
        if let Some(name) = classify(&file) {
            let dir = file.parent().map(Path::to_path_buf).unwrap_or_default();
            by_dir.entry(dir).or_default().push((file, name));
        }
    }

    let mut selected = Vec::new();
    for candidates in by_dir.into_values() {
        let rar_in_dir = candidates.iter().any(|(_, name)| {
            name.kind == ArchiveKind::Rar && !matches!(name.volume, Volume::Legacy(_))
        });
        selected.extend(
            candidates
                .into_iter()
                .filter(|(_, name)| name.is_first_part(rar_in_dir))
                .map(|(path, _)| path),
        );
    }
    selected.sort();
    selected
}
