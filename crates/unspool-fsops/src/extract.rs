//! Native archive decoding.

use std::fs::{self, File};
use std::io::{self, Read};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;
use zip::ZipArchive;

use crate::discovery::{ArchiveKind, classify};
use crate::error::{FsOpsError, FsOpsResult};

/// Extract `source` into `target` and return the number of bytes written.
///
/// # Errors
///
/// Returns [`FsOpsError::Unsupported`] for rar and 7z sets, and IO or archive
/// errors for corrupt input or unwritable destinations.
pub fn extract_archive(source: &Path, target: &Path) -> FsOpsResult<u64> {
    let Some(name) = classify(source) else {
        return Err(FsOpsError::InvalidInput {
            field: "archive",
            reason: "not an archive",
            value: Some(source.display().to_string()),
        });
    };
    fs::create_dir_all(target)
        .map_err(|source_err| FsOpsError::io("extract.create_target", target, source_err))?;
    match name.kind {
        ArchiveKind::Zip => extract_zip(source, target),
        ArchiveKind::Tar => {
            let file = open(source)?;
            extract_tar(source, file, target)
        }
        ArchiveKind::TarGz => {
            let file = open(source)?;
            extract_tar(source, GzDecoder::new(file), target)
        }
        ArchiveKind::Rar | ArchiveKind::SevenZip => Err(FsOpsError::Unsupported {
            operation: "extract",
            path: source.to_path_buf(),
        }),
    }
}

fn open(source: &Path) -> FsOpsResult<File> {
    File::open(source).map_err(|source_err| FsOpsError::io("extract.open", source, source_err))
}

fn extract_zip(source: &Path, target: &Path) -> FsOpsResult<u64> {
    let file = open(source)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|source_err| FsOpsError::zip("extract_zip.decode", source, source_err))?;

    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|source_err| FsOpsError::zip("extract_zip.read_entry", source, source_err))?;
        let destination = target.join(sanitize_archive_path(entry.name())?);

        if entry.name().ends_with('/') {
            fs::create_dir_all(&destination).map_err(|source_err| {
                FsOpsError::io("extract_zip.create_dir", &destination, source_err)
            })?;
            continue;
        }

        written += write_entry(&mut entry, &destination)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            apply_mode(&destination, mode)?;
        }
    }
    Ok(written)
}

fn extract_tar<R: Read>(source: &Path, reader: R, target: &Path) -> FsOpsResult<u64> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|source_err| FsOpsError::io("extract_tar.entries", source, source_err))?;

    let mut written = 0;
    for entry in entries {
        let mut entry =
            entry.map_err(|source_err| FsOpsError::io("extract_tar.read_entry", source, source_err))?;
        let entry_name = entry
            .path()
            .map_err(|source_err| FsOpsError::io("extract_tar.entry_path", source, source_err))?
            .to_string_lossy()
            .into_owned();
        let destination = target.join(sanitize_archive_path(&entry_name)?);
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            fs::create_dir_all(&destination).map_err(|source_err| {
                FsOpsError::io("extract_tar.create_dir", &destination, source_err)
            })?;
            continue;
        }
        if !entry_type.is_file() {
            debug!(entry = %entry_name, "skipping non-regular tar entry");
            continue;
        }

        written += write_entry(&mut entry, &destination)?;

        #[cfg(unix)]
        if let Ok(mode) = entry.header().mode() {
            apply_mode(&destination, mode)?;
        }
    }
    Ok(written)
}

fn write_entry(entry: &mut impl Read, destination: &Path) -> FsOpsResult<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .map_err(|source_err| FsOpsError::io("extract.create_parent", parent, source_err))?;
    }
    let mut output = File::create(destination)
        .map_err(|source_err| FsOpsError::io("extract.create_file", destination, source_err))?;
    io::copy(entry, &mut output)
        .map_err(|source_err| FsOpsError::io("extract.copy", destination, source_err))
}

#[cfg(unix)]
fn apply_mode(destination: &Path, mode: u32) -> FsOpsResult<()> {
    fs::set_permissions(destination, fs::Permissions::from_mode(mode))
        .map_err(|source_err| FsOpsError::io("extract.set_permissions", destination, source_err))
}

/// Reject absolute entries and any segment that would leave the target.
pub(crate) fn sanitize_archive_path(entry: &str) -> FsOpsResult<PathBuf> {
    let path = Path::new(entry);
    if path.is_absolute() {
        return Err(FsOpsError::InvalidInput {
            field: "archive_entry",
            reason: "absolute_path",
            value: Some(entry.to_string()),
        });
    }

    let mut sanitized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => sanitized.push(segment),
            Component::CurDir => {}
            _ => {
                return Err(FsOpsError::InvalidInput {
                    field: "archive_entry",
                    reason: "invalid_segment",
                    value: Some(entry.to_string()),
                });
            }
        }
    }
    if sanitized.as_os_str().is_empty() {
        return Err(FsOpsError::InvalidInput {
            field: "archive_entry",
            reason: "empty_path",
            value: Some(entry.to_string()),
        });
    }
    Ok(sanitized)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    type TestResult<T> = anyhow::Result<T>;

    pub(crate) fn write_zip_archive(archive: &Path, entries: &[(&str, &[u8])]) -> TestResult<()> {
        if let Some(parent) = archive.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(archive)?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options)?;
            writer.write_all(contents)?;
        }
        writer.finish()?;
        Ok(())
    }

    pub(crate) fn write_tar_gz_archive(
        archive: &Path,
        entries: &[(&str, &[u8])],
    ) -> TestResult<()> {
        let file = File::create(archive)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents)?;
        }
        builder.into_inner()?.finish()?;
        Ok(())
    }

    #[test]
    fn sanitize_archive_path_rejects_unsafe_inputs() -> TestResult<()> {
        assert!(sanitize_archive_path("/abs/path").is_err());
        assert!(sanitize_archive_path("../escape").is_err());
        assert!(sanitize_archive_path("./").is_err());
        let normalised = sanitize_archive_path("nested/./file.txt")?;
        assert_eq!(normalised, PathBuf::from("nested/file.txt"));
        Ok(())
    }

    #[test]
    fn zip_entries_are_written_with_byte_count() -> TestResult<()> {
        let temp = tempfile::tempdir()?;
        let archive = temp.path().join("bundle.zip");
        write_zip_archive(&archive, &[("movie.mkv", b"video"), ("subs/en.srt", b"subs")])?;

        let target = temp.path().join("out");
        let written = extract_archive(&archive, &target)?;
        assert_eq!(written, 9);
        assert_eq!(fs::read(target.join("movie.mkv"))?, b"video");
        assert_eq!(fs::read(target.join("subs").join("en.srt"))?, b"subs");
        Ok(())
    }

    #[test]
    fn tar_gz_entries_are_written() -> TestResult<()> {
        let temp = tempfile::tempdir()?;
        let archive = temp.path().join("bundle.tar.gz");
        write_tar_gz_archive(&archive, &[("album/track01.flac", b"audio")])?;

        let target = temp.path().join("out");
        assert_eq!(extract_archive(&archive, &target)?, 5);
        assert_eq!(fs::read(target.join("album").join("track01.flac"))?, b"audio");
        Ok(())
    }

    #[test]
    fn rar_sets_are_reported_as_unsupported() -> TestResult<()> {
        let temp = tempfile::tempdir()?;
        let archive = temp.path().join("movie.rar");
        fs::write(&archive, b"Rar!")?;
        assert!(matches!(
            extract_archive(&archive, &temp.path().join("out")),
            Err(FsOpsError::Unsupported { .. })
        ));
        Ok(())
    }

    #[test]
    fn corrupt_zip_is_a_zip_error() -> TestResult<()> {
        let temp = tempfile::tempdir()?;
        let archive = temp.path().join("broken.zip");
        fs::write(&archive, b"not a zip")?;
        assert!(matches!(
            extract_archive(&archive, &temp.path().join("out")),
            Err(FsOpsError::Zip { .. })
        ));
        Ok(())
    }
}
