//! Archive and split stage.
//!
//! A downloaded file is compressed into a single-entry zip archive, and the
//! archive is then cut into volumes no larger than the recipient's attachment
//! limit. Parts are named `<archive>.partNN` (at least two digits, starting at
//! `01`) so that concatenating them in name order restores the archive.
//!
//! Both functions are synchronous and perform blocking file I/O; async callers
//! run them on `tokio::task::spawn_blocking`.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Entries at or above this size need zip64 extensions.
const ZIP64_THRESHOLD: u64 = 0xFFFF_FFFF;

/// Errors raised while archiving or splitting.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// File system error on a source, archive, or part file.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The zip writer failed.
    #[error("failed to write archive {path}: {source}")]
    Zip {
        /// Archive being written.
        path: PathBuf,
        /// The underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },

    /// The input path has no file name component.
    #[error("path {path} has no file name")]
    NoFileName {
        /// The offending path.
        path: PathBuf,
    },

    /// A zero volume size cannot make progress.
    #[error("volume size must be greater than zero")]
    ZeroVolumeSize,
}

impl ArchiveError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Number of volumes `split` produces for a file of `total` bytes.
///
/// ```
/// use relay_core::archive::part_count;
///
/// assert_eq!(part_count(5_000_000_000, 1_983_000), 2523);
/// assert_eq!(part_count(10, 100), 1);
/// assert_eq!(part_count(100, 100), 1);
/// ```
#[must_use]
pub fn part_count(total: u64, volume_size: u64) -> u64 {
    if volume_size == 0 || total <= volume_size {
        return 1;
    }
    total.div_ceil(volume_size)
}

/// Path of the `index`-th (1-based) part of `file_path`.
///
/// ```
/// use std::path::{Path, PathBuf};
/// use relay_core::archive::part_path;
///
/// assert_eq!(part_path(Path::new("t/movie.mkv.zip"), 3), PathBuf::from("t/movie.mkv.zip.part03"));
/// assert_eq!(part_path(Path::new("t/movie.mkv.zip"), 123), PathBuf::from("t/movie.mkv.zip.part123"));
/// ```
#[must_use]
pub fn part_path(file_path: &Path, index: u64) -> PathBuf {
    let mut name = file_path.as_os_str().to_os_string();
    name.push(format!(".part{index:02}"));
    PathBuf::from(name)
}

/// Compresses `file_path` into `<file_path>.zip` and deletes the original.
///
/// The archive holds one deflate-compressed entry named after the file.
///
/// # Errors
///
/// Returns [`ArchiveError`] if reading, compressing, or removing fails. On
/// failure the original is kept and the partial archive is removed.
#[instrument(fields(file = %file_path.display()))]
pub fn archive(file_path: &Path) -> Result<PathBuf, ArchiveError> {
    let entry_name = file_path
        .file_name()
        .ok_or_else(|| ArchiveError::NoFileName {
            path: file_path.to_path_buf(),
        })?
        .to_string_lossy()
        .into_owned();

    let mut archive_name = file_path.as_os_str().to_os_string();
    archive_name.push(".zip");
    let archive_path = PathBuf::from(archive_name);

    let result = write_archive(file_path, &archive_path, entry_name);
    if result.is_err() {
        let _ = fs::remove_file(&archive_path);
    }
    result?;

    fs::remove_file(file_path).map_err(|e| ArchiveError::io(file_path, e))?;

    debug!(archive = %archive_path.display(), "archived");
    Ok(archive_path)
}

fn write_archive(
    source_path: &Path,
    archive_path: &Path,
    entry_name: String,
) -> Result<(), ArchiveError> {
    let source = File::open(source_path).map_err(|e| ArchiveError::io(source_path, e))?;
    let size = source
        .metadata()
        .map_err(|e| ArchiveError::io(source_path, e))?
        .len();
    let target = File::create(archive_path).map_err(|e| ArchiveError::io(archive_path, e))?;

    let zip_err = |source| ArchiveError::Zip {
        path: archive_path.to_path_buf(),
        source,
    };

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(size >= ZIP64_THRESHOLD);

    let mut writer = ZipWriter::new(BufWriter::new(target));
    writer.start_file(entry_name, options).map_err(zip_err)?;
    io::copy(&mut BufReader::new(source), &mut writer)
        .map_err(|e| ArchiveError::io(archive_path, e))?;
    writer
        .finish()
        .map_err(zip_err)?
        .flush()
        .map_err(|e| ArchiveError::io(archive_path, e))?;

    Ok(())
}

/// Splits `file_path` into parts of at most `volume_size` bytes.
///
/// A file smaller than `volume_size` is returned unchanged as the only
/// element. Otherwise the parts are written with reads and writes of at most
/// `buffer_size` bytes, the source is deleted, and the part paths are returned
/// in order.
///
/// # Errors
///
/// Returns [`ArchiveError::ZeroVolumeSize`] for a zero volume size, or
/// [`ArchiveError::Io`] on file system failure. On failure, parts written so
/// far are removed and the source is kept.
#[instrument(fields(file = %file_path.display()))]
pub fn split(
    file_path: &Path,
    volume_size: u64,
    buffer_size: usize,
) -> Result<Vec<PathBuf>, ArchiveError> {
    if volume_size == 0 {
        return Err(ArchiveError::ZeroVolumeSize);
    }

    let file_size = fs::metadata(file_path)
        .map_err(|e| ArchiveError::io(file_path, e))?
        .len();

    if file_size < volume_size {
        debug!(file_size, volume_size, "no split needed");
        return Ok(vec![file_path.to_path_buf()]);
    }

    let mut parts = Vec::new();
    let result = write_parts(file_path, file_size, volume_size, buffer_size.max(1), &mut parts);
    if let Err(e) = result {
        warn!(error = %e, written = parts.len(), "split failed, removing written parts");
        for part in &parts {
            let _ = fs::remove_file(part);
        }
        return Err(e);
    }

    fs::remove_file(file_path).map_err(|e| ArchiveError::io(file_path, e))?;

    info!(file_size, volume_size, parts = parts.len(), "split complete");
    Ok(parts)
}

fn write_parts(
    file_path: &Path,
    file_size: u64,
    volume_size: u64,
    buffer_size: usize,
    parts: &mut Vec<PathBuf>,
) -> Result<(), ArchiveError> {
    let mut source = File::open(file_path).map_err(|e| ArchiveError::io(file_path, e))?;
    let mut buffer = vec![0u8; buffer_size];
    let mut remaining = file_size;
    let mut index = 0u64;

    while remaining > 0 {
        index += 1;
        let path = part_path(file_path, index);
        let mut target = File::create(&path).map_err(|e| ArchiveError::io(&path, e))?;
        parts.push(path.clone());

        let mut left_in_part = remaining.min(volume_size);
        while left_in_part > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let want = left_in_part.min(buffer_size as u64) as usize;
            let read = source
                .read(&mut buffer[..want])
                .map_err(|e| ArchiveError::io(file_path, e))?;
            if read == 0 {
                return Err(ArchiveError::io(
                    file_path,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank while splitting"),
                ));
            }
            target
                .write_all(&buffer[..read])
                .map_err(|e| ArchiveError::io(&path, e))?;
            left_in_part -= read as u64;
            remaining -= read as u64;
        }

        target.flush().map_err(|e| ArchiveError::io(&path, e))?;
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Read as _;

    use tempfile::TempDir;

    use super::*;

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn pattern(len: usize) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation)]
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_part_count_matches_ceiling_division() {
        assert_eq!(part_count(10, 3), 4);
        assert_eq!(part_count(9, 3), 3);
        assert_eq!(part_count(2, 3), 1);
        assert_eq!(part_count(0, 3), 1);
    }

    #[test]
    fn test_split_small_file_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.zip", b"tiny");

        let parts = split(&path, 100, 8).unwrap();

        assert_eq!(parts, vec![path.clone()]);
        assert_eq!(fs::read(&path).unwrap(), b"tiny");
    }

    #[test]
    fn test_split_produces_bounded_parts_that_reassemble() {
        let dir = TempDir::new().unwrap();
        let content = pattern(10_007);
        let path = write_file(&dir, "movie.mkv.zip", &content);

        let parts = split(&path, 1_000, 64).unwrap();

        assert_eq!(parts.len() as u64, part_count(10_007, 1_000));
        assert_eq!(parts.len(), 11);
        assert!(!path.exists(), "source should be deleted after split");

        let mut joined = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let bytes = fs::read(part).unwrap();
            assert!(bytes.len() <= 1_000);
            if i + 1 < parts.len() {
                assert_eq!(bytes.len(), 1_000);
            }
            joined.extend_from_slice(&bytes);
        }
        assert_eq!(joined, content);
    }

    #[test]
    fn test_split_names_parts_with_two_digit_suffix() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f.zip", &pattern(25));

        let parts = split(&path, 10, 4).unwrap();

        let names: Vec<String> = parts
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["f.zip.part01", "f.zip.part02", "f.zip.part03"]);
    }

    #[test]
    fn test_split_exact_volume_size_produces_one_part() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f.zip", &pattern(10));

        let parts = split(&path, 10, 3).unwrap();

        assert_eq!(parts.len(), 1);
        assert_eq!(fs::read(&parts[0]).unwrap(), pattern(10));
        assert!(!path.exists());
    }

    #[test]
    fn test_split_exact_multiple_has_no_empty_tail() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f.zip", &pattern(30));

        let parts = split(&path, 10, 7).unwrap();

        assert_eq!(parts.len(), 3);
        for part in &parts {
            assert_eq!(fs::metadata(part).unwrap().len(), 10);
        }
    }

    #[test]
    fn test_split_zero_volume_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f.zip", b"abc");
        assert!(matches!(split(&path, 0, 4), Err(ArchiveError::ZeroVolumeSize)));
        assert!(path.exists());
    }

    #[test]
    fn test_split_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = split(&dir.path().join("missing.zip"), 10, 4);
        assert!(matches!(result, Err(ArchiveError::Io { .. })));
    }

    #[test]
    fn test_archive_replaces_file_with_zip() {
        let dir = TempDir::new().unwrap();
        let content = pattern(4_096);
        let path = write_file(&dir, "movie.mkv", &content);

        let archive_path = archive(&path).unwrap();

        assert_eq!(archive_path, dir.path().join("movie.mkv.zip"));
        assert!(!path.exists(), "original should be deleted");

        let mut zip = zip::ZipArchive::new(File::open(&archive_path).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut entry = zip.by_index(0).unwrap();
        assert_eq!(entry.name(), "movie.mkv");
        let mut restored = Vec::new();
        entry.read_to_end(&mut restored).unwrap();
        assert_eq!(restored, content);
    }

    #[test]
    fn test_archive_then_split_reassembles_to_archive() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.bin", &pattern(50_000));

        let archive_path = archive(&path).unwrap();
        let archived = fs::read(&archive_path).unwrap();
        let parts = split(&archive_path, 512, 100).unwrap();

        let joined: Vec<u8> = parts.iter().flat_map(|p| fs::read(p).unwrap()).collect();
        assert_eq!(joined, archived);
    }

    #[test]
    fn test_archive_missing_file_keeps_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.mkv");

        assert!(matches!(archive(&missing), Err(ArchiveError::Io { .. })));
        assert!(!dir.path().join("missing.mkv.zip").exists());
    }
}
