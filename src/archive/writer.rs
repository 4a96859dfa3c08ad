//! Deflate-compressed zip/cbz writer.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use super::ArchiveError;
use crate::fs_util::sibling_temp_path;

/// Packs `source_dir` into `archive_path` on the blocking pool.
///
/// Entry names are paths relative to `source_dir` with `/` separators. The
/// archive is written to a temp file and renamed into place, so a reader only
/// ever sees a complete archive.
///
/// # Errors
///
/// Any [`ArchiveError`] from traversal or writing.
pub async fn write_archive(source_dir: PathBuf, archive_path: PathBuf) -> Result<u64, ArchiveError> {
    tokio::task::spawn_blocking(move || write_archive_blocking(&source_dir, &archive_path))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
}

fn write_archive_blocking(source_dir: &Path, archive_path: &Path) -> Result<u64, ArchiveError> {
    let temp_path = sibling_temp_path(archive_path);
    let result = pack(source_dir, &temp_path).and_then(|entries| {
        std::fs::rename(&temp_path, archive_path)
            .map(|()| entries)
            .map_err(|e| ArchiveError::io(archive_path, e))
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    if let Ok(entries) = &result {
        debug!(archive = %archive_path.display(), entries, "archive written");
    }
    result
}

fn pack(source_dir: &Path, temp_path: &Path) -> Result<u64, ArchiveError> {
    let file = File::create(temp_path).map_err(|e| ArchiveError::io(temp_path, e))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let zip_err = |source| ArchiveError::Zip {
        path: temp_path.to_path_buf(),
        source,
    };

    let mut entries = 0u64;
    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|source| ArchiveError::Walk {
            path: source_dir.to_path_buf(),
            source,
        })?;
        let Ok(relative) = entry.path().strip_prefix(source_dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options).map_err(zip_err)?;
            continue;
        }

        zip.start_file(name, options).map_err(zip_err)?;
        let mut input = File::open(entry.path()).map_err(|e| ArchiveError::io(entry.path(), e))?;
        io::copy(&mut input, &mut zip).map_err(|e| ArchiveError::io(entry.path(), e))?;
        entries += 1;
    }

    let writer = zip.finish().map_err(zip_err)?;
    let file = writer
        .into_inner()
        .map_err(|e| ArchiveError::io(temp_path, e.into_error()))?;
    file.sync_all().map_err(|e| ArchiveError::io(temp_path, e))?;
    Ok(entries)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_archive_preserves_relative_paths() {
        let root = TempDir::new().unwrap();
        let gallery = root.path().join("(5) Foo");
        std::fs::create_dir_all(gallery.join("extras")).unwrap();
        std::fs::write(gallery.join("1.jpg"), b"one").unwrap();
        std::fs::write(gallery.join("extras").join("info.txt"), b"meta").unwrap();
        let archive = root.path().join("(5) Foo.zip");

        let entries = write_archive(gallery, archive.clone()).await.unwrap();
        assert_eq!(entries, 2);

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut contents = String::new();
        zip.by_name("extras/info.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "meta");
        assert_eq!(
            zip.by_name("1.jpg").unwrap().compression(),
            CompressionMethod::Deflated
        );
    }

    #[tokio::test]
    async fn test_write_archive_missing_source_leaves_no_temp() {
        let root = TempDir::new().unwrap();
        let archive = root.path().join("(9) Gone.cbz");
        let result = write_archive(root.path().join("(9) Gone"), archive.clone()).await;
        assert!(result.is_err());
        assert!(!archive.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
