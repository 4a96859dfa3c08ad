//! Archive-then-delete sequencing for finished galleries.
//!
//! After a gallery finishes, each creator's copy is either kept as a directory
//! or packaged into `<creator>/<gallery name>.<zip|cbz>`. The source directory
//! is only removed once that archive has been seen on disk. When an external
//! archiver is expected to produce it, the sequencer polls for a bounded time
//! and, if nothing shows up, leaves the directory in place.

mod writer;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ExtensionConfig;

pub use writer::write_archive;

/// How finished galleries are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GalleryFormat {
    /// Keep the expanded directory.
    #[default]
    Directory,
    /// A `.zip` archive next to the directory.
    Zip,
    /// A `.cbz` archive next to the directory.
    Cbz,
}

impl GalleryFormat {
    /// Parses `directory`/`zip`/`cbz` case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "directory" | "none" => Some(Self::Directory),
            "zip" => Some(Self::Zip),
            "cbz" => Some(Self::Cbz),
            _ => None,
        }
    }

    /// Like [`GalleryFormat::parse`], but unknown values keep the directory.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|| {
            warn!(value, "unknown gallery format, treating as 'directory'");
            Self::Directory
        })
    }

    /// Archive extension including the dot; `None` for directories.
    #[must_use]
    pub fn archive_extension(self) -> Option<&'static str> {
        match self {
            Self::Directory => None,
            Self::Zip => Some(".zip"),
            Self::Cbz => Some(".cbz"),
        }
    }
}

impl fmt::Display for GalleryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Directory => "directory",
            Self::Zip => "zip",
            Self::Cbz => "cbz",
        })
    }
}

/// Who produces the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArchiveMode {
    /// Another process writes the archive; only wait for it.
    #[default]
    External,
    /// Write the archive here before deleting the directory.
    Internal,
}

impl ArchiveMode {
    /// Parses `external`/`internal` case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "external" => Some(Self::External),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Errors raised while writing an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Filesystem error while reading the gallery or writing the archive.
    #[error("IO error archiving {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The zip writer rejected an entry.
    #[error("zip error writing {path}: {source}")]
    Zip {
        /// The archive being written.
        path: PathBuf,
        /// The underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },

    /// Directory traversal failed.
    #[error("failed to walk {path}: {source}")]
    Walk {
        /// The gallery directory.
        path: PathBuf,
        /// The underlying walkdir error.
        #[source]
        source: walkdir::Error,
    },

    /// The blocking archive task panicked or was cancelled.
    #[error("archive task failed: {0}")]
    Task(String),
}

impl ArchiveError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// What happened to one creator's copy of a gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// Directory format, or nothing to archive; the directory stays.
    Kept,
    /// The archive was confirmed and the directory removed.
    Archived {
        /// Path of the confirmed archive.
        archive: PathBuf,
    },
    /// The archive never appeared; the directory stays.
    ArchiveMissing {
        /// Where the archive was expected.
        expected: PathBuf,
    },
    /// The archive exists but the directory could not be removed.
    CleanupFailed {
        /// Path of the confirmed archive.
        archive: PathBuf,
    },
}

/// Packages or waits for archives, then removes gallery directories.
#[derive(Debug, Clone)]
pub struct ArchiveSequencer {
    mode: ArchiveMode,
    wait: Duration,
    poll_interval: Duration,
    dry_run: bool,
}

impl ArchiveSequencer {
    /// Creates a sequencer with explicit timing.
    #[must_use]
    pub fn new(mode: ArchiveMode, wait: Duration, poll_interval: Duration) -> Self {
        Self {
            mode,
            wait,
            poll_interval,
            dry_run: false,
        }
    }

    /// Builds the sequencer from run configuration.
    #[must_use]
    pub fn from_config(config: &ExtensionConfig) -> Self {
        Self {
            dry_run: config.dry_run,
            ..Self::new(
                config.archive_mode,
                config.archive_wait(),
                config.archive_poll_interval(),
            )
        }
    }

    /// Path the archive for `gallery_dir` is expected at.
    #[must_use]
    pub fn expected_archive_path(gallery_dir: &Path, format: GalleryFormat) -> Option<PathBuf> {
        let ext = format.archive_extension()?;
        let name = gallery_dir.file_name()?.to_string_lossy();
        Some(gallery_dir.with_file_name(format!("{name}{ext}")))
    }

    /// Finalizes one creator's copy of a completed gallery.
    ///
    /// Never deletes `gallery_dir` unless the archive is present. Errors are
    /// logged and reflected in the outcome, never propagated.
    #[instrument(skip_all, fields(path = %gallery_dir.display(), format = %format))]
    pub async fn finalize_gallery(&self, gallery_dir: &Path, format: GalleryFormat) -> ArchiveOutcome {
        let Some(archive) = Self::expected_archive_path(gallery_dir, format) else {
            debug!("gallery format is 'directory'; keeping gallery folder");
            return ArchiveOutcome::Kept;
        };

        if !tokio::fs::metadata(gallery_dir)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            debug!("gallery is already archived or not a directory, skipping");
            return ArchiveOutcome::Kept;
        }

        if self.dry_run {
            info!(archive = %archive.display(), "[DRY RUN] would archive and remove gallery folder");
            return ArchiveOutcome::Kept;
        }

        if self.mode == ArchiveMode::Internal && !path_exists(&archive).await {
            if let Err(e) = write_archive(gallery_dir.to_path_buf(), archive.clone()).await {
                warn!(error = %e, "failed to write archive; leaving folder in place");
                return ArchiveOutcome::ArchiveMissing { expected: archive };
            }
        }

        if !self.wait_for(&archive).await {
            warn!(
                expected = %archive.display(),
                wait_secs = self.wait.as_secs_f64(),
                "archive not found in time; leaving folder undeleted"
            );
            return ArchiveOutcome::ArchiveMissing { expected: archive };
        }

        match tokio::fs::remove_dir_all(gallery_dir).await {
            Ok(()) => {
                debug!(archive = %archive.display(), "deleted original gallery folder");
                ArchiveOutcome::Archived { archive }
            }
            Err(e) => {
                error!(error = %e, "failed to delete gallery folder");
                ArchiveOutcome::CleanupFailed { archive }
            }
        }
    }

    /// Polls for `archive` until it exists or the wait elapses; checks at least once.
    async fn wait_for(&self, archive: &Path) -> bool {
        if path_exists(archive).await {
            return true;
        }
        let deadline = Instant::now() + self.wait;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return path_exists(archive).await;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            if path_exists(archive).await {
                return true;
            }
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
