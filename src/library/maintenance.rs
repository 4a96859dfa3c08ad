//! Library-wide cleanup and cover repair passes.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::cover::CoverResolver;
use crate::fs_util::{is_broken_symlink, sorted_entry_names};

/// Counts from [`clean_library`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Empty directories removed.
    pub removed_dirs: usize,
    /// Dangling symlinks removed.
    pub removed_symlinks: usize,
    /// Creators whose cover was (re)linked.
    pub covers_linked: usize,
}

#[derive(Debug, Default)]
struct PruneResult {
    removed_dirs: usize,
    removed_symlinks: usize,
    creator_dirs: Vec<PathBuf>,
}

/// Bottom-up prune of `root`. The root itself is never removed.
///
/// With `remove_empty_creators`, any directory that is empty by the time it is
/// visited goes, so a creator whose galleries were all removed goes too.
/// Without it, only directories that were empty before the walk reached them
/// are removed.
fn prune(root: &Path, remove_empty_creators: bool) -> PruneResult {
    let mut result = PruneResult::default();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .contents_first(true)
        .sort_by_file_name();

    let mut had_children: HashSet<PathBuf> = HashSet::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "could not read library entry");
                continue;
            }
        };
        let path = entry.path();
        if let Some(parent) = path.parent() {
            had_children.insert(parent.to_path_buf());
        }

        if entry.path_is_symlink() {
            if is_broken_symlink(path) {
                match fs::remove_file(path) {
                    Ok(()) => {
                        info!(path = %path.display(), "removed broken symlink");
                        result.removed_symlinks += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove broken symlink"),
                }
            }
            continue;
        }
        if !entry.file_type().is_dir() {
            continue;
        }

        let is_empty = if remove_empty_creators {
            sorted_entry_names(path).is_empty()
        } else {
            !had_children.contains(path)
        };
        if is_empty {
            match fs::remove_dir(path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed empty directory");
                    result.removed_dirs += 1;
                    continue;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove empty directory"),
            }
        }
        if path.parent() == Some(root) {
            result.creator_dirs.push(path.to_path_buf());
        }
    }
    result
}

/// Removes empty directories and broken symlinks, then repairs every
/// remaining creator's cover.
#[instrument(skip_all, fields(root = %root.display(), remove_empty_creators = remove_empty_creators))]
pub async fn clean_library(root: &Path, remove_empty_creators: bool, covers: &CoverResolver) -> CleanupReport {
    let mut report = CleanupReport::default();
    if !root.is_dir() {
        debug!("library root missing; skipping cleanup");
        return report;
    }

    let walk_root = root.to_path_buf();
    let pruned = match tokio::task::spawn_blocking(move || prune(&walk_root, remove_empty_creators)).await {
        Ok(pruned) => pruned,
        Err(e) => {
            warn!(error = %e, "cleanup task failed");
            return report;
        }
    };
    report.removed_dirs = pruned.removed_dirs;
    report.removed_symlinks = pruned.removed_symlinks;

    for creator_dir in &pruned.creator_dirs {
        if covers.ensure_cover(creator_dir).await.is_linked() {
            report.covers_linked += 1;
        }
    }
    if report.removed_symlinks > 0 {
        info!(count = report.removed_symlinks, "fixed broken symlinks");
    }
    info!(removed_dirs = report.removed_dirs, "library scan complete");
    report
}

fn has_cover_file(creator_dir: &Path) -> bool {
    sorted_entry_names(creator_dir)
        .iter()
        .any(|name| name.starts_with("cover") && creator_dir.join(name).is_file())
}

/// Runs cover repair on every creator; returns how many gained a cover.
#[instrument(skip_all, fields(root = %root.display()))]
pub async fn repair_covers(root: &Path, covers: &CoverResolver) -> usize {
    let mut repaired = 0;
    for name in sorted_entry_names(root) {
        let creator_dir = root.join(name);
        if !creator_dir.is_dir() {
            continue;
        }
        let before = has_cover_file(&creator_dir);
        covers.ensure_cover(&creator_dir).await;
        if !before && has_cover_file(&creator_dir) {
            repaired += 1;
        }
    }
    debug!(repaired, "cover repair pass complete");
    repaired
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fs_util::symlink_file;
    use crate::test_support::creator_with_galleries;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_clean_library_removes_empty_dirs_and_broken_links() {
        let root = TempDir::new().unwrap();
        let alice = creator_with_galleries(root.path(), "Alice", &["(5) Foo"]);
        fs::create_dir_all(alice.join("(6) Empty")).unwrap();
        symlink_file(Path::new(".covers/(1) Gone.jpg"), &alice.join("cover.jpg")).unwrap();
        fs::create_dir_all(root.path().join("Ghost").join("(9) Nothing")).unwrap();

        let resolver = CoverResolver::new(root.path());
        let report = clean_library(root.path(), true, &resolver).await;

        assert!(root.path().is_dir());
        assert!(!alice.join("(6) Empty").exists());
        assert!(!root.path().join("Ghost").exists());
        assert_eq!(report.removed_dirs, 3);
        assert_eq!(report.removed_symlinks, 1);
        assert_eq!(report.covers_linked, 1);
        assert_eq!(
            fs::read_link(alice.join("cover.jpg")).unwrap(),
            PathBuf::from(".covers/(5) Foo.jpg")
        );
    }

    #[tokio::test]
    async fn test_clean_library_keeps_emptied_creators_when_asked() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("Ghost").join("(9) Nothing")).unwrap();

        let resolver = CoverResolver::new(root.path());
        let report = clean_library(root.path(), false, &resolver).await;

        assert_eq!(report.removed_dirs, 1);
        assert!(root.path().join("Ghost").is_dir());
    }

    #[tokio::test]
    async fn test_repair_covers_counts_new_covers_only() {
        let root = TempDir::new().unwrap();
        creator_with_galleries(root.path(), "Alice", &["(5) Foo"]);
        creator_with_galleries(root.path(), "Bob", &["(8) Bar"]);
        let resolver = CoverResolver::new(root.path());

        assert_eq!(repair_covers(root.path(), &resolver).await, 2);
        assert_eq!(repair_covers(root.path(), &resolver).await, 0);
    }
}
