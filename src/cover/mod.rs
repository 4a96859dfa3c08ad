//! Self-healing creator covers.
//!
//! Every creator directory holds a hidden `.covers` cache with one image per
//! gallery and exactly one root-level `cover.<ext>` symlink pointing into it,
//! at the cover of the latest (highest-id) gallery entry. [`CoverResolver`]
//! restores that link from the cheapest source available:
//!
//! 1. the `.covers` cache (by entry name, then by id),
//! 2. the latest entry's own first page when it is still a directory,
//! 3. another creator's cache holding the same gallery,
//! 4. the network, through the [`GallerySource`] and a [`MirrorDownloader`].
//!
//! Relinking never leaves the creator without a cover: a temporary symlink is
//! created, stale `cover.*` entries are removed, and the temporary link is
//! renamed onto `cover.<ext>`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::download::MirrorDownloader;
use crate::fs_util::{dotted_extension, sibling_temp_path, sorted_entry_names, symlink_file};
use crate::gallery::{GalleryEntry, GalleryIdentity, GallerySource, latest_gallery_entry};

/// Hidden per-creator cover cache directory.
pub const COVERS_DIR: &str = ".covers";

/// Extension used when a cover URL has none.
const DEFAULT_COVER_EXTENSION: &str = ".jpg";

/// Errors raised while repairing a cover. Logged, never propagated by
/// [`CoverResolver::ensure_cover`].
#[derive(Debug, Error)]
pub enum CoverError {
    /// Filesystem error.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The blocking filesystem task panicked or was cancelled.
    #[error("cover task failed: {0}")]
    Task(String),
}

impl CoverError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Where a linked cover came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverSource {
    /// Already present in this creator's `.covers`.
    Cache,
    /// Copied from the latest entry's first page.
    FirstPage,
    /// Copied from another creator's `.covers`.
    SharedCache,
    /// Downloaded from the gallery source.
    Network,
}

/// Result of a cover repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverOutcome {
    /// No `"(ID) NAME"` entries, missing directory, or dry run.
    NothingToDo,
    /// `link` now points at `target` (relative, inside `.covers`).
    Linked {
        /// The `cover.<ext>` symlink.
        link: PathBuf,
        /// The relative symlink target.
        target: PathBuf,
        /// Which fallback step produced the cover.
        source: CoverSource,
    },
    /// Every step was tried and no cover could be found or fetched.
    Unavailable,
    /// A filesystem error interrupted the repair.
    Failed,
}

impl CoverOutcome {
    /// True when a cover link is in place.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        matches!(self, Self::Linked { .. })
    }
}

/// Outcome of the local (non-network) steps.
enum LocalResolution {
    NothingToDo,
    Linked(CoverOutcome),
    NeedsNetwork(GalleryEntry),
}

/// Maintains `cover.<ext>` links for creator directories.
pub struct CoverResolver {
    library_root: PathBuf,
    source: Option<Arc<dyn GallerySource>>,
    downloader: Option<MirrorDownloader>,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    dry_run: bool,
}

impl std::fmt::Debug for CoverResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverResolver")
            .field("library_root", &self.library_root)
            .field("network", &(self.source.is_some() && self.downloader.is_some()))
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl CoverResolver {
    /// Creates a resolver that only uses local sources.
    #[must_use]
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: library_root.into(),
            source: None,
            downloader: None,
            locks: DashMap::new(),
            dry_run: false,
        }
    }

    /// Enables the network step.
    #[must_use]
    pub fn with_network(mut self, source: Arc<dyn GallerySource>, downloader: MirrorDownloader) -> Self {
        self.source = Some(source);
        self.downloader = Some(downloader);
        self
    }

    /// In dry-run mode nothing is linked, copied or fetched.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The library this resolver searches for shared covers.
    #[must_use]
    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    fn lock_for(&self, creator_dir: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(creator_dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Restores the creator's cover link. Idempotent; failures are logged.
    #[instrument(skip_all, fields(creator = %creator_dir.display()))]
    pub async fn ensure_cover(&self, creator_dir: &Path) -> CoverOutcome {
        if self.dry_run {
            info!("[DRY RUN] would repair cover");
            return CoverOutcome::NothingToDo;
        }
        let lock = self.lock_for(creator_dir);
        let _guard = lock.lock().await;
        self.ensure_cover_locked(creator_dir).await
    }

    /// Caches a freshly downloaded gallery's first page and relinks.
    ///
    /// The page is copied into `.covers` only when the gallery is newer than
    /// every cached cover; the normal resolution then picks whichever entry is
    /// latest.
    #[instrument(skip_all, fields(creator = %creator_dir.display(), gallery = %gallery_dir.display()))]
    pub async fn store_gallery_cover(&self, creator_dir: &Path, gallery_dir: &Path) -> CoverOutcome {
        if self.dry_run {
            info!("[DRY RUN] would store gallery cover");
            return CoverOutcome::NothingToDo;
        }
        let lock = self.lock_for(creator_dir);
        let _guard = lock.lock().await;

        let creator = creator_dir.to_path_buf();
        let gallery = gallery_dir.to_path_buf();
        let stored = tokio::task::spawn_blocking(move || cache_first_page_if_newer(&creator, &gallery))
            .await
            .map_err(|e| CoverError::Task(e.to_string()))
            .and_then(|result| result);
        match stored {
            Ok(Some(cached)) => debug!(cover = %cached.display(), "extracted gallery cover"),
            Ok(None) => debug!("gallery cover not newer than cache"),
            Err(e) => warn!(error = %e, "could not extract gallery cover"),
        }

        self.ensure_cover_locked(creator_dir).await
    }

    async fn ensure_cover_locked(&self, creator_dir: &Path) -> CoverOutcome {
        let creator = creator_dir.to_path_buf();
        let library_root = self.library_root.clone();
        let local = tokio::task::spawn_blocking(move || resolve_local(&creator, &library_root))
            .await
            .map_err(|e| CoverError::Task(e.to_string()))
            .and_then(|result| result);

        let latest = match local {
            Ok(LocalResolution::NothingToDo) => return CoverOutcome::NothingToDo,
            Ok(LocalResolution::Linked(outcome)) => return outcome,
            Ok(LocalResolution::NeedsNetwork(latest)) => latest,
            Err(e) => {
                warn!(error = %e, "failed to restore cover");
                return CoverOutcome::Failed;
            }
        };

        match self.fetch_from_network(creator_dir, &latest).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(gallery = latest.identity.id, error = %e, "failed to download missing cover");
                CoverOutcome::Failed
            }
        }
    }

    async fn fetch_from_network(
        &self,
        creator_dir: &Path,
        latest: &GalleryEntry,
    ) -> Result<CoverOutcome, CoverError> {
        let (Some(source), Some(downloader)) = (&self.source, &self.downloader) else {
            debug!(gallery = latest.identity.id, "no local cover and no gallery source configured");
            return Ok(CoverOutcome::Unavailable);
        };

        debug!(gallery = latest.identity.id, "cover not found locally; downloading");
        let Some(meta) = source.fetch_gallery_metadata(latest.identity.id).await else {
            warn!(gallery = latest.identity.id, "gallery metadata unavailable for cover");
            return Ok(CoverOutcome::Unavailable);
        };
        let urls = source.fetch_image_urls(&meta, 1).await;
        let Some(url) = urls.into_iter().next() else {
            warn!(gallery = latest.identity.id, "no image URL for cover");
            return Ok(CoverOutcome::Unavailable);
        };

        let file_name = format!("{}{}", latest.entry_name, extension_from_url(&url));
        let target = creator_dir.join(COVERS_DIR).join(&file_name);
        if !downloader.download(std::slice::from_ref(&url), &target).await {
            return Ok(CoverOutcome::Unavailable);
        }

        let relative = Path::new(COVERS_DIR).join(&file_name);
        let creator = creator_dir.to_path_buf();
        let link = tokio::task::spawn_blocking(move || link_cover(&creator, &file_name))
            .await
            .map_err(|e| CoverError::Task(e.to_string()))??;
        info!(gallery = latest.identity.id, link = %link.display(), "cover updated (downloaded)");
        Ok(CoverOutcome::Linked {
            link,
            target: relative,
            source: CoverSource::Network,
        })
    }
}

/// Extension of the URL path including the dot, `.jpg` when absent.
fn extension_from_url(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let last = path.rsplit('/').next().unwrap_or_default();
    let ext = dotted_extension(last);
    if ext.is_empty() {
        DEFAULT_COVER_EXTENSION.to_string()
    } else {
        ext
    }
}

fn is_cover_link_name(name: &str) -> bool {
    name == "cover" || name.starts_with("cover.")
}

/// Cached cover for `latest`: by name prefix first, then by id.
fn find_cached(covers_dir: &Path, latest: &GalleryEntry) -> Option<String> {
    let names: Vec<String> = sorted_entry_names(covers_dir)
        .into_iter()
        .filter(|name| covers_dir.join(name).is_file())
        .collect();
    names
        .iter()
        .find(|name| name.starts_with(&latest.entry_name))
        .or_else(|| {
            names
                .iter()
                .find(|name| GalleryIdentity::parse_id(name) == Some(latest.identity.id))
        })
        .cloned()
}

/// First file named `1.*` in a gallery directory.
fn first_page(gallery_dir: &Path) -> Option<String> {
    sorted_entry_names(gallery_dir)
        .into_iter()
        .find(|name| name.starts_with("1.") && gallery_dir.join(name).is_file())
}

/// Cover for the same gallery id in any other creator's cache.
fn find_shared(library_root: &Path, creator_dir: &Path, latest: &GalleryEntry) -> Option<PathBuf> {
    for creator in sorted_entry_names(library_root) {
        let other = library_root.join(&creator);
        if other == creator_dir || !other.is_dir() {
            continue;
        }
        let covers = other.join(COVERS_DIR);
        if let Some(name) = find_cached(&covers, latest) {
            return Some(covers.join(name));
        }
    }
    None
}

fn copy_into_cache(source: &Path, covers_dir: &Path, file_name: &str) -> Result<(), CoverError> {
    let dest = covers_dir.join(file_name);
    if dest.exists() {
        return Ok(());
    }
    let temp = sibling_temp_path(&dest);
    fs::copy(source, &temp)
        .and_then(|_| fs::rename(&temp, &dest))
        .map_err(|e| {
            let _ = fs::remove_file(&temp);
            CoverError::io(&dest, e)
        })
}

/// Runs the cache, first-page and shared-cache steps.
fn resolve_local(creator_dir: &Path, library_root: &Path) -> Result<LocalResolution, CoverError> {
    if !creator_dir.is_dir() {
        return Ok(LocalResolution::NothingToDo);
    }
    let Some(latest) = latest_gallery_entry(creator_dir) else {
        return Ok(LocalResolution::NothingToDo);
    };

    let covers_dir = creator_dir.join(COVERS_DIR);
    fs::create_dir_all(&covers_dir).map_err(|e| CoverError::io(&covers_dir, e))?;

    let linked = |file_name: &str, source: CoverSource| -> Result<LocalResolution, CoverError> {
        let link = link_cover(creator_dir, file_name)?;
        Ok(LocalResolution::Linked(CoverOutcome::Linked {
            target: Path::new(COVERS_DIR).join(file_name),
            link,
            source,
        }))
    };

    if let Some(cached) = find_cached(&covers_dir, &latest) {
        debug!(cover = %cached, "cover found in .covers");
        return linked(&cached, CoverSource::Cache);
    }

    if latest.is_dir {
        let gallery_dir = creator_dir.join(&latest.entry_name);
        if let Some(page) = first_page(&gallery_dir) {
            let file_name = format!("{}{}", latest.entry_name, dotted_extension(&page));
            debug!(page = %page, "copying first page into .covers");
            copy_into_cache(&gallery_dir.join(&page), &covers_dir, &file_name)?;
            return linked(&file_name, CoverSource::FirstPage);
        }
    }

    if let Some(shared) = find_shared(library_root, creator_dir, &latest) {
        let ext = shared
            .file_name()
            .map(|n| dotted_extension(&n.to_string_lossy()))
            .unwrap_or_default();
        let file_name = format!("{}{ext}", latest.entry_name);
        debug!(shared = %shared.display(), "copying cover from another creator");
        copy_into_cache(&shared, &covers_dir, &file_name)?;
        return linked(&file_name, CoverSource::SharedCache);
    }

    Ok(LocalResolution::NeedsNetwork(latest))
}

/// Copies the gallery's first page into `.covers` when it is newer than every cached cover.
fn cache_first_page_if_newer(creator_dir: &Path, gallery_dir: &Path) -> Result<Option<PathBuf>, CoverError> {
    let Some(gallery_name) = gallery_dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(None);
    };
    let Some(gallery_id) = GalleryIdentity::parse_id(&gallery_name) else {
        return Ok(None);
    };
    let Some(page) = first_page(gallery_dir) else {
        return Ok(None);
    };

    let covers_dir = creator_dir.join(COVERS_DIR);
    let latest_cached = sorted_entry_names(&covers_dir)
        .iter()
        .filter_map(|name| GalleryIdentity::parse_id(name))
        .max();
    if latest_cached.is_some_and(|cached| gallery_id <= cached) {
        return Ok(None);
    }

    fs::create_dir_all(&covers_dir).map_err(|e| CoverError::io(&covers_dir, e))?;
    let file_name = format!("{gallery_name}{}", dotted_extension(&page));
    copy_into_cache(&gallery_dir.join(&page), &covers_dir, &file_name)?;
    Ok(Some(covers_dir.join(file_name)))
}

/// Points `cover<ext>` at `.covers/<file_name>`, removing every other `cover.*`.
fn link_cover(creator_dir: &Path, file_name: &str) -> Result<PathBuf, CoverError> {
    let link_name = format!("cover{}", dotted_extension(file_name));
    let link = creator_dir.join(&link_name);
    let target = Path::new(COVERS_DIR).join(file_name);

    let others: Vec<String> = sorted_entry_names(creator_dir)
        .into_iter()
        .filter(|name| is_cover_link_name(name) && *name != link_name)
        .collect();
    let already_linked = fs::read_link(&link).is_ok_and(|current| current == target);
    if already_linked && others.is_empty() {
        return Ok(link);
    }

    let temp = sibling_temp_path(&link);
    symlink_file(&target, &temp).map_err(|e| CoverError::io(&temp, e))?;

    for name in others {
        let stale = creator_dir.join(&name);
        if let Err(e) = fs::remove_file(&stale) {
            debug!(path = %stale.display(), error = %e, "could not remove old cover file");
        }
    }

    if let Err(e) = fs::rename(&temp, &link) {
        let _ = fs::remove_file(&temp);
        return Err(CoverError::io(&link, e));
    }
    info!(link = %link.display(), target = %target.display(), "cover updated");
    Ok(link)
}
