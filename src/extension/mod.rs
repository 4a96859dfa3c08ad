//! Download-pipeline extensions.
//!
//! An extension receives a fixed set of hooks from the outer scraper loop:
//! `pre_run`, `pre_batch`, `pre_gallery_download`, `during_gallery_download`,
//! `download_page` (once per page), `after_gallery_download`, `post_batch` and
//! `post_run`. Hooks never fail for per-item problems; they log and return.
//!
//! # Architecture
//!
//! - [`Extension`] - Async trait every variant implements
//! - [`ExtensionContext`] - Config plus the shared downloader, cover resolver and archive sequencer
//! - [`ExtensionRegistry`] - Name-addressed collection of extensions
//! - [`BatchSchedule`] - When post-batch maintenance is due
//! - [`SkeletonExtension`] - Library layout, covers and archiving only
//! - [`SuwayomiExtension`] - Everything the skeleton does plus catalog reconciliation
//!
//! # Example
//!
//! ```no_run
//! use scraper_extensions::{ExtensionConfig, build_default_registry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExtensionConfig::load(std::path::Path::new("extensions.conf"))?;
//! let registry = build_default_registry(config, None);
//!
//! if let Some(extension) = registry.get("suwayomi") {
//!     extension.pre_run().await?;
//!     extension.pre_batch(&[177013, 228922]).await;
//!     extension.post_batch(1, 1).await;
//!     extension.post_run().await;
//! }
//! # Ok(())
//! # }
//! ```

mod skeleton;
mod suwayomi;

pub use skeleton::SkeletonExtension;
pub use suwayomi::SuwayomiExtension;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::archive::ArchiveSequencer;
use crate::catalog::CatalogError;
use crate::config::ExtensionConfig;
use crate::cover::CoverResolver;
use crate::download::{DownloadError, MirrorDownloader, PageRequest};
use crate::gallery::{GalleryMeta, GallerySource, find_gallery_dir};
use crate::library::{clean_library, repair_covers};

/// Errors raised while building or starting an extension.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// The page downloader could not be built.
    #[error("failed to build page downloader: {0}")]
    Download(#[from] DownloadError),

    /// The catalog client could not be built.
    #[error("failed to build catalog client: {0}")]
    Catalog(#[from] CatalogError),

    /// The library root could not be created.
    #[error("could not prepare library root {path}: {source}")]
    LibraryRoot {
        /// The library root.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Hooks invoked by the scraper's download loop.
///
/// Uses `async_trait` so the registry can hold `Box<dyn Extension>`.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Lowercase name the registry addresses this extension by.
    fn name(&self) -> &str;

    /// Called once before any batch.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::LibraryRoot`] when the library root cannot be created.
    async fn pre_run(&self) -> Result<(), ExtensionError>;

    /// Called before each batch with the gallery ids it contains.
    async fn pre_batch(&self, gallery_ids: &[u64]) {
        debug!(extension = self.name(), galleries = gallery_ids.len(), "pre-batch hook called");
    }

    /// Called before a gallery starts downloading.
    async fn pre_gallery_download(&self, gallery_id: u64) {
        debug!(extension = self.name(), gallery = gallery_id, "pre-download hook called");
    }

    /// Called while a gallery is downloading.
    async fn during_gallery_download(&self, gallery_id: u64) {
        debug!(extension = self.name(), gallery = gallery_id, "during-download hook called");
    }

    /// Downloads one page; `true` when the page is on disk.
    async fn download_page(&self, request: &PageRequest) -> bool;

    /// Called once a gallery finished downloading.
    async fn after_gallery_download(&self, meta: &GalleryMeta);

    /// Called after batch `current` of `total` (1-based).
    async fn post_batch(&self, current: u64, total: u64);

    /// Called once after the last batch.
    async fn post_run(&self);
}

/// Everything an extension needs for one run.
#[derive(Debug)]
pub struct ExtensionContext {
    config: ExtensionConfig,
    downloader: MirrorDownloader,
    covers: CoverResolver,
    archive: ArchiveSequencer,
}

impl ExtensionContext {
    /// Assembles a context from already-built components.
    #[must_use]
    pub fn new(
        config: ExtensionConfig,
        downloader: MirrorDownloader,
        covers: CoverResolver,
        archive: ArchiveSequencer,
    ) -> Self {
        Self {
            config,
            downloader,
            covers,
            archive,
        }
    }

    /// Builds the shared components from configuration.
    ///
    /// With a `source`, covers missing locally are downloaded through it.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::Download`] when the HTTP client cannot be built.
    pub fn from_config(
        config: ExtensionConfig,
        source: Option<Arc<dyn GallerySource>>,
    ) -> Result<Self, ExtensionError> {
        let downloader = MirrorDownloader::from_config(&config)?;
        let mut covers = CoverResolver::new(&config.library_root).with_dry_run(config.dry_run);
        if let Some(source) = source {
            covers = covers.with_network(source, downloader.clone());
        }
        let archive = ArchiveSequencer::from_config(&config);
        Ok(Self::new(config, downloader, covers, archive))
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &ExtensionConfig {
        &self.config
    }

    /// Page downloader.
    #[must_use]
    pub fn downloader(&self) -> &MirrorDownloader {
        &self.downloader
    }

    /// Cover resolver for the library.
    #[must_use]
    pub fn covers(&self) -> &CoverResolver {
        &self.covers
    }

    /// Archive sequencer for finished galleries.
    #[must_use]
    pub fn archive(&self) -> &ArchiveSequencer {
        &self.archive
    }

    /// Creates the library root.
    async fn prepare_library_root(&self) -> Result<(), ExtensionError> {
        let root = &self.config.library_root;
        if self.config.dry_run {
            info!(path = %root.display(), "[DRY RUN] would ensure library root exists");
            return Ok(());
        }
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| ExtensionError::LibraryRoot {
                path: root.clone(),
                source,
            })?;
        debug!(path = %root.display(), "library root ready");
        Ok(())
    }

    /// Caches the gallery cover and archives each creator's copy.
    #[instrument(skip_all, fields(gallery = meta.id))]
    async fn finish_gallery(&self, meta: &GalleryMeta) {
        let format = self.config.gallery_format;
        for creator in meta.creator_dir_names() {
            let creator_dir = self.config.library_root.join(&creator);
            if !tokio::fs::metadata(&creator_dir)
                .await
                .is_ok_and(|m| m.is_dir())
            {
                debug!(creator = %creator, "creator folder missing; skipping");
                continue;
            }

            let lookup_dir = creator_dir.clone();
            let gallery_id = meta.id;
            let gallery_dir =
                match tokio::task::spawn_blocking(move || find_gallery_dir(&lookup_dir, gallery_id))
                    .await
                {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(creator = %creator, error = %e, "gallery lookup task failed");
                        None
                    }
                };

            let Some(gallery_dir) = gallery_dir else {
                debug!(creator = %creator, "gallery folder not found; repairing cover only");
                self.covers.ensure_cover(&creator_dir).await;
                continue;
            };
            self.covers.store_gallery_cover(&creator_dir, &gallery_dir).await;
            self.archive.finalize_gallery(&gallery_dir, format).await;
        }
    }

    /// Prunes the library and relinks covers.
    async fn cleanup(&self) {
        clean_library(&self.config.library_root, true, &self.covers).await;
    }

    /// Cover repair followed by cleanup.
    async fn repair_and_cleanup(&self) {
        let repaired = repair_covers(&self.config.library_root, &self.covers).await;
        if repaired > 0 {
            info!(repaired, "repaired creator covers");
        }
        self.cleanup().await;
    }
}

/// When post-batch maintenance runs.
///
/// After batch `n` of `total`, maintenance is due only if `total` does not
/// exceed `max_x_batches`, `n` is not the last batch, and `n` is a multiple
/// of `max(1, round(runs_per_x_batches * total / every_x_batches))`, rounding
/// half to even.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSchedule {
    /// Runs with more batches than this never get post-batch maintenance.
    pub max_x_batches: u64,
    /// Batch window the run count is spread over.
    pub every_x_batches: u64,
    /// Maintenance runs per window.
    pub runs_per_x_batches: u64,
}

impl BatchSchedule {
    /// Schedule of [`SkeletonExtension`].
    pub const SKELETON: Self = Self {
        max_x_batches: 1000,
        every_x_batches: 5,
        runs_per_x_batches: 2,
    };

    /// Schedule of [`SuwayomiExtension`].
    pub const SUWAYOMI: Self = Self {
        max_x_batches: 50,
        every_x_batches: 10,
        runs_per_x_batches: 1,
    };

    /// Batches between two maintenance runs for a run of `total` batches.
    #[must_use]
    pub fn interval(&self, total: u64) -> u64 {
        let numerator = self.runs_per_x_batches.saturating_mul(total);
        let denominator = self.every_x_batches.max(1);
        let quotient = numerator / denominator;
        let remainder = numerator % denominator;
        let rounded = match (remainder * 2).cmp(&denominator) {
            std::cmp::Ordering::Greater => quotient + 1,
            std::cmp::Ordering::Equal => quotient + (quotient % 2),
            std::cmp::Ordering::Less => quotient,
        };
        rounded.max(1)
    }

    /// Whether maintenance is due after batch `current` of `total`.
    #[must_use]
    pub fn should_run_post_batch(&self, current: u64, total: u64, config: &ExtensionConfig) -> bool {
        if total > self.max_x_batches || config.skip_post_batch || config.archiving {
            return false;
        }
        current != total && current % self.interval(total) == 0
    }
}

/// Extensions addressable by name.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn Extension>>,
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("extensions", &self.names())
            .finish()
    }
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an extension. A later registration with the same name replaces
    /// the earlier one.
    pub fn register(&mut self, extension: Box<dyn Extension>) {
        let name = extension.name().to_ascii_lowercase();
        if let Some(slot) = self
            .extensions
            .iter_mut()
            .find(|existing| existing.name().eq_ignore_ascii_case(&name))
        {
            warn!(extension = %name, "replacing registered extension");
            *slot = extension;
        } else {
            debug!(extension = %name, "registered extension");
            self.extensions.push(extension);
        }
    }

    /// Looks an extension up by name, ignoring ASCII case.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Extension> {
        self.extensions
            .iter()
            .find(|extension| extension.name().eq_ignore_ascii_case(name))
            .map(Box::as_ref)
    }

    /// Registered names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.extensions.iter().map(|extension| extension.name()).collect()
    }

    /// Number of registered extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

/// Builds the registry with both built-in extensions sharing one context.
///
/// Extensions whose construction fails are logged and left out.
#[must_use]
pub fn build_default_registry(
    config: ExtensionConfig,
    source: Option<Arc<dyn GallerySource>>,
) -> ExtensionRegistry {
    let mut registry = ExtensionRegistry::new();

    let context = match ExtensionContext::from_config(config, source) {
        Ok(context) => Arc::new(context),
        Err(error) => {
            warn!(error = %error, "extension context unavailable; no extensions registered");
            return registry;
        }
    };

    registry.register(Box::new(SkeletonExtension::new(Arc::clone(&context))));

    match SuwayomiExtension::from_context(context) {
        Ok(extension) => registry.register(Box::new(extension)),
        Err(error) => warn!(
            error = %error,
            "Suwayomi extension unavailable; continuing with skeleton only"
        ),
    }
    registry
}
