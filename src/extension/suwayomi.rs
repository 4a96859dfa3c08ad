//! The Suwayomi extension: the skeleton's library upkeep plus catalog sync.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{BatchSchedule, Extension, ExtensionContext, ExtensionError};
use crate::catalog::SuwayomiClient;
use crate::download::PageRequest;
use crate::gallery::GalleryMeta;
use crate::library::{LibraryReconciler, ReconcilerOptions};

/// Keeps a Suwayomi server's local-source library in step with the downloads.
///
/// Every finished gallery's creators are looked up in the catalog and
/// attached to the managed category, or deferred until the server has
/// indexed their directory. Deferred creators are retried after batches and
/// at the end of the run.
#[derive(Debug)]
pub struct SuwayomiExtension {
    context: Arc<ExtensionContext>,
    reconciler: LibraryReconciler,
    schedule: BatchSchedule,
}

impl SuwayomiExtension {
    /// Creates the extension with an explicit reconciler.
    #[must_use]
    pub fn new(context: Arc<ExtensionContext>, reconciler: LibraryReconciler) -> Self {
        Self {
            context,
            reconciler,
            schedule: BatchSchedule::SUWAYOMI,
        }
    }

    /// Builds the GraphQL client and reconciler from the context's config.
    ///
    /// # Errors
    ///
    /// [`ExtensionError::Catalog`] when the catalog client cannot be built.
    pub fn from_context(context: Arc<ExtensionContext>) -> Result<Self, ExtensionError> {
        let client = SuwayomiClient::from_config(context.config())?;
        let reconciler = LibraryReconciler::new(
            Arc::new(client),
            ReconcilerOptions::from_config(context.config()),
        );
        Ok(Self::new(context, reconciler))
    }

    /// Overrides the post-batch schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: BatchSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// The reconciler driving catalog updates.
    #[must_use]
    pub fn reconciler(&self) -> &LibraryReconciler {
        &self.reconciler
    }

    fn dry_run(&self) -> bool {
        self.context.config().dry_run
    }

    async fn prepare_catalog(&self) {
        if let Err(e) = self.reconciler.prepare().await {
            warn!(error = %e, "catalog not ready; new creators will be deferred");
        }
    }
}

#[async_trait]
impl Extension for SuwayomiExtension {
    fn name(&self) -> &'static str {
        "suwayomi"
    }

    #[instrument(skip_all, fields(extension = "suwayomi"))]
    async fn pre_run(&self) -> Result<(), ExtensionError> {
        self.context.prepare_library_root().await?;
        if self.dry_run() {
            info!("[DRY RUN] would resolve local source and category");
            return Ok(());
        }
        self.prepare_catalog().await;
        Ok(())
    }

    #[instrument(skip_all, fields(extension = "suwayomi", galleries = gallery_ids.len()))]
    async fn pre_batch(&self, gallery_ids: &[u64]) {
        if self.dry_run() {
            info!("[DRY RUN] pre-batch hook inactive");
            return;
        }
        self.prepare_catalog().await;
    }

    async fn download_page(&self, request: &PageRequest) -> bool {
        self.context.downloader().download_page(request).await
    }

    #[instrument(skip_all, fields(extension = "suwayomi", gallery = meta.id))]
    async fn after_gallery_download(&self, meta: &GalleryMeta) {
        if self.dry_run() {
            info!("[DRY RUN] post-download hook inactive");
            return;
        }
        if let Err(e) = self.reconciler.process_gallery(meta).await {
            warn!(error = %e, "failed to record creators for gallery");
        }
        self.context.finish_gallery(meta).await;
    }

    #[instrument(skip_all, fields(extension = "suwayomi", batch = current, total = total))]
    async fn post_batch(&self, current: u64, total: u64) {
        if self.dry_run() {
            info!("[DRY RUN] post-batch hook inactive");
            return;
        }
        if !self
            .schedule
            .should_run_post_batch(current, total, self.context.config())
        {
            debug!("post-batch maintenance not due");
            return;
        }
        self.context.cleanup().await;
        let report = self.reconciler.process_deferred_creators(false).await;
        debug!(
            resolved = report.resolved.len(),
            still_deferred = report.still_deferred.len(),
            "post-batch reconciliation done"
        );
    }

    #[instrument(skip_all, fields(extension = "suwayomi"))]
    async fn post_run(&self) {
        if self.dry_run() {
            info!("[DRY RUN] post-run hook inactive");
            return;
        }
        if self.context.config().skip_post_run {
            debug!("post-run hook skipped");
            return;
        }
        self.context.repair_and_cleanup().await;
        let report = self.reconciler.process_deferred_creators(true).await;
        info!(
            passes = report.passes,
            resolved = report.resolved.len(),
            still_deferred = report.still_deferred.len(),
            "deferred creators processed"
        );
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::archive::{ArchiveMode, ArchiveSequencer};
    use crate::config::ExtensionConfig;
    use crate::cover::CoverResolver;
    use crate::download::{HttpClient, MirrorDownloader, RetryPolicy};
    use crate::gallery::Tag;
    use crate::library::DETAILS_FILE_NAME;
    use crate::test_support::{FakeCatalog, cover_links, creator_with_galleries};

    fn extension(config: ExtensionConfig, catalog: Arc<FakeCatalog>) -> SuwayomiExtension {
        let mut options = ReconcilerOptions::from_config(&config);
        options.population_tick = Duration::ZERO;
        options.max_passes = 2;
        let reconciler = LibraryReconciler::new(catalog, options);

        let downloader =
            MirrorDownloader::new(HttpClient::new().unwrap(), RetryPolicy::without_delays(1));
        let covers = CoverResolver::new(&config.library_root).with_dry_run(config.dry_run);
        let archive = ArchiveSequencer::new(ArchiveMode::External, Duration::ZERO, Duration::from_millis(10));
        let context = Arc::new(ExtensionContext::new(config, downloader, covers, archive));
        SuwayomiExtension::new(context, reconciler)
    }

    fn meta(id: u64, title: &str, artist: &str) -> GalleryMeta {
        GalleryMeta {
            id,
            title: title.to_string(),
            tags: vec![Tag::new(artist, "artist"), Tag::new("full color", "tag")],
            num_pages: 2,
        }
    }

    #[tokio::test]
    async fn test_pre_run_creates_managed_category() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(FakeCatalog::new());
        let ext = extension(ExtensionConfig::new(dir.path()), Arc::clone(&catalog));

        ext.pre_run().await.unwrap();
        ext.pre_batch(&[5]).await;

        assert_eq!(catalog.created_categories(), vec!["ScrapedMangas"]);
    }

    #[tokio::test]
    async fn test_after_download_attaches_known_creator() {
        let dir = TempDir::new().unwrap();
        let alice = creator_with_galleries(dir.path(), "Alice", &["(5) Foo"]);
        let catalog = Arc::new(FakeCatalog::new());
        catalog.index("Alice", 11, false);
        let ext = extension(ExtensionConfig::new(dir.path()), Arc::clone(&catalog));

        ext.pre_run().await.unwrap();
        ext.after_gallery_download(&meta(5, "Foo", "Alice")).await;

        assert!(catalog.is_attached(11));
        let state = ext.reconciler().store().load().await;
        assert!(state.collected_manga_ids.contains(&11));
        assert!(state.deferred_creators.is_empty());
        assert!(alice.join(DETAILS_FILE_NAME).is_file());
        assert_eq!(cover_links(&alice), vec!["cover.jpg"]);
    }

    #[tokio::test]
    async fn test_post_run_resolves_creator_indexed_later() {
        let dir = TempDir::new().unwrap();
        creator_with_galleries(dir.path(), "Bob", &["(8) Bar"]);
        let catalog = Arc::new(FakeCatalog::new());
        let ext = extension(ExtensionConfig::new(dir.path()), Arc::clone(&catalog));

        ext.after_gallery_download(&meta(8, "Bar", "Bob")).await;
        assert!(ext.reconciler().store().load().await.deferred_creators.contains("Bob"));

        catalog.index_on_refresh("Bob", 21);
        ext.post_run().await;

        assert!(catalog.is_attached(21));
        assert!(ext.reconciler().store().load().await.deferred_creators.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_touches_neither_catalog_nor_disk() {
        let dir = TempDir::new().unwrap();
        let alice = creator_with_galleries(dir.path(), "Alice", &["(5) Foo"]);
        let catalog = Arc::new(FakeCatalog::new());
        catalog.index("Alice", 11, false);
        let mut config = ExtensionConfig::new(dir.path());
        config.dry_run = true;
        let ext = extension(config, Arc::clone(&catalog));

        ext.pre_run().await.unwrap();
        ext.after_gallery_download(&meta(5, "Foo", "Alice")).await;
        ext.post_batch(1, 2).await;
        ext.post_run().await;

        assert_eq!(catalog.calls(), 0);
        assert!(!alice.join(DETAILS_FILE_NAME).exists());
        assert!(cover_links(&alice).is_empty());
        assert!(!dir.path().join("creators_metadata.json").exists());
        assert_eq!(fs::read_dir(alice.join("(5) Foo")).unwrap().count(), 2);
    }
}
