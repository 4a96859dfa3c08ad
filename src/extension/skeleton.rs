//! The base extension: library layout, covers and archiving.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{BatchSchedule, Extension, ExtensionContext, ExtensionError};
use crate::download::PageRequest;
use crate::gallery::GalleryMeta;

/// Keeps the library tidy without talking to any catalog.
///
/// - `download_page` goes through the shared [`MirrorDownloader`](crate::download::MirrorDownloader)
/// - `after_gallery_download` caches the new cover and archives the gallery
/// - `post_batch` prunes the library on the [`BatchSchedule::SKELETON`] schedule
/// - `post_run` repairs every cover, then prunes
#[derive(Debug)]
pub struct SkeletonExtension {
    context: Arc<ExtensionContext>,
    schedule: BatchSchedule,
}

impl SkeletonExtension {
    /// Creates the extension over a shared context.
    #[must_use]
    pub fn new(context: Arc<ExtensionContext>) -> Self {
        Self {
            context,
            schedule: BatchSchedule::SKELETON,
        }
    }

    /// Overrides the post-batch schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: BatchSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    fn dry_run(&self) -> bool {
        self.context.config().dry_run
    }
}

#[async_trait]
impl Extension for SkeletonExtension {
    fn name(&self) -> &'static str {
        "skeleton"
    }

    async fn pre_run(&self) -> Result<(), ExtensionError> {
        debug!(extension = self.name(), "pre-run hook called");
        self.context.prepare_library_root().await
    }

    async fn download_page(&self, request: &PageRequest) -> bool {
        self.context.downloader().download_page(request).await
    }

    #[instrument(skip_all, fields(extension = "skeleton", gallery = meta.id))]
    async fn after_gallery_download(&self, meta: &GalleryMeta) {
        if self.dry_run() {
            info!("[DRY RUN] post-download hook inactive");
            return;
        }
        self.context.finish_gallery(meta).await;
    }

    #[instrument(skip_all, fields(extension = "skeleton", batch = current, total = total))]
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
    }

    #[instrument(skip_all, fields(extension = "skeleton"))]
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
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::archive::{ArchiveMode, ArchiveSequencer, GalleryFormat};
    use crate::config::ExtensionConfig;
    use crate::cover::CoverResolver;
    use crate::download::{HttpClient, MirrorDownloader, RetryPolicy};
    use crate::gallery::Tag;
    use crate::test_support::{cover_links, creator_with_galleries};

    fn extension(config: ExtensionConfig) -> SkeletonExtension {
        let downloader =
            MirrorDownloader::new(HttpClient::new().unwrap(), RetryPolicy::without_delays(1));
        let covers = CoverResolver::new(&config.library_root).with_dry_run(config.dry_run);
        let archive = ArchiveSequencer::new(
            ArchiveMode::Internal,
            Duration::ZERO,
            Duration::from_millis(10),
        );
        SkeletonExtension::new(Arc::new(ExtensionContext::new(
            config, downloader, covers, archive,
        )))
    }

    fn meta(id: u64, title: &str, artist: &str) -> GalleryMeta {
        GalleryMeta {
            id,
            title: title.to_string(),
            tags: vec![Tag::new(artist, "artist"), Tag::new("full color", "tag")],
            num_pages: 2,
        }
    }

    fn cover_target(creator_dir: &Path) -> PathBuf {
        fs::read_link(creator_dir.join("cover.jpg")).unwrap()
    }

    #[tokio::test]
    async fn test_pre_run_creates_library_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("library");
        extension(ExtensionConfig::new(&root)).pre_run().await.unwrap();
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_dry_run_pre_run_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("library");
        let mut config = ExtensionConfig::new(&root);
        config.dry_run = true;
        extension(config).pre_run().await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_after_download_directory_format_links_cover_and_keeps_folder() {
        let dir = TempDir::new().unwrap();
        let alice = creator_with_galleries(dir.path(), "Alice", &["(5) Foo"]);

        extension(ExtensionConfig::new(dir.path()))
            .after_gallery_download(&meta(5, "Foo", "Alice"))
            .await;

        assert!(alice.join("(5) Foo").is_dir());
        assert!(alice.join(".covers").join("(5) Foo.jpg").is_file());
        assert_eq!(cover_links(&alice), vec!["cover.jpg"]);
        assert_eq!(cover_target(&alice), PathBuf::from(".covers/(5) Foo.jpg"));
    }

    #[tokio::test]
    async fn test_after_download_cbz_format_archives_and_keeps_cover() {
        let dir = TempDir::new().unwrap();
        let alice = creator_with_galleries(dir.path(), "Alice", &["(5) Foo"]);
        let mut config = ExtensionConfig::new(dir.path());
        config.gallery_format = GalleryFormat::Cbz;

        extension(config)
            .after_gallery_download(&meta(5, "Foo", "Alice"))
            .await;

        assert!(!alice.join("(5) Foo").exists());
        assert!(alice.join("(5) Foo.cbz").is_file());
        assert_eq!(cover_target(&alice), PathBuf::from(".covers/(5) Foo.jpg"));
        assert_eq!(
            fs::read(alice.join("cover.jpg")).unwrap(),
            b"first page of (5) Foo"
        );
    }

    #[tokio::test]
    async fn test_newer_gallery_moves_cover_forward() {
        let dir = TempDir::new().unwrap();
        let alice = creator_with_galleries(dir.path(), "Alice", &["(5) Foo"]);
        let ext = extension(ExtensionConfig::new(dir.path()));
        ext.after_gallery_download(&meta(5, "Foo", "Alice")).await;

        creator_with_galleries(dir.path(), "Alice", &["(9) Bar"]);
        ext.after_gallery_download(&meta(9, "Bar", "Alice")).await;

        assert_eq!(cover_target(&alice), PathBuf::from(".covers/(9) Bar.jpg"));
        assert_eq!(cover_links(&alice), vec!["cover.jpg"]);
    }

    #[tokio::test]
    async fn test_post_batch_prunes_only_when_due() {
        let dir = TempDir::new().unwrap();
        let ghost = dir.path().join("Ghost");
        fs::create_dir_all(ghost.join("(1) Empty")).unwrap();
        let ext = extension(ExtensionConfig::new(dir.path()));

        ext.post_batch(3, 10).await;
        assert!(ghost.exists());

        ext.post_batch(4, 10).await;
        assert!(!ghost.exists());
        assert!(dir.path().is_dir());
    }

    #[tokio::test]
    async fn test_post_run_repairs_covers_unless_skipped() {
        let dir = TempDir::new().unwrap();
        let alice = creator_with_galleries(dir.path(), "Alice", &["(5) Foo"]);

        let mut skipped = ExtensionConfig::new(dir.path());
        skipped.skip_post_run = true;
        extension(skipped).post_run().await;
        assert!(cover_links(&alice).is_empty());

        extension(ExtensionConfig::new(dir.path())).post_run().await;
        assert_eq!(cover_links(&alice), vec!["cover.jpg"]);
    }
}
