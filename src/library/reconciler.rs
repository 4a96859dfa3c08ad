//! Deferred-creator reconciliation against the remote catalog.
//!
//! A creator is *Unresolved* until its first gallery is processed. If the
//! catalog already knows the creator's directory, it is attached to the
//! library and the managed category and becomes *Resolved*; otherwise it is
//! *Deferred* and retried by [`LibraryReconciler::process_deferred_creators`]
//! once the catalog's library update job has indexed new directories.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::details::CreatorDetails;
use super::state::{StateError, StateStore};
use crate::catalog::{CatalogError, RemoteCatalog};
use crate::config::{DEFAULT_CATEGORY_NAME, ExtensionConfig};
use crate::download::DEFAULT_MAX_RETRIES;
use crate::gallery::{GalleryMeta, latest_gallery_entry};

/// Tuning for [`LibraryReconciler`].
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Directory holding one folder per creator.
    pub library_root: PathBuf,
    /// Managed catalog category.
    pub category_name: String,
    /// Base polling interval for the library update job.
    pub population_tick: Duration,
    /// Upper bound on one wait for the library update job.
    pub job_wait_timeout: Duration,
    /// Passes of [`LibraryReconciler::process_deferred_creators`].
    pub max_passes: u32,
    /// Genres written to `details.json`.
    pub max_genres_stored: usize,
    /// Genres kept in the persisted counts.
    pub max_genres_parsed: usize,
    /// Log instead of touching the catalog or disk.
    pub dry_run: bool,
}

impl ReconcilerOptions {
    /// Defaults for a library at `library_root`.
    #[must_use]
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: library_root.into(),
            category_name: DEFAULT_CATEGORY_NAME.to_string(),
            population_tick: Duration::from_secs(2),
            job_wait_timeout: Duration::from_secs(600),
            max_passes: DEFAULT_MAX_RETRIES,
            max_genres_stored: 50,
            max_genres_parsed: 1000,
            dry_run: false,
        }
    }

    /// Options taken from the extension config.
    #[must_use]
    pub fn from_config(config: &ExtensionConfig) -> Self {
        Self {
            library_root: config.library_root.clone(),
            category_name: config.category_name.clone(),
            population_tick: config.population_tick(),
            job_wait_timeout: config.job_wait_timeout(),
            max_passes: config.max_retries,
            max_genres_stored: config.max_genres_stored,
            max_genres_parsed: config.max_genres_parsed,
            dry_run: config.dry_run,
        }
    }
}

/// Summary of one [`LibraryReconciler::process_deferred_creators`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Passes actually run.
    pub passes: u32,
    /// Not-in-library catalog entries attached because their directory exists.
    pub attached_from_listing: usize,
    /// Deferred creators resolved, in resolution order.
    pub resolved: Vec<String>,
    /// Creators still deferred at the end.
    pub still_deferred: Vec<String>,
}

/// Catalog ids resolved once per reconciler.
#[derive(Debug, Clone)]
struct CatalogIds {
    source_id: String,
    category_id: i64,
}

/// Keeps creator directories, persisted state and the remote catalog in step.
pub struct LibraryReconciler {
    catalog: Arc<dyn RemoteCatalog>,
    store: StateStore,
    options: ReconcilerOptions,
    ids: OnceCell<CatalogIds>,
}

impl std::fmt::Debug for LibraryReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryReconciler")
            .field("state", &self.store.path())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl LibraryReconciler {
    /// Creates a reconciler persisting to `<library_root>/creators_metadata.json`.
    #[must_use]
    pub fn new(catalog: Arc<dyn RemoteCatalog>, options: ReconcilerOptions) -> Self {
        let store = StateStore::new(options.library_root.join(super::STATE_FILE_NAME));
        Self {
            catalog,
            store,
            options,
            ids: OnceCell::new(),
        }
    }

    /// The state store backing this reconciler.
    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Resolves the local source and ensures the managed category exists.
    ///
    /// Succeeds at most once; later calls return the cached ids.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NoLocalSource`] or any catalog request failure.
    #[instrument(skip_all, fields(category = %self.options.category_name))]
    pub async fn prepare(&self) -> Result<(), CatalogError> {
        self.catalog_ids().await.map(|_| ())
    }

    async fn catalog_ids(&self) -> Result<&CatalogIds, CatalogError> {
        self.ids
            .get_or_try_init(|| async {
                let source_id = self
                    .catalog
                    .local_source_id()
                    .await?
                    .ok_or(CatalogError::NoLocalSource)?;
                let category_id = self.ensure_category().await?;
                info!(source_id = %source_id, category_id, "catalog ready");
                Ok::<_, CatalogError>(CatalogIds {
                    source_id,
                    category_id,
                })
            })
            .await
    }

    async fn ensure_category(&self) -> Result<i64, CatalogError> {
        let name = &self.options.category_name;
        if let Some(id) = self.catalog.find_category(name).await? {
            debug!(category_id = id, "found existing category");
            return Ok(id);
        }
        let id = self.catalog.create_category(name).await?;
        let wait = self.options.population_tick * 4;
        info!(category_id = id, wait_secs = wait.as_secs(), "created category; waiting for catalog to populate");
        tokio::time::sleep(wait).await;
        Ok(id)
    }

    async fn attach(&self, ids: &[i64], category_id: i64) -> Result<(), CatalogError> {
        self.catalog.set_in_library(ids).await?;
        self.catalog.add_to_category(ids, category_id).await?;
        debug!(count = ids.len(), category_id, "attached mangas to library");
        Ok(())
    }

    /// Attaches the creator's catalog entry, returning its id on success.
    async fn try_resolve(&self, creator: &str) -> Option<i64> {
        let ids = match self.catalog_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(creator, error = %e, "catalog unavailable; deferring creator");
                return None;
            }
        };
        let manga = match self.catalog.mangas_by_title(&ids.source_id, creator).await {
            Ok(mangas) => mangas.into_iter().next()?,
            Err(e) => {
                warn!(creator, error = %e, "catalog lookup failed; deferring creator");
                return None;
            }
        };
        match self.attach(&[manga.id], ids.category_id).await {
            Ok(()) => Some(manga.id),
            Err(e) => {
                warn!(creator, manga_id = manga.id, error = %e, "failed to attach creator manga");
                None
            }
        }
    }

    /// Updates catalog membership, genre counts and `details.json` for every
    /// creator of a completed gallery.
    ///
    /// Catalog failures defer the creator; only state persistence errors are
    /// returned.
    ///
    /// # Errors
    ///
    /// [`StateError`] when `creators_metadata.json` cannot be written.
    #[instrument(skip_all, fields(gallery = meta.id))]
    pub async fn process_gallery(&self, meta: &GalleryMeta) -> Result<(), StateError> {
        if self.options.dry_run {
            info!("[DRY RUN] would update creator library entries");
            return Ok(());
        }
        let creators = meta.creator_dir_names();
        if creators.is_empty() {
            return Ok(());
        }

        let mut outcomes = Vec::with_capacity(creators.len());
        for creator in creators {
            let resolved = self.try_resolve(&creator).await;
            match resolved {
                Some(id) => info!(creator = %creator, manga_id = id, "creator attached to library"),
                None => debug!(creator = %creator, "creator deferred"),
            }
            outcomes.push((creator, resolved));
        }

        let genres = meta.genres();
        let max_parsed = self.options.max_genres_parsed;
        let max_stored = self.options.max_genres_stored;
        let recorded = outcomes.clone();
        let top_genres = self
            .store
            .update(move |state| {
                recorded
                    .iter()
                    .map(|(creator, resolved)| {
                        match resolved {
                            Some(id) => state.resolve(creator, *id),
                            None => state.defer(creator),
                        }
                        let entry = state.creator_mut(creator);
                        entry.record_genres(&genres, max_parsed);
                        entry.top_genres(max_stored)
                    })
                    .collect::<Vec<_>>()
            })
            .await?;

        let library_root = self.options.library_root.clone();
        let fallback_title = meta.full_title();
        let creators: Vec<String> = outcomes.into_iter().map(|(creator, _)| creator).collect();
        let written = tokio::task::spawn_blocking(move || {
            for (creator, genres) in creators.iter().zip(top_genres) {
                let creator_dir = library_root.join(creator);
                let latest = latest_gallery_entry(&creator_dir)
                    .map_or_else(|| fallback_title.clone(), |entry| entry.entry_name);
                if let Err(e) = CreatorDetails::new(creator, &latest, genres).write(&creator_dir) {
                    warn!(creator = %creator, error = %e, "failed to write details.json");
                }
            }
        })
        .await;
        if let Err(e) = written {
            warn!(error = %e, "details task failed");
        }
        Ok(())
    }

    /// Retries deferred creators until they resolve or the passes run out.
    ///
    /// Each pass refreshes the catalog (triggering the category update job
    /// when `populate` is set), attaches not-in-library entries that match an
    /// existing creator directory, then retries every deferred creator.
    #[instrument(skip_all, fields(populate = populate))]
    pub async fn process_deferred_creators(&self, populate: bool) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.options.dry_run {
            info!("[DRY RUN] would process deferred creators");
            return report;
        }

        let ids = match self.catalog_ids().await {
            Ok(ids) => ids.clone(),
            Err(e) => {
                warn!(error = %e, "catalog unavailable; creators stay deferred");
                report.still_deferred = self.store.load().await.deferred_creators.into_iter().collect();
                return report;
            }
        };

        let mut still_deferred = BTreeSet::new();
        for pass in 1..=self.options.max_passes.max(1) {
            report.passes = pass;
            info!(pass, max_passes = self.options.max_passes, "processing deferred creators");

            self.populate(&ids, populate).await;
            report.attached_from_listing += self.attach_unlisted(&ids).await;

            let deferred = self.store.load().await.deferred_creators;
            if deferred.is_empty() {
                info!("no deferred creators to process");
                still_deferred.clear();
                break;
            }

            still_deferred.clear();
            let resolved = self.retry_deferred(&ids, &deferred, &mut still_deferred).await;
            if !resolved.is_empty() {
                let persisted = resolved.clone();
                if let Err(e) = self
                    .store
                    .update(move |state| {
                        for (creator, id) in &persisted {
                            state.resolve(creator, *id);
                        }
                    })
                    .await
                {
                    warn!(error = %e, "failed to persist resolved creators");
                }
                report.resolved.extend(resolved.into_iter().map(|(creator, _)| creator));
            }

            if still_deferred.is_empty() {
                info!("all deferred creators processed");
                break;
            }
        }

        if !still_deferred.is_empty() {
            let remaining = still_deferred.clone();
            if let Err(e) = self
                .store
                .update(move |state| state.deferred_creators.extend(remaining))
                .await
            {
                warn!(error = %e, "failed to persist deferred creators");
            }
            warn!(
                creators = %still_deferred.iter().cloned().collect::<Vec<_>>().join(", "),
                "unable to process creators"
            );
        }
        report.still_deferred = still_deferred.into_iter().collect();
        report
    }

    /// Attaches catalog entries not yet in the library whose directory exists.
    async fn attach_unlisted(&self, ids: &CatalogIds) -> usize {
        let mangas = match self.catalog.mangas_not_in_library(&ids.source_id).await {
            Ok(mangas) => mangas,
            Err(e) => {
                warn!(error = %e, "failed to list mangas outside the library");
                return 0;
            }
        };
        let found: Vec<(String, i64)> = mangas
            .into_iter()
            .filter(|manga| self.options.library_root.join(&manga.title).is_dir())
            .map(|manga| (manga.title, manga.id))
            .collect();
        if found.is_empty() {
            debug!("no local mangas outside the library");
            return 0;
        }

        let manga_ids: Vec<i64> = found.iter().map(|(_, id)| *id).collect();
        if let Err(e) = self.attach(&manga_ids, ids.category_id).await {
            warn!(count = manga_ids.len(), error = %e, "failed to attach local mangas");
            return 0;
        }
        info!(count = found.len(), "attached local mangas to library and category");
        let attached = found.len();
        if let Err(e) = self
            .store
            .update(move |state| {
                for (title, id) in &found {
                    state.resolve(title, *id);
                }
            })
            .await
        {
            warn!(error = %e, "failed to persist attached mangas");
        }
        attached
    }

    /// Looks up each deferred creator and bulk-attaches the ones the catalog knows.
    async fn retry_deferred(
        &self,
        ids: &CatalogIds,
        deferred: &BTreeSet<String>,
        still_deferred: &mut BTreeSet<String>,
    ) -> Vec<(String, i64)> {
        let mut resolved = Vec::new();
        let mut queued = Vec::new();
        for creator in deferred {
            if !self.options.library_root.join(creator).is_dir() {
                warn!(creator = %creator, "skipping deferred creator: folder does not exist");
                still_deferred.insert(creator.clone());
                continue;
            }
            let manga = match self.catalog.mangas_by_title(&ids.source_id, creator).await {
                Ok(mangas) => mangas.into_iter().next(),
                Err(e) => {
                    warn!(creator = %creator, error = %e, "catalog lookup failed");
                    None
                }
            };
            let Some(manga) = manga else {
                debug!(creator = %creator, "creator not indexed yet");
                still_deferred.insert(creator.clone());
                continue;
            };
            if manga.is_attached_to(ids.category_id) {
                info!(creator = %creator, "already in library and category");
                resolved.push((creator.clone(), manga.id));
            } else {
                debug!(creator = %creator, manga_id = manga.id, "queued for attach");
                queued.push((creator.clone(), manga.id));
            }
        }

        if !queued.is_empty() {
            let manga_ids: Vec<i64> = queued.iter().map(|(_, id)| *id).collect();
            match self.attach(&manga_ids, ids.category_id).await {
                Ok(()) => resolved.extend(queued),
                Err(e) => {
                    warn!(count = queued.len(), error = %e, "failed to attach deferred creators");
                    still_deferred.extend(queued.into_iter().map(|(creator, _)| creator));
                }
            }
        }
        resolved
    }

    /// Refreshes the local source and waits for the library update job.
    async fn populate(&self, ids: &CatalogIds, update_library: bool) {
        if let Err(e) = self.catalog.fetch_source_latest(&ids.source_id).await {
            warn!(error = %e, "failed to refresh local source listing");
        }
        if update_library {
            if let Err(e) = self.catalog.trigger_category_update(ids.category_id).await {
                warn!(error = %e, "failed to trigger category update");
                return;
            }
        }
        self.wait_for_update_job().await;
    }

    async fn wait_for_update_job(&self) {
        let tick = self.options.population_tick;
        let deadline = Instant::now() + self.options.job_wait_timeout;
        loop {
            let status = self.catalog.library_update_status().await;
            tokio::time::sleep(tick).await;

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, "failed to fetch update status");
                    if Instant::now() >= deadline {
                        break;
                    }
                    continue;
                }
            };
            if !status.is_running {
                debug!("library update not running");
                break;
            }
            if status.is_complete() {
                let settle = tick.saturating_mul(5).max(Duration::from_secs(1 + status.total_jobs / 50));
                info!(
                    total = status.total_jobs,
                    settle_secs = settle.as_secs(),
                    "library update complete; waiting for changes to settle"
                );
                tokio::time::sleep(settle).await;
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    finished = status.finished_jobs,
                    total = status.total_jobs,
                    "gave up waiting for library update"
                );
                break;
            }
            debug!(finished = status.finished_jobs, total = status.total_jobs, "library update running");
            tokio::time::sleep(tick.max(Duration::from_secs(1 + status.total_jobs / 1000))).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::gallery::Tag;
    use crate::test_support::FakeCatalog;
    use tempfile::TempDir;

    fn options(root: &std::path::Path) -> ReconcilerOptions {
        ReconcilerOptions {
            population_tick: Duration::ZERO,
            job_wait_timeout: Duration::from_secs(5),
            ..ReconcilerOptions::new(root)
        }
    }

    fn meta(id: u64, artists: &[&str], genres: &[&str]) -> GalleryMeta {
        let mut tags: Vec<Tag> = artists.iter().map(|a| Tag::new(*a, "artist")).collect();
        tags.extend(genres.iter().map(|g| Tag::new(*g, "tag")));
        GalleryMeta {
            id,
            title: "Foo".to_string(),
            tags,
            num_pages: 2,
        }
    }

    #[tokio::test]
    async fn test_prepare_creates_missing_category_once() {
        let root = TempDir::new().unwrap();
        let catalog = Arc::new(FakeCatalog::new());
        let reconciler = LibraryReconciler::new(catalog.clone(), options(root.path()));

        reconciler.prepare().await.unwrap();
        reconciler.prepare().await.unwrap();

        assert_eq!(catalog.created_categories(), vec!["ScrapedMangas"]);
    }

    #[tokio::test]
    async fn test_prepare_fails_without_local_source() {
        let root = TempDir::new().unwrap();
        let catalog = Arc::new(FakeCatalog::new().without_local_source());
        let reconciler = LibraryReconciler::new(catalog, options(root.path()));
        assert!(matches!(reconciler.prepare().await, Err(CatalogError::NoLocalSource)));
    }

    #[tokio::test]
    async fn test_process_gallery_resolves_known_and_defers_unknown() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("Alice").join("(5) Foo")).unwrap();
        let catalog = Arc::new(FakeCatalog::new());
        catalog.index("Alice", 11, false);
        let reconciler = LibraryReconciler::new(catalog.clone(), options(root.path()));

        reconciler
            .process_gallery(&meta(5, &["Alice", "Bob"], &["full color"]))
            .await
            .unwrap();

        let state = reconciler.store().load().await;
        assert_eq!(state.deferred_creators.iter().collect::<Vec<_>>(), vec!["Bob"]);
        assert!(state.collected_manga_ids.contains(&11));
        assert!(catalog.is_attached(11));
        assert_eq!(state.creators["Bob"].genre_counts["full color"], 1);

        let details: CreatorDetails = serde_json::from_str(
            &std::fs::read_to_string(root.path().join("Alice").join("details.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(details.description, "Latest Doujin: (5) Foo");
        let bob: CreatorDetails = serde_json::from_str(
            &std::fs::read_to_string(root.path().join("Bob").join("details.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(bob.description, "Latest Doujin: (5) Foo");
        assert_eq!(bob.genre, vec!["full color"]);
    }

    #[tokio::test]
    async fn test_attach_failure_defers_creator() {
        let root = TempDir::new().unwrap();
        let catalog = Arc::new(FakeCatalog::new());
        catalog.index("Alice", 11, false);
        catalog.fail_attach(true);
        let reconciler = LibraryReconciler::new(catalog, options(root.path()));

        reconciler.process_gallery(&meta(5, &["Alice"], &[])).await.unwrap();

        let state = reconciler.store().load().await;
        assert!(state.deferred_creators.contains("Alice"));
        assert!(state.collected_manga_ids.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let root = TempDir::new().unwrap();
        let catalog = Arc::new(FakeCatalog::new());
        let reconciler = LibraryReconciler::new(
            catalog.clone(),
            ReconcilerOptions {
                dry_run: true,
                ..options(root.path())
            },
        );
        reconciler.process_gallery(&meta(5, &["Alice"], &[])).await.unwrap();
        let report = reconciler.process_deferred_creators(true).await;

        assert_eq!(report, ReconcileReport::default());
        assert!(!root.path().join("creators_metadata.json").exists());
        assert_eq!(catalog.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_directory_stays_deferred() {
        let root = TempDir::new().unwrap();
        let catalog = Arc::new(FakeCatalog::new());
        catalog.index("Ghost", 3, false);
        let reconciler = LibraryReconciler::new(
            catalog,
            ReconcilerOptions {
                max_passes: 2,
                ..options(root.path())
            },
        );
        reconciler.store().update(|s| s.defer("Ghost")).await.unwrap();

        let report = reconciler.process_deferred_creators(false).await;

        assert_eq!(report.passes, 2);
        assert_eq!(report.still_deferred, vec!["Ghost"]);
        assert!(reconciler.store().load().await.deferred_creators.contains("Ghost"));
    }

    #[tokio::test]
    async fn test_deferred_creator_attached_from_listing_after_refresh() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("Alice")).unwrap();
        let catalog = Arc::new(FakeCatalog::new());
        catalog.index_on_refresh("Alice", 21);
        let reconciler = LibraryReconciler::new(catalog.clone(), options(root.path()));
        reconciler.store().update(|s| s.defer("Alice")).await.unwrap();

        let report = reconciler.process_deferred_creators(true).await;

        assert_eq!(report.passes, 1);
        assert_eq!(report.attached_from_listing, 1);
        assert!(report.still_deferred.is_empty());
        assert!(catalog.is_attached(21));
        let state = reconciler.store().load().await;
        assert!(state.deferred_creators.is_empty());
        assert!(state.collected_manga_ids.contains(&21));
    }

    #[tokio::test]
    async fn test_deferred_creator_in_library_is_added_to_category() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("Alice")).unwrap();
        std::fs::create_dir_all(root.path().join("Bob")).unwrap();
        let catalog = Arc::new(FakeCatalog::new());
        catalog.index("Alice", 21, true);
        let reconciler = LibraryReconciler::new(catalog.clone(), options(root.path()));
        reconciler
            .store()
            .update(|s| {
                s.defer("Alice");
                s.defer("Bob");
            })
            .await
            .unwrap();

        let report = reconciler.process_deferred_creators(false).await;

        assert_eq!(report.resolved, vec!["Alice"]);
        assert_eq!(report.still_deferred, vec!["Bob"]);
        assert_eq!(report.passes, 3);
        assert!(catalog.is_attached(21));
        let state = reconciler.store().load().await;
        assert_eq!(state.deferred_creators.iter().collect::<Vec<_>>(), vec!["Bob"]);
    }
}
