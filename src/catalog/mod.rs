//! Remote catalog (Suwayomi) integration.
//!
//! The library reconciler only talks to the catalog through [`RemoteCatalog`],
//! so it can be driven by [`SuwayomiClient`] in production and by in-memory
//! fakes in tests.
//!
//! The catalog indexes the library directory asynchronously: a creator folder
//! written to disk is not queryable until the server's library update job has
//! picked it up. [`JobStatus`] reports that job's progress.

mod client;
mod error;

use async_trait::async_trait;
use serde::Deserialize;

pub use client::{SuwayomiClient, SuwayomiClientOptions};
pub use error::CatalogError;

/// Name of the catalog source that serves the local library directory.
pub const LOCAL_SOURCE_NAME: &str = "local source";

/// A manga entry as the catalog reports it.
///
/// Each creator directory shows up as one manga whose title is the creator name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogManga {
    /// Catalog id.
    pub id: i64,
    /// Title (the creator directory name).
    pub title: String,
    /// Whether the manga is marked as in-library.
    pub in_library: bool,
    /// Categories the manga belongs to.
    pub category_ids: Vec<i64>,
}

impl CatalogManga {
    /// True when the manga is in the library and attached to `category_id`.
    #[must_use]
    pub fn is_attached_to(&self, category_id: i64) -> bool {
        self.in_library && self.category_ids.contains(&category_id)
    }
}

/// Progress of the catalog's library update job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobStatus {
    /// Whether any job is still running.
    pub is_running: bool,
    /// Total number of jobs.
    pub total_jobs: u64,
    /// Number of finished jobs.
    pub finished_jobs: u64,
}

impl JobStatus {
    /// Aggregates several job entries: running if any is running, totals summed.
    #[must_use]
    pub fn aggregate(jobs: &[JobStatus]) -> Self {
        jobs.iter().fold(Self::default(), |acc, job| Self {
            is_running: acc.is_running || job.is_running,
            total_jobs: acc.total_jobs + job.total_jobs,
            finished_jobs: acc.finished_jobs + job.finished_jobs,
        })
    }

    /// True once every known job has finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total_jobs > 0 && self.finished_jobs >= self.total_jobs
    }
}

/// Operations the reconciler needs from the remote catalog.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Id of the source named "Local source" (case-insensitive), if any.
    async fn local_source_id(&self) -> Result<Option<String>, CatalogError>;

    /// Id of the category with exactly this name.
    async fn find_category(&self, name: &str) -> Result<Option<i64>, CatalogError>;

    /// Creates a category and returns its id.
    async fn create_category(&self, name: &str) -> Result<i64, CatalogError>;

    /// Mangas of `source_id` whose title equals `title` exactly.
    async fn mangas_by_title(&self, source_id: &str, title: &str) -> Result<Vec<CatalogManga>, CatalogError>;

    /// Mangas of `source_id` that are not in the library yet.
    async fn mangas_not_in_library(&self, source_id: &str) -> Result<Vec<CatalogManga>, CatalogError>;

    /// Marks mangas as in-library.
    async fn set_in_library(&self, ids: &[i64]) -> Result<(), CatalogError>;

    /// Adds mangas to a category.
    async fn add_to_category(&self, ids: &[i64], category_id: i64) -> Result<(), CatalogError>;

    /// Asks the source to refresh its listing (first page of "latest").
    async fn fetch_source_latest(&self, source_id: &str) -> Result<(), CatalogError>;

    /// Starts the library update job for one category.
    async fn trigger_category_update(&self, category_id: i64) -> Result<(), CatalogError>;

    /// Current status of the library update job.
    async fn library_update_status(&self) -> Result<JobStatus, CatalogError>;
}
