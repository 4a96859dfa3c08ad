//! Scraper Extensions Library
//!
//! Pluggable extensions for a manga/doujin scraper. Each extension hooks into
//! the download pipeline (pre-run, pre-batch, per-gallery, post-batch,
//! post-run) to download pages from mirrors, package finished galleries,
//! keep creator covers healthy and keep a Suwayomi library in sync.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Extension configuration (one context object per run)
//! - [`gallery`] - Gallery identity parsing, metadata and the gallery source seam
//! - [`download`] - HTTP client, retry policy and the mirror-fallback downloader
//! - [`archive`] - Archive-then-delete sequencing for finished galleries
//! - [`cover`] - Self-healing `cover.<ext>` symlinks backed by `.covers`
//! - [`catalog`] - Remote catalog (Suwayomi GraphQL) client
//! - [`library`] - Persisted creator state, deferred-creator reconciliation and maintenance
//! - [`extension`] - The hook trait, the `skeleton`/`suwayomi` variants and their registry

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod catalog;
pub mod config;
pub mod cover;
pub mod download;
pub mod extension;
mod fs_util;
pub mod gallery;
pub mod library;
#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use archive::{ArchiveError, ArchiveMode, ArchiveOutcome, ArchiveSequencer, GalleryFormat};
pub use catalog::{
    CatalogError, CatalogManga, JobStatus, RemoteCatalog, SuwayomiClient, SuwayomiClientOptions,
};
pub use config::{ConfigError, ExtensionConfig};
pub use cover::{CoverError, CoverOutcome, CoverResolver, CoverSource};
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, FailureType, HttpClient, MirrorDownloader, PageRequest,
    ProxyTransport, RetryPolicy, Stage, TransportRebuilder, classify_error,
};
pub use extension::{
    BatchSchedule, Extension, ExtensionContext, ExtensionError, ExtensionRegistry,
    SkeletonExtension, SuwayomiExtension, build_default_registry,
};
pub use gallery::{GalleryEntry, GalleryIdentity, GalleryMeta, GallerySource, Tag};
pub use library::{
    CleanupReport, CreatorDetails, CreatorEntry, CreatorsMetadata, LibraryReconciler,
    ReconcileReport, ReconcilerOptions, StateError, StateStore, clean_library, repair_covers,
};
