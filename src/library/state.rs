//! Persisted reconciliation state (`creators_metadata.json`).
//!
//! The whole file is one JSON document. Every mutation goes through
//! [`StateStore::update`]: read, mutate in memory, write back atomically, all
//! inside one critical section guarded by an in-process mutex and an advisory
//! lock on a sibling `.lock` file.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::fs_util::write_json_atomic;

/// Errors from reading or writing the state file.
#[derive(Debug, Error)]
pub enum StateError {
    /// The state or lock file could not be written.
    #[error("state file error at {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The blocking state task panicked or was cancelled.
    #[error("state task failed: {0}")]
    Task(String),
}

impl StateError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Genre statistics for one creator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorEntry {
    /// Occurrences of each genre across the creator's galleries.
    #[serde(default)]
    pub genre_counts: BTreeMap<String, u64>,
}

impl CreatorEntry {
    /// Counts one gallery's genres and keeps only the `max_parsed` most frequent.
    pub fn record_genres(&mut self, genres: &[String], max_parsed: usize) {
        for genre in genres {
            *self.genre_counts.entry(genre.clone()).or_insert(0) += 1;
        }
        if self.genre_counts.len() > max_parsed {
            let keep: BTreeSet<String> = self.top_genres(max_parsed).into_iter().collect();
            self.genre_counts.retain(|genre, _| keep.contains(genre));
        }
    }

    /// Genres by descending count, ties by name.
    #[must_use]
    pub fn top_genres(&self, limit: usize) -> Vec<String> {
        let mut ranked: Vec<(&String, &u64)> = self.genre_counts.iter().collect();
        ranked.sort_by(|(a_name, a_count), (b_name, b_count)| {
            b_count.cmp(a_count).then_with(|| a_name.cmp(b_name))
        });
        ranked
            .into_iter()
            .take(limit)
            .map(|(genre, _)| genre.clone())
            .collect()
    }
}

/// Root structure of `creators_metadata.json`.
///
/// Sets serialize as sorted, de-duplicated JSON arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorsMetadata {
    /// Catalog ids attached to the library.
    #[serde(default)]
    pub collected_manga_ids: BTreeSet<i64>,
    /// Creators waiting for the catalog to index them.
    #[serde(default)]
    pub deferred_creators: BTreeSet<String>,
    /// Per-creator statistics. Never pruned.
    #[serde(default)]
    pub creators: BTreeMap<String, CreatorEntry>,
}

impl CreatorsMetadata {
    /// Marks a creator as attached under `manga_id`.
    pub fn resolve(&mut self, creator: &str, manga_id: i64) {
        if self.deferred_creators.remove(creator) {
            debug!(creator, "removed from deferred creators");
        }
        self.collected_manga_ids.insert(manga_id);
    }

    /// Queues a creator for a later pass.
    pub fn defer(&mut self, creator: &str) {
        self.deferred_creators.insert(creator.to_string());
    }

    /// Returns the creator's entry, creating it if needed.
    pub fn creator_mut(&mut self, creator: &str) -> &mut CreatorEntry {
        self.creators.entry(creator.to_string()).or_default()
    }
}

/// Reads the state file; missing, unreadable or corrupt files yield the default.
fn read_state(path: &Path) -> CreatorsMetadata {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "could not parse creators metadata; starting fresh");
            CreatorsMetadata::default()
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => CreatorsMetadata::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read creators metadata; starting fresh");
            CreatorsMetadata::default()
        }
    }
}

/// Single-writer access to `creators_metadata.json`.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl StateStore {
    /// Creates a store for the given file. Nothing is read until first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// The state file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Reads a snapshot of the current state.
    pub async fn load(&self) -> CreatorsMetadata {
        let _guard = self.guard.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_state(&path))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "state read task failed");
                CreatorsMetadata::default()
            })
    }

    /// Applies `mutate` in one read-modify-write critical section.
    ///
    /// # Errors
    ///
    /// [`StateError::Io`] when the lock or state file cannot be written; the
    /// on-disk state is unchanged in that case.
    pub async fn update<F, R>(&self, mutate: F) -> Result<R, StateError>
    where
        F: FnOnce(&mut CreatorsMetadata) -> R + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.guard.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
            }
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .map_err(|e| StateError::io(&lock_path, e))?;
            FileExt::lock_exclusive(&lock_file).map_err(|e| StateError::io(&lock_path, e))?;

            let mut state = read_state(&path);
            let result = mutate(&mut state);
            let written = write_json_atomic(&path, &state).map_err(|e| StateError::io(&path, e));

            // Closing the handle releases the advisory lock.
            drop(lock_file);
            written.map(|()| result)
        })
        .await
        .map_err(|e| StateError::Task(e.to_string()))?
    }
}
