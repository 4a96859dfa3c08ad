//! Per-creator `details.json`, read by the catalog's local source.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fs_util::write_json_atomic;

/// File name of the per-creator details document.
pub const DETAILS_FILE_NAME: &str = "details.json";

/// Status code written for every creator: ongoing.
const STATUS_ONGOING: &str = "1";

const STATUS_VALUES: [&str; 4] = ["0 = Unknown", "1 = Ongoing", "2 = Completed", "3 = Licensed"];

/// Contents of a creator's `details.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorDetails {
    pub title: String,
    pub author: String,
    pub artist: String,
    pub description: String,
    pub genre: Vec<String>,
    pub status: String,
    #[serde(rename = "_status values")]
    pub status_values: Vec<String>,
}

impl CreatorDetails {
    /// Details for `creator` whose most recent gallery is `latest_gallery`.
    #[must_use]
    pub fn new(creator: &str, latest_gallery: &str, genres: Vec<String>) -> Self {
        Self {
            title: creator.to_string(),
            author: creator.to_string(),
            artist: creator.to_string(),
            description: format!("Latest Doujin: {latest_gallery}"),
            genre: genres,
            status: STATUS_ONGOING.to_string(),
            status_values: STATUS_VALUES.iter().map(ToString::to_string).collect(),
        }
    }

    /// Writes `details.json` into `creator_dir`, creating the directory.
    ///
    /// # Errors
    ///
    /// Any IO error from creating the directory or writing the file.
    pub fn write(&self, creator_dir: &Path) -> io::Result<()> {
        write_json_atomic(&creator_dir.join(DETAILS_FILE_NAME), self)
    }
}
