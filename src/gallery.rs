//! Gallery identity, metadata and the gallery source seam.
//!
//! Every gallery entry in the library is named `"(ID) NAME"`, either as an
//! expanded directory or as a single `.zip`/`.cbz` archive. [`GalleryIdentity`]
//! parses that name and orders entries by numeric id first, so "latest" is
//! always the highest id.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::fs_util::sorted_entry_names;

/// Creator used when a gallery has neither artist nor group tags.
pub const UNKNOWN_CREATOR: &str = "Unknown Creator";

/// Tag types that are not genres.
const NON_GENRE_TAG_TYPES: [&str; 4] = ["artist", "group", "language", "category"];

#[allow(clippy::expect_used)]
static GALLERY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+)\)").expect("gallery id regex is valid"));

/// Ordered `(id, name)` pair parsed from an entry named `"(ID) NAME"`.
///
/// Ordering compares `id` first and breaks ties by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GalleryIdentity {
    /// Numeric gallery id; leading zeros are ignored.
    pub id: u64,
    /// Trimmed text following the id group.
    pub name: String,
}

impl GalleryIdentity {
    /// Parses the first `(digits)` group in `text`.
    ///
    /// Returns `None` when there is no such group or the digits overflow `u64`.
    ///
    /// ```
    /// use scraper_extensions::GalleryIdentity;
    ///
    /// let identity = GalleryIdentity::parse("(0012345) Some Title").unwrap();
    /// assert_eq!(identity.id, 12345);
    /// assert_eq!(identity.name, "Some Title");
    /// assert!(GalleryIdentity::parse("Some Title").is_none());
    /// ```
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let captures = GALLERY_ID_RE.captures(text)?;
        let whole = captures.get(0)?;
        let id = captures.get(1)?.as_str().parse::<u64>().ok()?;
        Some(Self {
            id,
            name: text[whole.end()..].trim().to_string(),
        })
    }

    /// Parses just the id, for names where the display part is irrelevant.
    #[must_use]
    pub fn parse_id(text: &str) -> Option<u64> {
        Self::parse(text).map(|identity| identity.id)
    }
}

impl PartialOrd for GalleryIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GalleryIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// One `{name, type}` tag as delivered by the metadata source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Display name, e.g. `"full color"` or an artist name.
    pub name: String,
    /// Tag kind: `artist`, `group`, `language`, `category`, `tag`, ...
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl Tag {
    /// Convenience constructor.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// Gallery metadata as returned by a [`GallerySource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryMeta {
    /// Gallery id.
    pub id: u64,
    /// Short title, without the `(ID)` prefix.
    #[serde(default)]
    pub title: String,
    /// All tags.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Number of pages.
    #[serde(default)]
    pub num_pages: u32,
}

impl GalleryMeta {
    fn tag_names(&self, kind: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter(|tag| tag.kind == kind && !tag.name.trim().is_empty())
            .map(|tag| tag.name.clone())
            .collect()
    }

    /// Artists, else groups, else `["Unknown Creator"]`.
    #[must_use]
    pub fn creators(&self) -> Vec<String> {
        let artists = self.tag_names("artist");
        if !artists.is_empty() {
            return artists;
        }
        let groups = self.tag_names("group");
        if !groups.is_empty() {
            return groups;
        }
        vec![UNKNOWN_CREATOR.to_string()]
    }

    /// Creator names as they appear on disk.
    #[must_use]
    pub fn creator_dir_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.creators().iter().map(|c| make_filesystem_safe(c)) {
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Tags whose type is none of artist/group/language/category.
    #[must_use]
    pub fn genres(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|tag| !NON_GENRE_TAG_TYPES.contains(&tag.kind.as_str()))
            .map(|tag| tag.name.clone())
            .collect()
    }

    /// `"(ID) TITLE"`, the gallery's entry name on disk.
    #[must_use]
    pub fn full_title(&self) -> String {
        let title = make_filesystem_safe(&self.title);
        if title.is_empty() {
            format!("({})", self.id)
        } else {
            format!("({}) {title}", self.id)
        }
    }
}

/// Strips path separators and characters most filesystems reject, and
/// collapses runs of whitespace.
#[must_use]
pub fn make_filesystem_safe(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_matches('.').trim().to_string()
}

/// A `"(ID) NAME"` entry of a creator directory: an expanded directory or a
/// `.zip`/`.cbz` archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryEntry {
    /// Parsed identity.
    pub identity: GalleryIdentity,
    /// File name without any archive extension.
    pub entry_name: String,
    /// True for an expanded directory.
    pub is_dir: bool,
}

/// Parses one directory entry, `None` when it is not a gallery entry.
fn gallery_entry(creator_dir: &Path, name: &str) -> Option<GalleryEntry> {
    if !name.starts_with('(') {
        return None;
    }
    let path = creator_dir.join(name);
    let is_dir = path.is_dir();
    let entry_name = if is_dir {
        name.to_string()
    } else {
        let lower = name.to_ascii_lowercase();
        if !path.is_file() || !(lower.ends_with(".cbz") || lower.ends_with(".zip")) {
            return None;
        }
        name[..name.len() - 4].to_string()
    };
    let identity = GalleryIdentity::parse(&entry_name)?;
    Some(GalleryEntry {
        identity,
        entry_name,
        is_dir,
    })
}

/// The highest-id gallery entry of a creator directory.
#[must_use]
pub fn latest_gallery_entry(creator_dir: &Path) -> Option<GalleryEntry> {
    sorted_entry_names(creator_dir)
        .iter()
        .filter_map(|name| gallery_entry(creator_dir, name))
        .max_by(|a, b| a.identity.cmp(&b.identity))
}

/// First expanded directory named `"(<id>)..."` in `creator_dir`.
#[must_use]
pub fn find_gallery_dir(creator_dir: &Path, gallery_id: u64) -> Option<PathBuf> {
    let prefix = format!("({gallery_id})");
    sorted_entry_names(creator_dir)
        .into_iter()
        .filter(|name| name.starts_with(&prefix))
        .map(|name| creator_dir.join(name))
        .find(|path| path.is_dir())
}

/// Where gallery metadata and page URLs come from.
///
/// The host scraper supplies the implementation; cover repair uses it to fetch
/// the first page of a gallery that is no longer available locally.
#[async_trait]
pub trait GallerySource: Send + Sync {
    /// Fetches metadata for a gallery id, `None` when it does not exist.
    async fn fetch_gallery_metadata(&self, id: u64) -> Option<GalleryMeta>;

    /// Returns page image URLs for the first `page_count` pages.
    async fn fetch_image_urls(&self, meta: &GalleryMeta, page_count: u32) -> Vec<String>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn meta_with(tags: &[(&str, &str)]) -> GalleryMeta {
        GalleryMeta {
            id: 177_013,
            title: "Foo".to_string(),
            tags: tags.iter().map(|(n, k)| Tag::new(*n, *k)).collect(),
            num_pages: 20,
        }
    }

    #[test]
    fn test_parse_identity_basic() {
        let identity = GalleryIdentity::parse("(12345) Some Title").unwrap();
        assert_eq!(identity.id, 12345);
        assert_eq!(identity.name, "Some Title");
    }

    #[test]
    fn test_parse_identity_absent_without_number() {
        assert!(GalleryIdentity::parse("Some Title").is_none());
        assert!(GalleryIdentity::parse("(abc) Some Title").is_none());
        assert!(GalleryIdentity::parse("").is_none());
    }

    #[test]
    fn test_parse_identity_ignores_leading_zeros() {
        assert_eq!(GalleryIdentity::parse_id("(0012345) Title"), Some(12345));
    }

    #[test]
    fn test_parse_identity_rejects_overflow() {
        assert!(GalleryIdentity::parse("(99999999999999999999999) Too Big").is_none());
    }

    #[test]
    fn test_parse_identity_uses_first_group() {
        let identity = GalleryIdentity::parse("(7) Sequel (2)").unwrap();
        assert_eq!(identity.id, 7);
        assert_eq!(identity.name, "Sequel (2)");
    }

    #[test]
    fn test_identity_orders_by_id_then_name() {
        let a = GalleryIdentity::parse("(9) Zeta").unwrap();
        let b = GalleryIdentity::parse("(10) Alpha").unwrap();
        let c = GalleryIdentity::parse("(10) Beta").unwrap();
        let mut all = vec![c.clone(), a.clone(), b.clone()];
        all.sort();
        assert_eq!(all, vec![a, b, c]);
    }

    #[test]
    fn test_creators_prefers_artists() {
        let meta = meta_with(&[("Alice", "artist"), ("Circle", "group")]);
        assert_eq!(meta.creators(), vec!["Alice"]);
    }

    #[test]
    fn test_creators_falls_back_to_groups_then_unknown() {
        assert_eq!(meta_with(&[("Circle", "group")]).creators(), vec!["Circle"]);
        assert_eq!(meta_with(&[("english", "language")]).creators(), vec![UNKNOWN_CREATOR]);
    }

    #[test]
    fn test_genres_exclude_structural_tags() {
        let meta = meta_with(&[
            ("Alice", "artist"),
            ("Circle", "group"),
            ("english", "language"),
            ("doujinshi", "category"),
            ("full color", "tag"),
            ("touhou", "parody"),
        ]);
        assert_eq!(meta.genres(), vec!["full color", "touhou"]);
    }

    #[test]
    fn test_full_title_prefixes_id() {
        assert_eq!(meta_with(&[]).full_title(), "(177013) Foo");
    }

    #[test]
    fn test_make_filesystem_safe() {
        assert_eq!(make_filesystem_safe("AC/DC: Live?"), "AC DC Live");
        assert_eq!(make_filesystem_safe("  spaced   out  "), "spaced out");
        assert_eq!(make_filesystem_safe(".."), "");
    }

    #[test]
    fn test_latest_gallery_entry_includes_archives() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("(5) Foo")).unwrap();
        std::fs::create_dir(root.path().join("(3) Old")).unwrap();
        std::fs::write(root.path().join("(12) Newer.CBZ"), b"PK").unwrap();
        std::fs::write(root.path().join("(99) Notes.txt"), b"x").unwrap();
        std::fs::create_dir(root.path().join(".covers")).unwrap();

        let latest = latest_gallery_entry(root.path()).unwrap();
        assert_eq!(latest.identity.id, 12);
        assert_eq!(latest.entry_name, "(12) Newer");
        assert!(!latest.is_dir);
    }

    #[test]
    fn test_find_gallery_dir_skips_archives() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::write(root.path().join("(5) Foo.zip"), b"PK").unwrap();
        assert!(find_gallery_dir(root.path(), 5).is_none());
        std::fs::create_dir(root.path().join("(5) Foo")).unwrap();
        assert_eq!(find_gallery_dir(root.path(), 5).unwrap(), root.path().join("(5) Foo"));
        assert!(find_gallery_dir(root.path(), 51).is_none());
    }

    #[test]
    fn test_meta_deserializes_type_field() {
        let meta: GalleryMeta = serde_json::from_str(
            r#"{"id": 5, "title": "Foo", "tags": [{"name": "Alice", "type": "artist"}]}"#,
        )
        .unwrap();
        assert_eq!(meta.creators(), vec!["Alice"]);
        assert_eq!(meta.num_pages, 0);
    }
}
