//! Fixtures shared by unit tests.

#![allow(clippy::unwrap_used)]

mod catalog;
pub mod socket_guard;

pub use catalog::FakeCatalog;

use std::fs;
use std::path::{Path, PathBuf};

/// Creates `<root>/<creator>` with one `"(ID) NAME"` directory per gallery,
/// each holding a `1.jpg` first page.
pub fn creator_with_galleries(root: &Path, creator: &str, galleries: &[&str]) -> PathBuf {
    let creator_dir = root.join(creator);
    fs::create_dir_all(&creator_dir).unwrap();
    for gallery in galleries {
        let gallery_dir = creator_dir.join(gallery);
        fs::create_dir_all(&gallery_dir).unwrap();
        fs::write(gallery_dir.join("1.jpg"), format!("first page of {gallery}")).unwrap();
        fs::write(gallery_dir.join("2.jpg"), b"second page").unwrap();
    }
    creator_dir
}

/// Names of root-level `cover` / `cover.*` entries, sorted.
pub fn cover_links(creator_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(creator_dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name == "cover" || name.starts_with("cover."))
        .collect();
    names.sort();
    names
}
