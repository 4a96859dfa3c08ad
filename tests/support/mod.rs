//! Helpers shared by the integration test binaries.

#![allow(dead_code)]

pub mod socket_guard;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber once per binary; `RUST_LOG` overrides
/// the default `scraper_extensions=debug` filter.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scraper_extensions=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Creates `<root>/<creator>/<gallery>/{1,2}.jpg` for every gallery.
pub fn creator_with_galleries(root: &Path, creator: &str, galleries: &[&str]) -> PathBuf {
    let creator_dir = root.join(creator);
    for gallery in galleries {
        let gallery_dir = creator_dir.join(gallery);
        fs::create_dir_all(&gallery_dir).expect("create gallery dir");
        fs::write(gallery_dir.join("1.jpg"), format!("cover of {gallery}")).expect("write page 1");
        fs::write(gallery_dir.join("2.jpg"), b"page two").expect("write page 2");
    }
    creator_dir
}

/// Root-level `cover` / `cover.*` names of a creator directory, sorted.
pub fn cover_links(creator_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(creator_dir)
        .expect("read creator dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name == "cover" || name.starts_with("cover."))
        .collect();
    names.sort();
    names
}
