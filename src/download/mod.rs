//! Page download machinery: HTTP client, retry policy and mirror fallback.
//!
//! # Features
//!
//! - Streaming downloads (memory-efficient for large pages)
//! - Temp-file-then-rename writes, so a crashed run never leaves a partial page
//!   at its final path
//! - Configurable connect/read timeouts (60s each by default) and optional proxy
//! - Per-stage exponential backoff with jitter, `2^attempt` waits on HTTP 429
//! - Ordered mirror iteration with a single rebuilt-transport fallback pass
//!
//! # Example
//!
//! ```no_run
//! use scraper_extensions::download::{HttpClient, MirrorDownloader, RetryPolicy};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = MirrorDownloader::new(HttpClient::new()?, RetryPolicy::default());
//! let mirrors = vec![
//!     "https://i1.example.net/galleries/5/1.jpg".to_string(),
//!     "https://i2.example.net/galleries/5/1.jpg".to_string(),
//! ];
//! let ok = downloader.download(&mirrors, Path::new("./Alice/(5) Foo/1.jpg")).await;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod mirror;
mod retry;

pub use client::{ClientOptions, DEFAULT_USER_AGENT, HttpClient, TOR_PROXY_URL};
pub use error::DownloadError;
pub use mirror::{MirrorDownloader, PageRequest, ProxyTransport, TransportRebuilder};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, Stage, StageBackoff,
    classify_error,
};

// Use `Result<T, DownloadError>` explicitly in function signatures; no module-local alias.
