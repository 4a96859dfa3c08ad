//! HTTP client wrapper for page and cover downloads.
//!
//! This module provides the `HttpClient` struct which streams response bodies
//! to disk with connect/read timeouts, an optional proxy, and temp-file-then-
//! rename writes so an interrupted download never leaves a file at the
//! destination path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, Proxy};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, TEMP_FILE_PREFIX};
use super::error::DownloadError;

/// User-Agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = concat!("scraper-extensions/", env!("CARGO_PKG_VERSION"));

/// SOCKS endpoint of a local Tor daemon, used when `use_tor` is set without a proxy URL.
pub const TOR_PROXY_URL: &str = "socks5h://127.0.0.1:9050";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Transport settings for one [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-read timeout while waiting for headers and body chunks.
    pub read_timeout: Duration,
    /// Route every request through this proxy (`http://`, `socks5h://`).
    pub proxy_url: Option<String>,
    /// Overrides [`DEFAULT_USER_AGENT`].
    pub user_agent: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            proxy_url: None,
            user_agent: None,
        }
    }
}

/// HTTP client for downloading pages with streaming support.
///
/// Created once per extension and shared between concurrent page downloads to
/// take advantage of connection pooling. Cloning is cheap.
///
/// # Example
///
/// ```no_run
/// use scraper_extensions::download::HttpClient;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new()?;
/// let bytes = client
///     .download_to_path("https://i.example.net/galleries/1/1.jpg", Path::new("./(1) Foo/1.jpg"))
///     .await?;
/// println!("wrote {bytes} bytes");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    proxied: bool,
}

impl HttpClient {
    /// Creates a client with default timeouts and no proxy.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Transport`] if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_options(&ClientOptions::default())
    }

    /// Creates a client from explicit transport settings.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Transport`] if the proxy URL is rejected or the
    /// client cannot be built.
    #[instrument(level = "debug", skip(options), fields(proxied = options.proxy_url.is_some()))]
    pub fn with_options(options: &ClientOptions) -> Result<Self, DownloadError> {
        let mut builder = Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .gzip(true)
            .user_agent(
                options
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            );
        if let Some(proxy_url) = &options.proxy_url {
            let proxy = Proxy::all(proxy_url.as_str()).map_err(DownloadError::transport)?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(DownloadError::transport)?;
        Ok(Self {
            client,
            proxied: options.proxy_url.is_some(),
        })
    }

    /// Returns true when requests go through a proxy.
    #[must_use]
    pub fn is_proxied(&self) -> bool {
        self.proxied
    }

    /// Sends a GET request and fails on any non-2xx status.
    ///
    /// # Errors
    ///
    /// [`DownloadError::InvalidUrl`], [`DownloadError::Timeout`],
    /// [`DownloadError::Network`] or [`DownloadError::HttpStatus`].
    pub async fn get(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }
        Ok(response)
    }

    /// Downloads `url` to exactly `destination`, returning the bytes written.
    ///
    /// Parent directories are created. The body is streamed into a uniquely
    /// named temporary file beside the destination and renamed into place once
    /// complete; the temporary file is removed on any error.
    ///
    /// # Errors
    ///
    /// Any request error from [`HttpClient::get`], a stream error while reading
    /// the body, or [`DownloadError::Io`] for filesystem failures.
    #[instrument(skip_all, fields(url = %url, path = %destination.display()))]
    pub async fn download_to_path(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        let response = self.get(url).await?;

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;

        let temp_path = temp_path_for(destination);
        let mut file = File::create(&temp_path)
            .await
            .map_err(|e| DownloadError::io(temp_path.clone(), e))?;

        let outcome = match stream_to_file(&mut file, response, url, &temp_path).await {
            Ok(bytes) => {
                drop(file);
                tokio::fs::rename(&temp_path, destination)
                    .await
                    .map(|()| bytes)
                    .map_err(|e| DownloadError::io(destination, e))
            }
            Err(error) => Err(error),
        };

        if outcome.is_err() {
            debug!(path = %temp_path.display(), "cleaning up partial file after error");
            let _ = tokio::fs::remove_file(&temp_path).await;
        }

        let bytes = outcome?;
        debug!(bytes, "download complete");
        Ok(bytes)
    }

    /// Returns the underlying reqwest client (used by the catalog client).
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Streams response body to file, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}

/// `.part-<pid>-<n>-<file name>` in the destination's directory.
fn temp_path_for(destination: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(
        "{TEMP_FILE_PREFIX}{}-{n}-{name}",
        std::process::id()
    ))
}
