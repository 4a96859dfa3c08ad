//! Mirror-fallback page downloader.
//!
//! A page usually has several candidate URLs (one per image server). The
//! [`MirrorDownloader`] walks them in the given order with a bounded number of
//! attempts each, and when every primary attempt has failed it rebuilds an
//! alternate transport once and walks the list again with one attempt per
//! mirror.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use super::client::{ClientOptions, HttpClient, TOR_PROXY_URL};
use super::error::DownloadError;
use super::retry::{FailureType, RetryPolicy, Stage, classify_error};
use crate::config::ExtensionConfig;

/// Builds a fresh alternate transport for the fallback pass.
#[async_trait]
pub trait TransportRebuilder: Send + Sync {
    /// Returns a newly built client; each call should yield a new session.
    async fn rebuild(&self) -> Result<HttpClient, DownloadError>;
}

/// Rebuilds a proxied client (Tor or an explicit proxy) from scratch.
///
/// A new client means a new connection pool, which for Tor's SOCKS port with
/// isolated streams means a fresh circuit.
#[derive(Debug, Clone)]
pub struct ProxyTransport {
    options: ClientOptions,
}

impl ProxyTransport {
    /// Creates a rebuilder for the given proxied client options.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    /// Returns a rebuilder when the configuration enables an alternate transport.
    #[must_use]
    pub fn from_config(config: &ExtensionConfig) -> Option<Self> {
        let proxy_url = match (&config.proxy_url, config.use_tor) {
            (Some(url), _) => url.clone(),
            (None, true) => TOR_PROXY_URL.to_string(),
            (None, false) => return None,
        };
        Some(Self::new(ClientOptions {
            proxy_url: Some(proxy_url),
            ..config.client_options()
        }))
    }
}

#[async_trait]
impl TransportRebuilder for ProxyTransport {
    async fn rebuild(&self) -> Result<HttpClient, DownloadError> {
        HttpClient::with_options(&self.options)
    }
}

/// One page of a gallery and its candidate URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Gallery id, for log context.
    pub gallery: u64,
    /// 1-based page number, for log context.
    pub page: u32,
    /// Candidate URLs in preference order.
    pub mirrors: Vec<String>,
    /// Final path of the page file.
    pub destination: PathBuf,
}

/// Downloads one page from an ordered list of mirrors.
#[derive(Clone)]
pub struct MirrorDownloader {
    client: HttpClient,
    policy: RetryPolicy,
    stage: Stage,
    fallback: Option<Arc<dyn TransportRebuilder>>,
    dry_run: bool,
}

impl std::fmt::Debug for MirrorDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorDownloader")
            .field("policy", &self.policy)
            .field("stage", &self.stage)
            .field("fallback", &self.fallback.is_some())
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl MirrorDownloader {
    /// Creates a downloader for image pages with no fallback transport.
    #[must_use]
    pub fn new(client: HttpClient, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            stage: Stage::Image,
            fallback: None,
            dry_run: false,
        }
    }

    /// Builds the downloader an extension uses, wiring the proxy fallback when configured.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Transport`] if the primary client cannot be built.
    pub fn from_config(config: &ExtensionConfig) -> Result<Self, DownloadError> {
        let client = HttpClient::with_options(&config.client_options())?;
        let mut downloader = Self::new(client, RetryPolicy::with_max_attempts(config.max_retries))
            .with_dry_run(config.dry_run);
        if let Some(transport) = ProxyTransport::from_config(config) {
            downloader = downloader.with_fallback(Arc::new(transport));
        }
        Ok(downloader)
    }

    /// Enables the single fallback pass through a rebuilt transport.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn TransportRebuilder>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Selects which backoff schedule applies to non-429 failures.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// In dry-run mode nothing is fetched and every call reports success.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Downloads a page, logging with its gallery and page number.
    #[instrument(skip_all, fields(gallery = request.gallery, page = request.page))]
    pub async fn download_page(&self, request: &PageRequest) -> bool {
        self.download(&request.mirrors, &request.destination).await
    }

    /// Downloads the first mirror that answers to `destination`.
    ///
    /// Returns `false` when `mirrors` is empty or every attempt (including the
    /// fallback pass) failed. An existing destination is treated as already
    /// downloaded and costs no requests.
    pub async fn download(&self, mirrors: &[String], destination: &Path) -> bool {
        if mirrors.is_empty() {
            warn!(path = %destination.display(), "no mirrors for page, skipping");
            return false;
        }

        if tokio::fs::try_exists(destination).await.unwrap_or(false) {
            debug!(path = %destination.display(), "already exists, skipping");
            return true;
        }

        if self.dry_run {
            info!(url = %mirrors[0], path = %destination.display(), "[DRY RUN] would download page");
            return true;
        }

        if self
            .try_mirrors(&self.client, mirrors, destination, self.policy.max_attempts())
            .await
        {
            return true;
        }

        let Some(fallback) = &self.fallback else {
            error!(path = %destination.display(), mirrors = ?mirrors, "all mirrors failed");
            return false;
        };

        warn!(path = %destination.display(), "all retries failed, rebuilding transport for one more pass");
        let rebuilt = match fallback.rebuild().await {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "failed to rebuild alternate transport");
                return false;
            }
        };

        let success = self.try_mirrors(&rebuilt, mirrors, destination, 1).await;
        if !success {
            error!(
                path = %destination.display(),
                mirrors = ?mirrors,
                "all mirrors failed after transport rebuild"
            );
        }
        success
    }

    /// One pass over `mirrors` with up to `attempts` tries each.
    async fn try_mirrors(
        &self,
        client: &HttpClient,
        mirrors: &[String],
        destination: &Path,
        attempts: u32,
    ) -> bool {
        for url in mirrors {
            for attempt in 1..=attempts {
                match client.download_to_path(url, destination).await {
                    Ok(bytes) => {
                        debug!(url = %url, attempt, bytes, path = %destination.display(), "downloaded page");
                        return true;
                    }
                    Err(e) => {
                        let failure = classify_error(&e);
                        let has_next = attempt < attempts;
                        let delay = if has_next {
                            self.policy.delay_for(failure, self.stage, attempt)
                        } else {
                            std::time::Duration::ZERO
                        };
                        if failure == FailureType::RateLimited {
                            warn!(url = %url, attempt, wait_ms = delay.as_millis(), "429 rate limit hit");
                        } else {
                            warn!(
                                url = %url,
                                attempt,
                                stage = self.stage.as_str(),
                                error = %e,
                                wait_ms = delay.as_millis(),
                                "mirror attempt failed"
                            );
                        }
                        if has_next && !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            warn!(url = %url, attempts, "mirror exhausted, trying next mirror");
        }
        false
    }
}
