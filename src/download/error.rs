//! Error types for the download module.
//!
//! Every variant carries the URL or path it concerns so that mirror loops can
//! log a useful line for each failed attempt.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while fetching a page or cover.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// File system error while writing the page to disk.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The HTTP client (or the alternate transport) could not be built.
    #[error("failed to build HTTP transport: {source}")]
    Transport {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a transport build error.
    pub fn transport(source: reqwest::Error) -> Self {
        Self::Transport { source }
    }

    /// Returns true when the server answered 429 Too Many Requests.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 429, .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://i.example.net/galleries/1/1.jpg");
        assert!(error.to_string().contains("timeout"));
        assert!(
            error
                .to_string()
                .contains("https://i.example.net/galleries/1/1.jpg")
        );
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://i.example.net/1.jpg", 503);
        let msg = error.to_string();
        assert!(msg.contains("503"), "Expected '503' in: {msg}");
        assert!(msg.contains("https://i.example.net/1.jpg"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_download_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/library/Alice/(5) Foo/1.jpg"), io_error);
        assert!(error.to_string().contains("/library/Alice/(5) Foo/1.jpg"));
    }

    #[test]
    fn test_is_rate_limited_only_for_429() {
        assert!(DownloadError::http_status("u", 429).is_rate_limited());
        assert!(!DownloadError::http_status("u", 500).is_rate_limited());
        assert!(!DownloadError::timeout("u").is_rate_limited());
    }
}
