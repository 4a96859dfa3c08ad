//! Error types for remote catalog calls.

use thiserror::Error;

use crate::download::{DownloadError, FailureType};

/// Errors that can occur while talking to the remote catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The HTTP client could not be constructed.
    #[error("failed to build catalog client: {0}")]
    Client(#[from] DownloadError),

    /// The request never produced a response.
    #[error("catalog request '{operation}' failed: {source}")]
    Request {
        /// GraphQL operation name.
        operation: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-2xx status.
    #[error("catalog request '{operation}' returned HTTP {status}")]
    HttpStatus {
        /// GraphQL operation name.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
    },

    /// The response carried a GraphQL `errors` array.
    #[error("catalog request '{operation}' failed: {message}")]
    GraphQl {
        /// GraphQL operation name.
        operation: &'static str,
        /// Joined error messages from the server.
        message: String,
    },

    /// The response body was not the expected JSON shape.
    #[error("catalog response for '{operation}' could not be decoded: {message}")]
    Decode {
        /// GraphQL operation name.
        operation: &'static str,
        /// Decoder message.
        message: String,
    },

    /// The server has no source named "Local source".
    #[error("catalog has no local source")]
    NoLocalSource,

    /// The call needs `prepare()` to have resolved the category first.
    #[error("catalog category '{0}' is not resolved")]
    CategoryUnresolved(String),
}

impl CatalogError {
    pub(crate) fn request(operation: &'static str, source: reqwest::Error) -> Self {
        Self::Request { operation, source }
    }

    pub(crate) fn decode(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            operation,
            message: message.into(),
        }
    }

    /// Classifies the failure for the shared retry policy.
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Request { source, .. } if source.is_timeout() || source.is_connect() => {
                FailureType::Transient
            }
            Self::HttpStatus { status, .. } => match status {
                401 | 403 => FailureType::NeedsAuth,
                429 => FailureType::RateLimited,
                408 | 500..=599 => FailureType::Transient,
                _ => FailureType::Permanent,
            },
            _ => FailureType::Permanent,
        }
    }
}
