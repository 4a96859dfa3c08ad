//! Retry logic with per-stage exponential backoff.
//!
//! This module provides the [`RetryPolicy`] shared by every retrying call
//! site (page mirrors, cover fetches, catalog requests) and the
//! [`FailureType`] classification used to pick a delay schedule.
//!
//! # Overview
//!
//! When a request fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::NeedsAuth`] - Credentials missing or rejected
//! - [`FailureType::RateLimited`] - HTTP 429, waits `rate_limit_base * 2^attempt`
//!
//! Everything that is not rate limited waits the backoff of its [`Stage`]:
//! single image pages back off quickly, gallery-level operations (metadata,
//! catalog calls) back off more patiently.
//!
//! # Example
//!
//! ```
//! use scraper_extensions::download::{
//!     DownloadError, FailureType, RetryDecision, RetryPolicy, Stage, classify_error,
//! };
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://i.example.net/galleries/1/1.jpg", 503);
//! let failure_type = classify_error(&error);
//!
//! match policy.should_retry(failure_type, Stage::Image, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;
use super::constants::{DEFAULT_RATE_LIMIT_BASE, MAX_RATE_LIMIT_DELAY};

/// Default maximum attempts per mirror.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Maximum jitter added to stage delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Kind of operation whose backoff schedule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// A single image page (or cover) fetch.
    Image,
    /// A gallery-level operation: metadata lookups and catalog calls.
    Gallery,
}

impl Stage {
    /// Returns a stable label for log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Gallery => "gallery",
        }
    }
}

/// Classification of download failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection refused.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 400 Bad Request, invalid URL.
    Permanent,

    /// Authentication or authorization required (401/403).
    NeedsAuth,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Exponential backoff parameters for one [`Stage`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageBackoff {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f32,
}

impl StageBackoff {
    const IMAGE: Self = Self {
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(8),
        multiplier: 2.0,
    };

    const GALLERY: Self = Self {
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(32),
        multiplier: 2.0,
    };

    const NONE: Self = Self {
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        multiplier: 1.0,
    };
}

/// Configuration for retry behavior.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - image stage: 0.5s base, 8s cap
/// - gallery stage: 2s base, 32s cap
/// - 429 schedule: `1s * 2^attempt`
/// - jitter: up to 500ms
///
/// # Delay Calculation
///
/// ```text
/// stage delay = min(base * multiplier^(attempt - 1), max) + jitter
/// 429 delay   = rate_limit_base * 2^attempt
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts per mirror (including the initial attempt).
    max_attempts: u32,
    image: StageBackoff,
    gallery: StageBackoff,
    rate_limit_base: Duration,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            image: StageBackoff::IMAGE,
            gallery: StageBackoff::GALLERY,
            rate_limit_base: DEFAULT_RATE_LIMIT_BASE,
            max_jitter: MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Creates a policy that never sleeps, for tests and dry runs.
    #[must_use]
    pub fn without_delays(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            image: StageBackoff::NONE,
            gallery: StageBackoff::NONE,
            rate_limit_base: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Overrides the backoff used for one stage.
    #[must_use]
    pub fn with_stage_backoff(mut self, stage: Stage, backoff: StageBackoff) -> Self {
        match stage {
            Stage::Image => self.image = backoff,
            Stage::Gallery => self.gallery = backoff,
        }
        self
    }

    /// Overrides the base of the 429 schedule.
    #[must_use]
    pub fn with_rate_limit_base(mut self, base: Duration) -> Self {
        self.rate_limit_base = base;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry a failed request at a given stage.
    ///
    /// `attempt` is the 1-indexed attempt that just failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, stage: Stage, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "authentication required - check catalog credentials".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.delay_for(failure_type, stage, attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Returns how long to wait after `attempt` failed with `failure_type`.
    ///
    /// Rate limiting always uses the 429 schedule regardless of stage.
    #[must_use]
    pub fn delay_for(&self, failure_type: FailureType, stage: Stage, attempt: u32) -> Duration {
        match failure_type {
            FailureType::RateLimited => self.rate_limit_delay(attempt),
            _ => self.backoff(stage, attempt),
        }
    }

    /// `rate_limit_base * 2^attempt`, capped.
    #[must_use]
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.rate_limit_base
            .saturating_mul(factor)
            .min(MAX_RATE_LIMIT_DELAY)
    }

    /// Stage backoff: `min(base * multiplier^(attempt - 1), max) + jitter`.
    #[must_use]
    pub fn backoff(&self, stage: Stage, attempt: u32) -> Duration {
        let params = match stage {
            Stage::Image => self.image,
            Stage::Gallery => self.gallery,
        };

        let base_ms = params.base_delay.as_secs_f64() * 1000.0;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(params.multiplier).powf(exponent);
        let capped_ms = delay_ms.min(params.max_delay.as_secs_f64() * 1000.0);

        Duration::from_secs_f64(capped_ms.max(0.0) / 1000.0) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = rand::thread_rng().gen_range(0..=max_ms);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies a download error into a failure type.
///
/// | Error | Type |
/// |-------|------|
/// | 429 | RateLimited |
/// | 401, 403 | NeedsAuth |
/// | 408, 5xx | Transient |
/// | other 4xx | Permanent |
/// | Timeout, Network | Transient |
/// | Network (TLS) | Permanent |
/// | IO, InvalidUrl, Transport | Permanent |
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Timeout { .. } => FailureType::Transient,
        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        DownloadError::Io { .. } | DownloadError::InvalidUrl { .. } | DownloadError::Transport { .. } => {
            FailureType::Permanent
        }
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 | 403 => FailureType::NeedsAuth,
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
