//! Constants for the download module (timeouts, chunking, rate limiting).

use std::time::Duration;

/// Default HTTP connect timeout (60 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 60;

/// Default HTTP read timeout (60 seconds per page).
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Default base delay for the HTTP 429 schedule (`base * 2^attempt`).
pub const DEFAULT_RATE_LIMIT_BASE: Duration = Duration::from_secs(1);

/// Upper bound on a single 429 wait so large retry budgets stay sane.
pub const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1024);

/// Prefix for in-flight page files; never matches a finished page name.
pub const TEMP_FILE_PREFIX: &str = ".part-";
