//! Extension configuration.
//!
//! One [`ExtensionConfig`] is built per run and handed to every component's
//! constructor. It is loaded from a `key = value` file (`#` comments, quoted
//! strings, integers, booleans) and then overridden by `SCRAPER_EXT_<KEY>`
//! environment variables.
//!
//! ```text
//! library_root = "/srv/manga"
//! gallery_format = "cbz"     # directory | zip | cbz
//! archive_mode = "internal"  # external | internal
//! max_retries = 5
//! use_tor = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::archive::{ArchiveMode, GalleryFormat};
use crate::download::{ClientOptions, DEFAULT_MAX_RETRIES};

/// Prefix for environment overrides, e.g. `SCRAPER_EXT_MAX_RETRIES=5`.
pub const ENV_PREFIX: &str = "SCRAPER_EXT_";

/// Default Suwayomi GraphQL endpoint.
pub const DEFAULT_GRAPHQL_URL: &str = "http://127.0.0.1:4567/api/graphql";

/// Default name of the catalog category that holds scraped creators.
pub const DEFAULT_CATEGORY_NAME: &str = "ScrapedMangas";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A line is not of the form `key = value`.
    #[error("invalid config syntax on line {line}: expected key = value")]
    Syntax {
        /// 1-based line number.
        line: usize,
    },

    /// The key is not a known configuration key.
    #[error("unknown configuration key '{key}' ({origin})")]
    UnknownKey {
        /// The offending key.
        key: String,
        /// Where the key came from (`line N` or an environment variable name).
        origin: String,
    },

    /// The value for a known key could not be parsed.
    #[error("invalid value for `{key}` ({origin}): {message}")]
    InvalidValue {
        /// The key being set.
        key: String,
        /// Where the value came from.
        origin: String,
        /// What was expected.
        message: String,
    },

    /// A parsed value failed validation.
    #[error("invalid config value for `{key}`: {value}. Expected {expected}")]
    OutOfRange {
        /// The key being validated.
        key: &'static str,
        /// The rejected value.
        value: String,
        /// Human-readable description of the accepted range.
        expected: String,
    },

    /// `library_root` was never set.
    #[error("`library_root` is required")]
    MissingLibraryRoot,
}

/// Run-wide settings shared by all extension components.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionConfig {
    /// Directory holding one subdirectory per creator.
    pub library_root: PathBuf,
    /// How finished galleries are stored.
    pub gallery_format: GalleryFormat,
    /// Who produces archives when `gallery_format` is zip/cbz.
    pub archive_mode: ArchiveMode,
    /// Maximum wait for an archive to appear before keeping the directory.
    pub archive_wait_secs: u64,
    /// Interval between archive presence checks.
    pub archive_poll_interval_ms: u64,
    /// Attempts per mirror (1..=10).
    pub max_retries: u32,
    /// Route the fallback pass through a local Tor SOCKS proxy.
    pub use_tor: bool,
    /// Explicit proxy for the fallback pass; wins over `use_tor`.
    pub proxy_url: Option<String>,
    /// HTTP connect timeout.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout.
    pub read_timeout_secs: u64,
    /// Suwayomi GraphQL endpoint.
    pub graphql_url: String,
    /// Catalog category managed by the reconciler.
    pub category_name: String,
    /// Base polling tick for catalog jobs.
    pub population_tick_secs: u64,
    /// Upper bound on a single wait for the catalog update job.
    pub job_wait_timeout_secs: u64,
    /// Optional HTTP basic auth user for the catalog.
    pub basic_auth_username: Option<String>,
    /// Optional HTTP basic auth password for the catalog.
    pub basic_auth_password: Option<String>,
    /// Genres written to `details.json`.
    pub max_genres_stored: usize,
    /// Genres tracked per creator in `creators_metadata.json`.
    pub max_genres_parsed: usize,
    /// Log what would happen without touching network or disk.
    pub dry_run: bool,
    /// Never run post-batch maintenance.
    pub skip_post_batch: bool,
    /// Never run post-run maintenance.
    pub skip_post_run: bool,
    /// The orchestrator is in an archiving run; post-batch work is skipped.
    pub archiving: bool,
}

impl ExtensionConfig {
    /// Creates a configuration with defaults for everything but the library root.
    #[must_use]
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: library_root.into(),
            gallery_format: GalleryFormat::Directory,
            archive_mode: ArchiveMode::External,
            archive_wait_secs: 120,
            archive_poll_interval_ms: 500,
            max_retries: DEFAULT_MAX_RETRIES,
            use_tor: false,
            proxy_url: None,
            connect_timeout_secs: 60,
            read_timeout_secs: 60,
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            category_name: DEFAULT_CATEGORY_NAME.to_string(),
            population_tick_secs: 2,
            job_wait_timeout_secs: 600,
            basic_auth_username: None,
            basic_auth_password: None,
            max_genres_stored: 50,
            max_genres_parsed: 1000,
            dry_run: false,
            skip_post_batch: false,
            skip_post_run: false,
            archiving: false,
        }
    }

    /// Loads a config file, applies `SCRAPER_EXT_*` overrides and validates.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from reading, parsing or validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse_unvalidated(&raw)?;
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates config text without consulting the environment.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from parsing or validation.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config = Self::parse_unvalidated(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_unvalidated(raw: &str) -> Result<Self, ConfigError> {
        let mut config = Self::new(PathBuf::new());
        for (line_index, raw_line) in raw.lines().enumerate() {
            let line = strip_inline_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax {
                    line: line_index + 1,
                });
            };
            let origin = format!("line {}", line_index + 1);
            config.set(key.trim(), value.trim(), true, &origin)?;
        }
        Ok(config)
    }

    /// Applies `SCRAPER_EXT_<KEY>` overrides from the given variables.
    ///
    /// Values are taken verbatim; strings need no quotes. Variables without the
    /// prefix are ignored.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownKey`] or [`ConfigError::InvalidValue`].
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            self.set(&key, value.trim(), false, &name)?;
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str, quoted: bool, origin: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            origin: origin.to_string(),
            message,
        };
        let string = || parse_string(value, quoted).map_err(invalid);
        let integer = || parse_u64(value).map_err(invalid);
        let boolean = || parse_boolean(value).map_err(invalid);

        match key {
            "library_root" => self.library_root = PathBuf::from(string()?),
            "gallery_format" => self.gallery_format = GalleryFormat::parse_lenient(&string()?),
            "archive_mode" => {
                let parsed = string()?;
                self.archive_mode = ArchiveMode::parse(&parsed)
                    .ok_or_else(|| invalid("expected one of: external, internal".to_string()))?;
            }
            "archive_wait_secs" => self.archive_wait_secs = integer()?,
            "archive_poll_interval_ms" => self.archive_poll_interval_ms = integer()?,
            "max_retries" => {
                self.max_retries = u32::try_from(integer()?)
                    .map_err(|_| invalid("integer value out of range for u32".to_string()))?;
            }
            "use_tor" => self.use_tor = boolean()?,
            "proxy_url" => self.proxy_url = non_empty(string()?),
            "connect_timeout_secs" => self.connect_timeout_secs = integer()?,
            "read_timeout_secs" => self.read_timeout_secs = integer()?,
            "graphql_url" => self.graphql_url = string()?,
            "category_name" => self.category_name = string()?,
            "population_tick_secs" => self.population_tick_secs = integer()?,
            "job_wait_timeout_secs" => self.job_wait_timeout_secs = integer()?,
            "basic_auth_username" => self.basic_auth_username = non_empty(string()?),
            "basic_auth_password" => self.basic_auth_password = non_empty(string()?),
            "max_genres_stored" => {
                self.max_genres_stored = usize::try_from(integer()?)
                    .map_err(|_| invalid("integer value out of range".to_string()))?;
            }
            "max_genres_parsed" => {
                self.max_genres_parsed = usize::try_from(integer()?)
                    .map_err(|_| invalid("integer value out of range".to_string()))?;
            }
            "dry_run" => self.dry_run = boolean()?,
            "skip_post_batch" => self.skip_post_batch = boolean()?,
            "skip_post_run" => self.skip_post_run = boolean()?,
            "archiving" => self.archiving = boolean()?,
            unknown => {
                return Err(ConfigError::UnknownKey {
                    key: unknown.to_string(),
                    origin: origin.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Validates ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingLibraryRoot`] or [`ConfigError::OutOfRange`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.library_root.as_os_str().is_empty() {
            return Err(ConfigError::MissingLibraryRoot);
        }
        check_range("max_retries", u64::from(self.max_retries), 1, 10)?;
        check_range("connect_timeout_secs", self.connect_timeout_secs, 1, 3600)?;
        check_range("read_timeout_secs", self.read_timeout_secs, 1, 3600)?;
        check_range("archive_wait_secs", self.archive_wait_secs, 0, 86_400)?;
        check_range("archive_poll_interval_ms", self.archive_poll_interval_ms, 1, 60_000)?;
        check_range("population_tick_secs", self.population_tick_secs, 0, 300)?;
        check_range("job_wait_timeout_secs", self.job_wait_timeout_secs, 1, 86_400)?;
        check_range("max_genres_stored", self.max_genres_stored as u64, 1, 10_000)?;
        check_range("max_genres_parsed", self.max_genres_parsed as u64, 1, 100_000)?;

        if self.max_genres_stored > self.max_genres_parsed {
            return Err(ConfigError::OutOfRange {
                key: "max_genres_stored",
                value: self.max_genres_stored.to_string(),
                expected: format!("at most max_genres_parsed ({})", self.max_genres_parsed),
            });
        }

        let graphql_ok = Url::parse(&self.graphql_url)
            .is_ok_and(|url| matches!(url.scheme(), "http" | "https"));
        if !graphql_ok {
            return Err(ConfigError::OutOfRange {
                key: "graphql_url",
                value: self.graphql_url.clone(),
                expected: "an absolute http(s) URL".to_string(),
            });
        }

        if self.category_name.trim().is_empty() {
            return Err(ConfigError::OutOfRange {
                key: "category_name",
                value: String::new(),
                expected: "a non-empty category name".to_string(),
            });
        }

        if self.basic_auth_password.is_some() && self.basic_auth_username.is_none() {
            return Err(ConfigError::OutOfRange {
                key: "basic_auth_username",
                value: String::new(),
                expected: "a username whenever basic_auth_password is set".to_string(),
            });
        }

        Ok(())
    }

    /// HTTP settings for the primary (direct) page client.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            ..ClientOptions::default()
        }
    }

    /// Maximum archive wait as a [`Duration`].
    #[must_use]
    pub fn archive_wait(&self) -> Duration {
        Duration::from_secs(self.archive_wait_secs)
    }

    /// Archive poll interval as a [`Duration`].
    #[must_use]
    pub fn archive_poll_interval(&self) -> Duration {
        Duration::from_millis(self.archive_poll_interval_ms)
    }

    /// Catalog polling tick as a [`Duration`].
    #[must_use]
    pub fn population_tick(&self) -> Duration {
        Duration::from_secs(self.population_tick_secs)
    }

    /// Catalog job wait bound as a [`Duration`].
    #[must_use]
    pub fn job_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.job_wait_timeout_secs)
    }

    /// `creators_metadata.json` under the library root.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.library_root.join(crate::library::STATE_FILE_NAME)
    }
}

fn check_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
            expected: format!("range: {min}..={max}"),
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string(raw_value: &str, quoted: bool) -> Result<String, String> {
    if !quoted {
        return Ok(raw_value.to_string());
    }
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        return Err("expected double-quoted string".to_string());
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_u64(raw_value: &str) -> Result<u64, String> {
    let token = raw_value.trim();
    if token.is_empty() {
        return Err("expected integer value".to_string());
    }
    token
        .parse::<u64>()
        .map_err(|e| format!("expected non-negative integer ({e})"))
}

fn parse_boolean(raw_value: &str) -> Result<bool, String> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err("expected 'true' or 'false'".to_string()),
    }
}
