//! Tree configuration module.
//!
//! Configuration is loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `GBPTREE_PAGE_SIZE`: Page size in bytes for newly created trees (default: `8192`)
//! - `GBPTREE_VERIFY_CHECKSUM_CHAIN`: Verify the log checksum chain while reading (default: `false`)
//! - `GBPTREE_READ_ONLY`: Open trees read-only (default: `false`)
//! - `GBPTREE_PAGE_CACHE_PAGES`: Maximum number of cached pages per mapped file (default: `1024`)
//! - `GBPTREE_SAMPLING_JOB_LIMIT`: Maximum concurrent sampling jobs (default: `2`)
//! - `GBPTREE_SEEK_MAX_RETRIES`: Seek restarts allowed without progress (default: `64`)
//!
//! # Invariants
//!
//! - `page_size` is a power of two within [`MIN_PAGE_SIZE`, `MAX_PAGE_SIZE`]
//! - every count limit is non-zero

use crate::page_cache::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};

pub const ENV_PAGE_SIZE: &str = "GBPTREE_PAGE_SIZE";
pub const ENV_VERIFY_CHECKSUM_CHAIN: &str = "GBPTREE_VERIFY_CHECKSUM_CHAIN";
pub const ENV_READ_ONLY: &str = "GBPTREE_READ_ONLY";
pub const ENV_PAGE_CACHE_PAGES: &str = "GBPTREE_PAGE_CACHE_PAGES";
pub const ENV_SAMPLING_JOB_LIMIT: &str = "GBPTREE_SAMPLING_JOB_LIMIT";
pub const ENV_SEEK_MAX_RETRIES: &str = "GBPTREE_SEEK_MAX_RETRIES";

/// Tree configuration.
///
/// # Post-conditions
///
/// A value returned by `from_env()` or `from_lookup()` has passed
/// [`TreeConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    /// Page size used when a tree file is created. Existing files keep the
    /// page size recorded in their meta page.
    pub page_size: usize,
    /// Whether the log reader verifies that each transaction start entry
    /// carries the checksum of the previous commit.
    pub verify_checksum_chain: bool,
    /// Whether trees are opened read-only.
    pub read_only: bool,
    /// Maximum number of pages kept in memory per mapped file.
    pub page_cache_pages: usize,
    /// Maximum number of sampling jobs running at once.
    pub sampling_job_limit: usize,
    /// Consecutive seek restarts allowed before a seek gives up.
    pub seek_max_retries: u32,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            verify_checksum_chain: false,
            read_only: false,
            page_cache_pages: Self::DEFAULT_PAGE_CACHE_PAGES,
            sampling_job_limit: Self::DEFAULT_SAMPLING_JOB_LIMIT,
            seek_max_retries: Self::DEFAULT_SEEK_MAX_RETRIES,
        }
    }
}

impl TreeConfig {
    /// Default page size (8KB).
    pub const DEFAULT_PAGE_SIZE: usize = 8192;
    /// Default number of cached pages per mapped file.
    pub const DEFAULT_PAGE_CACHE_PAGES: usize = 1024;
    /// Default concurrent sampling job limit.
    pub const DEFAULT_SAMPLING_JOB_LIMIT: usize = 2;
    /// Default number of seek restarts without progress.
    pub const DEFAULT_SEEK_MAX_RETRIES: u32 = 64;

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unset variables fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            page_size: parse_or(&lookup, ENV_PAGE_SIZE, defaults.page_size, parse_usize)?,
            verify_checksum_chain: parse_or(
                &lookup,
                ENV_VERIFY_CHECKSUM_CHAIN,
                defaults.verify_checksum_chain,
                parse_bool,
            )?,
            read_only: parse_or(&lookup, ENV_READ_ONLY, defaults.read_only, parse_bool)?,
            page_cache_pages: parse_or(
                &lookup,
                ENV_PAGE_CACHE_PAGES,
                defaults.page_cache_pages,
                parse_usize,
            )?,
            sampling_job_limit: parse_or(
                &lookup,
                ENV_SAMPLING_JOB_LIMIT,
                defaults.sampling_job_limit,
                parse_usize,
            )?,
            seek_max_retries: parse_or(
                &lookup,
                ENV_SEEK_MAX_RETRIES,
                defaults.seek_max_retries,
                |raw| raw.parse::<u32>().map_err(|e| e.to_string()),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its documented range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_page_size(self.page_size).map_err(|message| ConfigError::InvalidValue {
            name: ENV_PAGE_SIZE.to_string(),
            message,
        })?;
        for (name, value) in [
            (ENV_PAGE_CACHE_PAGES, self.page_cache_pages),
            (ENV_SAMPLING_JOB_LIMIT, self.sampling_job_limit),
            (ENV_SEEK_MAX_RETRIES, self.seek_max_retries as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Check that `page_size` is a power of two within the supported range.
pub fn validate_page_size(page_size: usize) -> Result<(), String> {
    if !page_size.is_power_of_two() {
        return Err(format!("{page_size} is not a power of two"));
    }
    if page_size < MIN_PAGE_SIZE {
        return Err(format!("{page_size} is below the minimum of {MIN_PAGE_SIZE}"));
    }
    if page_size > MAX_PAGE_SIZE {
        return Err(format!("{page_size} exceeds the maximum of {MAX_PAGE_SIZE}"));
    }
    Ok(())
}

fn parse_or<F, T>(
    lookup: &F,
    name: &str,
    default: T,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => parse(raw.trim()).map_err(|message| ConfigError::InvalidValue {
            name: name.to_string(),
            message,
        }),
    }
}

fn parse_usize(raw: &str) -> Result<usize, String> {
    raw.parse::<usize>()
        .map_err(|e| format!("'{raw}' is not a valid number: {e}"))
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(format!("'{raw}' is not a boolean")),
    }
}
