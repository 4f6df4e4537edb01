//! Loader configuration
//!
//! Settings come from `EDGELOAD_*` environment variables (a `.env` file is
//! loaded by the binary first). Each pipeline component gets its own small
//! config struct derived from [`LoaderConfig`].

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::error::{LoaderError, Result};
use crate::remote::http::{DEFAULT_API_VERSION, DEFAULT_TIMEOUT_SECS};
use crate::sort::DEFAULT_BUFFER_ROWS;
use crate::types::UploadMode;
use crate::upload::{
    retry::RETRY_DELAY_SECS, UploadConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_POLLS, DEFAULT_MAX_WORKERS,
    DEFAULT_POLL_INTERVAL_SECS,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Environment Variables
// ============================================================================

pub const ENV_SERVER_URL: &str = "EDGELOAD_SERVER_URL";
pub const ENV_ACCESS_TOKEN: &str = "EDGELOAD_ACCESS_TOKEN";
pub const ENV_API_VERSION: &str = "EDGELOAD_API_VERSION";
pub const ENV_UPLOAD_WORKERS: &str = "EDGELOAD_UPLOAD_WORKERS";
pub const ENV_CHUNK_SIZE: &str = "EDGELOAD_CHUNK_SIZE";
pub const ENV_POLL_INTERVAL_SECS: &str = "EDGELOAD_POLL_INTERVAL_SECS";
pub const ENV_MAX_ATTEMPTS: &str = "EDGELOAD_MAX_ATTEMPTS";
pub const ENV_SORT_BUFFER_ROWS: &str = "EDGELOAD_SORT_BUFFER_ROWS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "EDGELOAD_REQUEST_TIMEOUT_SECS";
pub const ENV_ARCHIVE_DIR: &str = "EDGELOAD_ARCHIVE_DIR";

/// Default root of the per-alias artifact archive.
pub const DEFAULT_ARCHIVE_DIR: &str = "archive";

#[derive(Clone)]
pub struct LoaderConfig {
    pub server_url: String,
    pub access_token: String,
    pub api_version: String,
    pub upload_workers: usize,
    pub chunk_size: usize,
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    pub sort_buffer_rows: usize,
    pub request_timeout_secs: u64,
    pub archive_dir: PathBuf,
}

impl std::fmt::Debug for LoaderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderConfig")
            .field("server_url", &self.server_url)
            .field("access_token", &if self.access_token.is_empty() { "" } else { "***" })
            .field("api_version", &self.api_version)
            .field("upload_workers", &self.upload_workers)
            .field("chunk_size", &self.chunk_size)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("max_attempts", &self.max_attempts)
            .field("sort_buffer_rows", &self.sort_buffer_rows)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("archive_dir", &self.archive_dir)
            .finish()
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            access_token: String::new(),
            api_version: DEFAULT_API_VERSION.to_string(),
            upload_workers: DEFAULT_MAX_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            sort_buffer_rows: DEFAULT_BUFFER_ROWS,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            archive_dir: PathBuf::from(DEFAULT_ARCHIVE_DIR),
        }
    }
}

/// Read `key` and parse it, falling back to `default` when unset or blank.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| LoaderError::Config(format!("{key} has an invalid value '{raw}'"))),
        _ => Ok(default),
    }
}

impl LoaderConfig {
    /// Load from the environment. Call [`LoaderConfig::validate`] once the
    /// run mode is known.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            server_url: std::env::var(ENV_SERVER_URL).unwrap_or_default(),
            access_token: std::env::var(ENV_ACCESS_TOKEN).unwrap_or_default(),
            api_version: env_or(ENV_API_VERSION, defaults.api_version)?,
            upload_workers: env_or(ENV_UPLOAD_WORKERS, defaults.upload_workers)?,
            chunk_size: env_or(ENV_CHUNK_SIZE, defaults.chunk_size)?,
            poll_interval_secs: env_or(ENV_POLL_INTERVAL_SECS, defaults.poll_interval_secs)?,
            max_attempts: env_or(ENV_MAX_ATTEMPTS, defaults.max_attempts)?,
            sort_buffer_rows: env_or(ENV_SORT_BUFFER_ROWS, defaults.sort_buffer_rows)?,
            request_timeout_secs: env_or(ENV_REQUEST_TIMEOUT_SECS, defaults.request_timeout_secs)?,
            archive_dir: env_or(ENV_ARCHIVE_DIR, defaults.archive_dir)?,
        })
    }

    /// Reject settings the pipeline cannot run with. The server URL is only
    /// required when a real remote will be contacted.
    pub fn validate(&self, dry_run: bool) -> Result<()> {
        if self.upload_workers == 0 {
            return Err(LoaderError::Config(format!("{ENV_UPLOAD_WORKERS} must be greater than 0")));
        }
        if self.max_attempts == 0 {
            return Err(LoaderError::Config(format!("{ENV_MAX_ATTEMPTS} must be greater than 0")));
        }
        if self.chunk_size == 0 {
            return Err(LoaderError::Config(format!("{ENV_CHUNK_SIZE} must be greater than 0")));
        }
        if self.sort_buffer_rows == 0 {
            return Err(LoaderError::Config(format!("{ENV_SORT_BUFFER_ROWS} must be greater than 0")));
        }
        if !dry_run && self.server_url.trim().is_empty() {
            return Err(LoaderError::Config(format!(
                "{ENV_SERVER_URL} is required unless --dry-run is given"
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upload_config(&self, mode: UploadMode) -> UploadConfig {
        UploadConfig {
            mode,
            max_workers: self.upload_workers,
            max_attempts: self.max_attempts,
            retry_base: Duration::from_secs(RETRY_DELAY_SECS),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_polls: DEFAULT_MAX_POLLS,
        }
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            chunk_size: self.chunk_size,
        }
    }

    pub fn sort_config(&self) -> SortConfig {
        SortConfig {
            buffer_rows: self.sort_buffer_rows,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        LoaderConfig::default().chunk_config()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortConfig {
    pub buffer_rows: usize,
}

impl Default for SortConfig {
    fn default() -> Self {
        LoaderConfig::default().sort_config()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_VARS: &[&str] = &[
        ENV_SERVER_URL,
        ENV_ACCESS_TOKEN,
        ENV_API_VERSION,
        ENV_UPLOAD_WORKERS,
        ENV_CHUNK_SIZE,
        ENV_POLL_INTERVAL_SECS,
        ENV_MAX_ATTEMPTS,
        ENV_SORT_BUFFER_ROWS,
        ENV_REQUEST_TIMEOUT_SECS,
        ENV_ARCHIVE_DIR,
    ];

    fn clear_env() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_unset() {
        clear_env();
        let config = LoaderConfig::from_env().unwrap();
        assert_eq!(config.upload_workers, 3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.archive_dir, PathBuf::from("archive"));
        assert!(config.validate(true).is_ok());
        assert!(config.validate(false).is_err());
    }

    #[test]
    #[serial]
    fn test_reads_overrides() {
        clear_env();
        std::env::set_var(ENV_SERVER_URL, "https://example.my.salesforce.com");
        std::env::set_var(ENV_UPLOAD_WORKERS, "5");
        std::env::set_var(ENV_CHUNK_SIZE, "1024");
        std::env::set_var(ENV_POLL_INTERVAL_SECS, "1");

        let config = LoaderConfig::from_env().unwrap();
        assert!(config.validate(false).is_ok());
        assert_eq!(config.chunk_config().chunk_size, 1024);

        let upload = config.upload_config(UploadMode::Batch);
        assert_eq!(upload.max_workers, 5);
        assert_eq!(upload.poll_interval, Duration::from_secs(1));
        assert_eq!(upload.mode, UploadMode::Batch);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_rejects_unparsable_and_zero_values() {
        clear_env();
        std::env::set_var(ENV_CHUNK_SIZE, "eight megs");
        assert!(matches!(LoaderConfig::from_env(), Err(LoaderError::Config(_))));

        std::env::set_var(ENV_CHUNK_SIZE, "0");
        let config = LoaderConfig::from_env().unwrap();
        assert!(config.validate(true).is_err());
        clear_env();
    }

    #[test]
    fn test_debug_hides_token() {
        let config = LoaderConfig {
            access_token: "00Dxx!secret".into(),
            ..Default::default()
        };
        assert!(!format!("{config:?}").contains("secret"));
    }
}
