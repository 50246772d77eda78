//! User settings and the engine configuration derived from them.
//!
//! Settings are read from `config.toml` in the platform config directory.
//! Every field is optional; CLI flags override whatever the file says.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Provider limit: upload parts are always 4 MiB.
pub const UPLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
/// Default byte-range size for downloads.
pub const DOWNLOAD_CHUNK_SIZE: u64 = 50 * 1024 * 1024;
/// Largest object the provider accepts in one create call.
pub const MAX_OBJECT_SIZE: u64 = 20 * 1024 * 1024 * 1024;
/// Upper bound on concurrent network operations.
pub const MAX_CONCURRENCY: usize = 16;
/// Where uploads land when no prefix is given.
pub const DEFAULT_REMOTE_ROOT: &str = "/apps/pan-transfer";

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub access_token: Option<String>,
    pub output_dir: Option<String>,
    pub remote_root: Option<String>,
    pub concurrency: Option<usize>,
    pub concurrent_files: Option<usize>,
    pub download_chunk_mb: Option<u64>,
    pub rate_limit: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub request_pacing_ms: Option<u64>,
}

impl Settings {
    /// Path of the settings file, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pan-transfer").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads settings from the default location. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Loads settings from `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// How a worker repeats a failed chunk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries until success or cancellation.
    pub max_attempts: Option<u32>,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

/// Explicit knobs passed into the planner and orchestrator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub upload_chunk_size: u64,
    pub download_chunk_size: u64,
    pub max_object_size: u64,
    /// Split uploads above `max_object_size` into several objects instead of failing.
    pub split_oversized: bool,
    /// Batch-wide limit on concurrent network operations.
    pub concurrency: usize,
    /// How many files may run their pipelines at the same time.
    pub concurrent_files: usize,
    pub retry: RetryPolicy,
    /// Pause before every request, plus up to 100 ms of jitter when non-zero.
    pub request_pacing: Duration,
    /// Bytes per second shared by the whole batch.
    pub rate_limit: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upload_chunk_size: UPLOAD_CHUNK_SIZE,
            download_chunk_size: DOWNLOAD_CHUNK_SIZE,
            max_object_size: MAX_OBJECT_SIZE,
            split_oversized: true,
            concurrency: default_concurrency(),
            concurrent_files: 3,
            retry: RetryPolicy::default(),
            request_pacing: Duration::from_secs(1),
            rate_limit: None,
        }
    }
}

impl EngineConfig {
    /// Applies the values present in `settings` on top of the defaults.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut config = Self::default();
        if let Some(n) = settings.concurrency {
            config.concurrency = n.clamp(1, MAX_CONCURRENCY);
        }
        if let Some(n) = settings.concurrent_files {
            config.concurrent_files = n.max(1);
        }
        if let Some(mb) = settings.download_chunk_mb
            && mb > 0
        {
            config.download_chunk_size = mb * 1024 * 1024;
        }
        if settings.rate_limit.is_some_and(|r| r > 0) {
            config.rate_limit = settings.rate_limit;
        }
        if settings.max_retries.is_some() {
            config.retry.max_attempts = settings.max_retries;
        }
        if let Some(ms) = settings.retry_delay_ms {
            config.retry.delay = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.request_pacing_ms {
            config.request_pacing = Duration::from_millis(ms);
        }
        config
    }
}

/// Available parallelism, capped at [`MAX_CONCURRENCY`].
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MAX_CONCURRENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_partial_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "access_token = \"abc\"\nconcurrency = 64\ndownload_chunk_mb = 8\nmax_retries = 3\n",
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.access_token.as_deref(), Some("abc"));

        let config = EngineConfig::from_settings(&settings);
        assert_eq!(config.concurrency, MAX_CONCURRENCY);
        assert_eq!(config.download_chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.retry.max_attempts, Some(3));
        assert_eq!(config.upload_chunk_size, UPLOAD_CHUNK_SIZE);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "concurrency = \"many\"").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }

    #[test]
    fn test_retry_policy_allows() {
        let forever = RetryPolicy::default();
        assert!(forever.allows(1_000_000));

        let bounded = RetryPolicy {
            max_attempts: Some(3),
            delay: Duration::ZERO,
        };
        assert!(bounded.allows(2));
        assert!(!bounded.allows(3));
    }

    #[test]
    fn test_default_concurrency_is_capped() {
        let n = default_concurrency();
        assert!((1..=MAX_CONCURRENCY).contains(&n));
    }
}
