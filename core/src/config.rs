use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, VmError};

/// Overrides the storage root (default `~/.vmpull`).
pub const HOME_ENV: &str = "VMPULL_HOME";

/// When set to any value, automatic pruning before a pull is disabled.
pub const NO_AUTO_PRUNE_ENV: &str = "VMPULL_NO_AUTO_PRUNE";

/// Default number of parallel blob fetches per pull.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default free space kept on top of a pull's estimated size (100 MiB).
pub const DEFAULT_SAFETY_MARGIN_BYTES: u64 = 100 * 1024 * 1024;

/// Storage layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of all vmpull state
    pub home: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl StorageConfig {
    /// Storage rooted at an explicit directory.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Resolve the storage root using `lookup` for environment variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let home = match lookup(HOME_ENV) {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .map(|h| h.join(".vmpull"))
                .unwrap_or_else(|| PathBuf::from(".vmpull")),
        };
        Self { home }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Digest-keyed blob directory.
    pub fn blobs_dir(&self) -> PathBuf {
        self.home.join("blobs")
    }

    /// In-progress downloads.
    pub fn staging_dir(&self) -> PathBuf {
        self.home.join("staging")
    }

    /// Purely local VMs, one directory per plain name.
    pub fn vms_dir(&self) -> PathBuf {
        self.home.join("vms")
    }

    /// VMs pulled from registries, laid out by remote name.
    pub fn oci_dir(&self) -> PathBuf {
        self.home.join("oci")
    }

    /// Persistent registry credential file.
    pub fn credentials_path(&self) -> PathBuf {
        self.home.join("auth").join("credentials.json")
    }
}

/// Retry and timeout policy for registry requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per request, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff_ms: u64,

    /// Upper bound on a single backoff delay
    pub max_backoff_ms: u64,

    /// Per-attempt HTTP timeout
    pub request_timeout_secs: u64,

    /// Extra fetches of a blob whose bytes failed verification
    pub digest_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            request_timeout_secs: 60,
            digest_retries: 2,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based): doubles each time,
    /// capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Automatic pruning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Reclaim space before pulling
    pub enabled: bool,

    /// Free space to keep on top of the estimated pull size
    pub safety_margin_bytes: u64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safety_margin_bytes: DEFAULT_SAFETY_MARGIN_BYTES,
        }
    }
}

impl PruneConfig {
    /// Default pruning config, disabled when `VMPULL_NO_AUTO_PRUNE` is set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            enabled: lookup(NO_AUTO_PRUNE_ENV).is_none(),
            ..Default::default()
        }
    }
}

/// Options for a single pull
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Parallel blob fetches
    pub concurrency: usize,

    /// Attempt reference-linking (clone/hardlink) when materializing blobs
    pub deduplicate: bool,

    /// Registry retry policy
    pub retry: RetryConfig,

    /// Automatic pruning
    pub prune: PruneConfig,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            deduplicate: false,
            retry: RetryConfig::default(),
            prune: PruneConfig::default(),
        }
    }
}

impl PullConfig {
    /// Reject options that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            return Err(VmError::ValidationError(
                "network concurrency cannot be less than 1".to_string(),
            ));
        }
        if self.retry.max_attempts < 1 {
            return Err(VmError::ValidationError(
                "retry attempts cannot be less than 1".to_string(),
            ));
        }
        Ok(())
    }
}
