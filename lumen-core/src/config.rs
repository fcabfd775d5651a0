//! Configuration loaded from environment variables with sensible defaults.
//!
//! [`LumenConfig::default`] is tuned for tests (short timeouts are still
//! long enough for local fakes); [`LumenConfig::from_env`] is what the CLI uses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::analyzer::AnalyzerConfig;
use crate::cache::{CacheIndexConfig, DEFAULT_LIST_TIMEOUT, DEFAULT_PROBE_TIMEOUT};
use crate::error::{LumenError, Result};
use crate::lock::{AdvisoryLock, NoopLock, DEFAULT_LOCK_TTL};
use crate::store::{FsObjectStore, HttpObjectStore, HttpObjectStoreConfig, ObjectStore};
use crate::transport::{ResilientTransport, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};

/// Default bound on the source download.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ceiling on inference, also the ceiling on coalescing waits.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between coalescing polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Request-level deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on each source download attempt
    pub fetch: Duration,
    /// Bound on inference and on waiting for another holder
    pub generation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fetch: DEFAULT_FETCH_TIMEOUT,
            generation: DEFAULT_GENERATION_TIMEOUT,
        }
    }
}

impl Timeouts {
    /// Apply per-request overrides on top of these defaults.
    pub fn with_overrides(self, overrides: &TimeoutOverrides) -> Self {
        Self {
            fetch: overrides.fetch.unwrap_or(self.fetch),
            generation: overrides.generation.unwrap_or(self.generation),
        }
    }
}

/// Per-request deadline overrides. `None` keeps the analyzer default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutOverrides {
    pub fetch: Option<Duration>,
    pub generation: Option<Duration>,
}

/// Top-level configuration
#[derive(Clone)]
pub struct LumenConfig {
    /// Directory for per-request scratch files (default: `$TMPDIR/lumen`)
    pub scratch_dir: PathBuf,
    /// REST blob service base URL; selects the HTTP object store when set
    pub blob_url: Option<String>,
    /// Bearer token for the blob service
    pub blob_token: Option<String>,
    /// Local object store directory, used when no blob URL is set
    pub store_dir: PathBuf,
    /// Redis URL for the coordination lock; no cross-process lock when unset
    pub redis_url: Option<String>,
    pub timeouts: Timeouts,
    /// Retries after the first source download attempt (default: 3)
    pub fetch_retries: u32,
    /// Base backoff delay (default: 500ms)
    pub retry_delay: Duration,
    /// Cache fast-path probe bound (default: 2s)
    pub probe_timeout: Duration,
    /// Cache listing bound (default: 10s)
    pub list_timeout: Duration,
    /// Lock record lifetime (default: 120s)
    pub lock_ttl: Duration,
    /// Coalescing poll interval (default: 1s)
    pub poll_interval: Duration,
    /// Keep timestamped history entries next to `latest.json` (default: false)
    pub keep_history: bool,
}

impl std::fmt::Debug for LumenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LumenConfig")
            .field("scratch_dir", &self.scratch_dir)
            .field("blob_url", &self.blob_url)
            .field("blob_token", &self.blob_token.as_ref().map(|_| "[REDACTED]"))
            .field("store_dir", &self.store_dir)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("timeouts", &self.timeouts)
            .field("fetch_retries", &self.fetch_retries)
            .field("retry_delay", &self.retry_delay)
            .field("probe_timeout", &self.probe_timeout)
            .field("list_timeout", &self.list_timeout)
            .field("lock_ttl", &self.lock_ttl)
            .field("poll_interval", &self.poll_interval)
            .field("keep_history", &self.keep_history)
            .finish()
    }
}

impl Default for LumenConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            scratch_dir: tmp.join("lumen").join("scratch"),
            blob_url: None,
            blob_token: None,
            store_dir: tmp.join("lumen").join("store"),
            redis_url: None,
            timeouts: Timeouts::default(),
            fetch_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            list_timeout: DEFAULT_LIST_TIMEOUT,
            lock_ttl: DEFAULT_LOCK_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            keep_history: false,
        }
    }
}

impl LumenConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str| non_empty(key).and_then(|v| v.parse::<u64>().ok());

        let secs = |key: &str, default: Duration| number(key).map(Duration::from_secs).unwrap_or(default);
        let millis = |key: &str, default: Duration| number(key).map(Duration::from_millis).unwrap_or(default);

        Self {
            scratch_dir: non_empty("LUMEN_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            blob_url: non_empty("LUMEN_BLOB_URL"),
            blob_token: non_empty("LUMEN_BLOB_TOKEN"),
            store_dir: non_empty("LUMEN_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_dir),
            redis_url: non_empty("LUMEN_REDIS_URL"),
            timeouts: Timeouts {
                fetch: secs("LUMEN_FETCH_TIMEOUT_SECS", defaults.timeouts.fetch),
                generation: secs("LUMEN_GENERATION_TIMEOUT_SECS", defaults.timeouts.generation),
            },
            fetch_retries: number("LUMEN_FETCH_RETRIES")
                .map(|n| n.min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.fetch_retries),
            retry_delay: millis("LUMEN_RETRY_DELAY_MS", defaults.retry_delay),
            probe_timeout: millis("LUMEN_PROBE_TIMEOUT_MS", defaults.probe_timeout),
            list_timeout: millis("LUMEN_LIST_TIMEOUT_MS", defaults.list_timeout),
            lock_ttl: secs("LUMEN_LOCK_TTL_SECS", defaults.lock_ttl),
            poll_interval: millis("LUMEN_POLL_INTERVAL_MS", defaults.poll_interval),
            keep_history: non_empty("LUMEN_KEEP_HISTORY")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.keep_history),
        }
    }

    pub fn cache_config(&self) -> CacheIndexConfig {
        CacheIndexConfig {
            probe_timeout: self.probe_timeout,
            list_timeout: self.list_timeout,
            keep_history: self.keep_history,
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            scratch_dir: self.scratch_dir.clone(),
            timeouts: self.timeouts,
            fetch_retries: self.fetch_retries,
            retry_delay: self.retry_delay,
            lock_ttl: self.lock_ttl,
            poll_interval: self.poll_interval,
        }
    }

    /// Object store selected by this configuration.
    ///
    /// The HTTP store when `LUMEN_BLOB_URL` is set, the local directory otherwise.
    pub fn build_store(&self, transport: &ResilientTransport) -> Arc<dyn ObjectStore> {
        match &self.blob_url {
            Some(url) => {
                let mut config = HttpObjectStoreConfig::new(url.as_str());
                config.token = self.blob_token.clone();
                info!(base_url = %config.base_url, "Using HTTP object store");
                Arc::new(HttpObjectStore::new(transport.clone(), config))
            }
            None => {
                info!(root = %self.store_dir.display(), "Using local object store");
                Arc::new(FsObjectStore::new(self.store_dir.clone()))
            }
        }
    }

    /// Coordination lock selected by this configuration.
    pub fn build_lock(&self) -> Result<Arc<dyn AdvisoryLock>> {
        match &self.redis_url {
            #[cfg(feature = "redis")]
            Some(url) => {
                let lock = crate::lock::RedisLock::new(url, crate::lock::REDIS_OP_TIMEOUT)
                    .map_err(|e| LumenError::Config(format!("Invalid LUMEN_REDIS_URL: {e}")))?;
                info!("Using Redis coordination lock");
                Ok(Arc::new(lock))
            }
            #[cfg(not(feature = "redis"))]
            Some(_) => Err(LumenError::Config(
                "LUMEN_REDIS_URL is set but lumen-core was built without the `redis` feature".into(),
            )),
            None => {
                info!("No coordination backend configured, cross-process coalescing disabled");
                Ok(Arc::new(NoopLock))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = LumenConfig::from_lookup(|_| None);
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(config.fetch_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert_eq!(config.probe_timeout, Duration::from_secs(2));
        assert_eq!(config.list_timeout, Duration::from_secs(10));
        assert_eq!(config.lock_ttl, Duration::from_secs(120));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.blob_url.is_none());
        assert!(!config.keep_history);
    }

    #[test]
    fn test_reads_overrides() {
        let config = LumenConfig::from_lookup(lookup(&[
            ("LUMEN_SCRATCH_DIR", "/var/tmp/lumen"),
            ("LUMEN_BLOB_URL", "https://blob.example.com"),
            ("LUMEN_FETCH_TIMEOUT_SECS", "5"),
            ("LUMEN_GENERATION_TIMEOUT_SECS", "60"),
            ("LUMEN_FETCH_RETRIES", "1"),
            ("LUMEN_POLL_INTERVAL_MS", "250"),
            ("LUMEN_KEEP_HISTORY", "TRUE"),
        ]));
        assert_eq!(config.scratch_dir, PathBuf::from("/var/tmp/lumen"));
        assert_eq!(config.blob_url.as_deref(), Some("https://blob.example.com"));
        assert_eq!(config.timeouts.fetch, Duration::from_secs(5));
        assert_eq!(config.timeouts.generation, Duration::from_secs(60));
        assert_eq!(config.fetch_retries, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(config.keep_history);
    }

    #[test]
    fn test_garbage_and_blank_values_fall_back() {
        let config = LumenConfig::from_lookup(lookup(&[
            ("LUMEN_FETCH_RETRIES", "many"),
            ("LUMEN_BLOB_URL", "   "),
        ]));
        assert_eq!(config.fetch_retries, 3);
        assert!(config.blob_url.is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = LumenConfig::from_lookup(lookup(&[
            ("LUMEN_BLOB_TOKEN", "tok-secret"),
            ("LUMEN_REDIS_URL", "redis://:hunter2@cache:6379"),
        ]));
        let debug = format!("{config:?}");
        assert!(!debug.contains("tok-secret"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_timeout_overrides() {
        let base = Timeouts::default();
        let applied = base.with_overrides(&TimeoutOverrides {
            fetch: None,
            generation: Some(Duration::from_secs(9)),
        });
        assert_eq!(applied.fetch, base.fetch);
        assert_eq!(applied.generation, Duration::from_secs(9));
    }

    #[test]
    fn test_without_redis_uses_noop_lock() {
        let lock = LumenConfig::default().build_lock().unwrap();
        assert_eq!(lock.backend_name(), "noop");
    }
}
