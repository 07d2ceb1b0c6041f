//! Configuration for the property cache

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Configuration for the property cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Soft budget for memory held by stored values
    pub in_memory_size_bytes: u64,

    /// Soft budget for persisted values; `None` disables the limit
    pub on_disk_size_limit_bytes: Option<u64>,

    /// Maximum number of non-critical rows kept; negative disables trimming
    pub row_limit: i64,

    /// Delay before the backend is opened during initialization
    pub init_delay: Duration,

    /// Enable the background eviction task
    pub enable_auto_cleanup: bool,

    /// Interval between background eviction passes
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // 256 MB default
            in_memory_size_bytes: 256 * 1024 * 1024,
            on_disk_size_limit_bytes: None,
            row_limit: -1,
            init_delay: Duration::ZERO,
            enable_auto_cleanup: true,
            // Cleanup every minute
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.in_memory_size_bytes == 0 {
            return Err("in_memory_size_bytes must be greater than 0".to_string());
        }

        if self.enable_auto_cleanup && self.cleanup_interval.is_zero() {
            return Err("cleanup_interval must be non-zero when auto cleanup is enabled".to_string());
        }

        Ok(())
    }

    /// Row limit, if trimming is enabled
    pub fn row_limit(&self) -> Option<usize> {
        usize::try_from(self.row_limit).ok()
    }

    /// Read configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first. Recognized
    /// variables (all optional): `PROPERTY_CACHE_MEMORY_BYTES`,
    /// `PROPERTY_CACHE_DISK_BYTES`, `PROPERTY_CACHE_ROW_LIMIT`,
    /// `PROPERTY_CACHE_INIT_DELAY_MS`, `PROPERTY_CACHE_CLEANUP_INTERVAL_MS`.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| -> Option<i64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<i64>() {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Ignoring {}={:?}: {}", key, raw, e);
                    None
                }
            }
        };

        let mut builder = Self::builder();
        if let Some(bytes) = parse("PROPERTY_CACHE_MEMORY_BYTES").filter(|b| *b > 0) {
            builder = builder.in_memory_size_bytes(bytes as u64);
        }
        if let Some(bytes) = parse("PROPERTY_CACHE_DISK_BYTES") {
            builder = builder.on_disk_size_limit_bytes(u64::try_from(bytes).ok());
        }
        if let Some(limit) = parse("PROPERTY_CACHE_ROW_LIMIT") {
            builder = builder.row_limit(limit);
        }
        if let Some(ms) = parse("PROPERTY_CACHE_INIT_DELAY_MS") {
            builder = builder.init_delay(Duration::from_millis(ms.max(0) as u64));
        }
        if let Some(ms) = parse("PROPERTY_CACHE_CLEANUP_INTERVAL_MS").filter(|ms| *ms > 0) {
            builder = builder.cleanup_interval(Duration::from_millis(ms as u64));
        }
        builder.build()
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    in_memory_size_bytes: Option<u64>,
    on_disk_size_limit_bytes: Option<Option<u64>>,
    row_limit: Option<i64>,
    init_delay: Option<Duration>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Set the in-memory size budget
    pub fn in_memory_size_bytes(mut self, size: u64) -> Self {
        self.in_memory_size_bytes = Some(size);
        self
    }

    /// Set (or with `None`, disable) the on-disk size budget
    pub fn on_disk_size_limit_bytes(mut self, size: Option<u64>) -> Self {
        self.on_disk_size_limit_bytes = Some(size);
        self
    }

    /// Set the non-critical row limit (negative disables)
    pub fn row_limit(mut self, limit: i64) -> Self {
        self.row_limit = Some(limit);
        self
    }

    /// Set the initialization delay
    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    /// Enable or disable the background eviction task
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            in_memory_size_bytes: self
                .in_memory_size_bytes
                .unwrap_or(defaults.in_memory_size_bytes),
            on_disk_size_limit_bytes: self
                .on_disk_size_limit_bytes
                .unwrap_or(defaults.on_disk_size_limit_bytes),
            row_limit: self.row_limit.unwrap_or(defaults.row_limit),
            init_delay: self.init_delay.unwrap_or(defaults.init_delay),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        }
    }
}

/// Preset configurations
impl CacheConfig {
    /// Configuration for memory-constrained environments
    pub fn small() -> Self {
        Self {
            in_memory_size_bytes: 16 * 1024 * 1024, // 16 MB
            row_limit: 100_000,
            cleanup_interval: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Configuration for large ingests
    pub fn large() -> Self {
        Self {
            in_memory_size_bytes: 4 * 1024 * 1024 * 1024, // 4 GB
            on_disk_size_limit_bytes: Some(64 * 1024 * 1024 * 1024), // 64 GB
            cleanup_interval: Duration::from_secs(300),
            ..Default::default()
        }
    }
}
