//! Cache configuration.

use std::time::Duration;

use fanout_core::{FanoutError, FanoutResult};

/// Default for [`CacheConfig::max_entry_size`].
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 1024 * 1024;

/// Batching and snapshot policy for a [`FanoutCache`](crate::FanoutCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Publish a breadcrumb once this many updates are buffered.
    pub max_batch_size: usize,
    /// Publish a breadcrumb once the oldest buffered update is this old.
    pub max_batch_delay: Duration,
    /// Cut a `Full` breadcrumb at least every this many breadcrumbs.
    pub full_snapshot_interval: u64,
    /// Largest accepted key plus value, in bytes. Must fit in one frame of
    /// every server the cache feeds.
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_batch_delay: Duration::from_millis(100),
            full_snapshot_interval: 256,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
        }
    }
}

impl CacheConfig {
    /// Set the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the maximum batch delay. Zero publishes on every ingest.
    pub fn with_max_batch_delay(mut self, delay: Duration) -> Self {
        self.max_batch_delay = delay;
        self
    }

    /// Set the full snapshot interval.
    pub fn with_full_snapshot_interval(mut self, interval: u64) -> Self {
        self.full_snapshot_interval = interval;
        self
    }

    /// Set the largest accepted key plus value.
    pub fn with_max_entry_size(mut self, size: usize) -> Self {
        self.max_entry_size = size;
        self
    }

    /// A config that publishes every ingest immediately.
    pub fn unbatched() -> Self {
        Self {
            max_batch_size: 1,
            max_batch_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Check the configuration for unusable values.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Configuration`] if the batch size, the full
    /// snapshot interval or the entry size limit is zero.
    pub fn validate(&self) -> FanoutResult<()> {
        if self.max_batch_size == 0 {
            return Err(FanoutError::Configuration(
                "max_batch_size must be at least 1".into(),
            ));
        }
        if self.full_snapshot_interval == 0 {
            return Err(FanoutError::Configuration(
                "full_snapshot_interval must be at least 1".into(),
            ));
        }
        if self.max_entry_size == 0 {
            return Err(FanoutError::Configuration(
                "max_entry_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
