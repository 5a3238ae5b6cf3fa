//! Cache statistics and metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for cache operations.
///
/// All counters are atomic and can be safely accessed from multiple threads.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of individual updates ingested.
    updates_ingested: AtomicU64,
    /// Number of ingest calls accepted.
    batches_ingested: AtomicU64,
    /// Number of ingest calls rejected as malformed.
    batches_rejected: AtomicU64,
    /// Number of `Full` breadcrumbs published.
    full_published: AtomicU64,
    /// Number of `Delta` breadcrumbs published.
    deltas_published: AtomicU64,
    /// Breadcrumbs constructed and not yet dropped.
    live_breadcrumbs: AtomicU64,
}

impl CacheStats {
    /// Create new cache statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted ingest call of `updates` updates.
    #[inline]
    pub fn record_ingest(&self, updates: u64) {
        self.batches_ingested.fetch_add(1, Ordering::Relaxed);
        self.updates_ingested.fetch_add(updates, Ordering::Relaxed);
    }

    /// Record a rejected ingest call.
    #[inline]
    pub fn record_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a published breadcrumb.
    #[inline]
    pub fn record_published(&self, full: bool) {
        if full {
            self.full_published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.deltas_published.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_breadcrumb_created(&self) {
        self.live_breadcrumbs.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn record_breadcrumb_dropped(&self) {
        self.live_breadcrumbs.fetch_sub(1, Ordering::AcqRel);
    }

    /// Get total updates ingested.
    #[inline]
    pub fn updates_ingested(&self) -> u64 {
        self.updates_ingested.load(Ordering::Relaxed)
    }

    /// Get total accepted ingest calls.
    #[inline]
    pub fn batches_ingested(&self) -> u64 {
        self.batches_ingested.load(Ordering::Relaxed)
    }

    /// Get total rejected ingest calls.
    #[inline]
    pub fn batches_rejected(&self) -> u64 {
        self.batches_rejected.load(Ordering::Relaxed)
    }

    /// Get total `Full` breadcrumbs published.
    #[inline]
    pub fn full_published(&self) -> u64 {
        self.full_published.load(Ordering::Relaxed)
    }

    /// Get total `Delta` breadcrumbs published.
    #[inline]
    pub fn deltas_published(&self) -> u64 {
        self.deltas_published.load(Ordering::Relaxed)
    }

    /// Get total breadcrumbs published.
    #[inline]
    pub fn breadcrumbs_published(&self) -> u64 {
        self.full_published() + self.deltas_published()
    }

    /// Breadcrumbs still in memory. Drops as soon as the chain prefix that
    /// no cursor references is released.
    #[inline]
    pub fn live_breadcrumbs(&self) -> u64 {
        self.live_breadcrumbs.load(Ordering::Acquire)
    }

    /// Average number of updates folded into each published breadcrumb.
    pub fn batching_ratio(&self) -> f64 {
        let published = self.breadcrumbs_published() as f64;
        if published == 0.0 {
            0.0
        } else {
            self.updates_ingested() as f64 / published
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_stats_basic() {
        let stats = CacheStats::new();

        stats.record_ingest(10);
        stats.record_ingest(20);
        stats.record_rejected();
        stats.record_published(true);
        stats.record_published(false);
        stats.record_published(false);

        assert_eq!(stats.updates_ingested(), 30);
        assert_eq!(stats.batches_ingested(), 2);
        assert_eq!(stats.batches_rejected(), 1);
        assert_eq!(stats.full_published(), 1);
        assert_eq!(stats.deltas_published(), 2);
        assert!((stats.batching_ratio() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn live_breadcrumb_counter() {
        let stats = CacheStats::new();
        stats.record_breadcrumb_created();
        stats.record_breadcrumb_created();
        stats.record_breadcrumb_dropped();
        assert_eq!(stats.live_breadcrumbs(), 1);
    }
}
