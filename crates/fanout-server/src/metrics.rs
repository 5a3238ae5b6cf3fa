//! Metrics for the fan-out server.
//!
//! Everything is published through the `metrics` facade; installing an
//! exporter is left to the embedding process.
//!
//! - cache: current sequence, sync status, live breadcrumbs
//! - sessions: opened/closed by close reason, duration, lag at each send
//! - traffic: breadcrumbs, frames and bytes sent by kind
//! - connections: active count and rejections
//!
//! # Example
//!
//! ```rust,ignore
//! use fanout_server::metrics::FanoutMetrics;
//!
//! let metrics = FanoutMetrics::new();
//! metrics.record_cache(&cache);
//! metrics.record_sent("delta", 1, 512);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fanout_cache::FanoutCache;
use fanout_core::CloseReason;
use metrics::{counter, gauge, histogram};

/// Metrics for the fan-out server.
///
/// Cloning is cheap; clones share the same gauges.
#[derive(Debug, Clone)]
pub struct FanoutMetrics {
    inner: Arc<FanoutMetricsInner>,
}

#[derive(Debug)]
struct FanoutMetricsInner {
    active_sessions: AtomicU64,
    active_connections: AtomicU64,
}

impl Default for FanoutMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FanoutMetricsInner {
                active_sessions: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
            }),
        }
    }

    /// Publish the cache-level gauges: current sequence, sync status and
    /// breadcrumbs still in memory.
    pub fn record_cache(&self, cache: &FanoutCache) {
        let sequence = cache.latest_sequence().map_or(0, |s| s.get());
        gauge!("fanout_cache_sequence").set(sequence as f64);
        gauge!("fanout_cache_in_sync").set(if cache.sync_status().is_in_sync() {
            1.0
        } else {
            0.0
        });

        let stats = cache.stats();
        gauge!("fanout_cache_live_breadcrumbs").set(stats.live_breadcrumbs() as f64);
        gauge!("fanout_cache_keys").set(cache.len() as f64);
    }

    /// Record a session opened.
    pub fn session_opened(&self) {
        let count = self.inner.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("fanout_sessions_opened_total").increment(1);
        gauge!("fanout_active_sessions").set(count as f64);
    }

    /// Record a session closed.
    pub fn session_closed(&self, reason: CloseReason, duration: Duration) {
        let count = self
            .inner
            .active_sessions
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        counter!("fanout_sessions_closed_total", "reason" => reason.as_str()).increment(1);
        gauge!("fanout_active_sessions").set(count as f64);
        histogram!("fanout_session_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record how far behind the tail a session was when it sent a
    /// breadcrumb.
    pub fn record_lag(&self, lag: u64) {
        histogram!("fanout_session_lag_breadcrumbs").record(lag as f64);
    }

    /// Record one breadcrumb written to a session.
    pub fn record_sent(&self, kind: &'static str, frames: usize, bytes: usize) {
        counter!("fanout_breadcrumbs_sent_total", "kind" => kind).increment(1);
        counter!("fanout_frames_sent_total", "kind" => kind).increment(frames as u64);
        counter!("fanout_bytes_sent_total", "kind" => kind).increment(bytes as u64);
    }

    /// Record a connection opened.
    pub fn connection_opened(&self) {
        let count = self.inner.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("fanout_connections_opened_total").increment(1);
        gauge!("fanout_active_connections").set(count as f64);
    }

    /// Record a connection closed.
    pub fn connection_closed(&self) {
        let count = self
            .inner
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        counter!("fanout_connections_closed_total").increment(1);
        gauge!("fanout_active_connections").set(count as f64);
    }

    /// Record a connection refused by the connection limits.
    pub fn connection_rejected(&self) {
        counter!("fanout_connections_rejected_total").increment(1);
    }

    /// Get the current number of active sessions.
    pub fn active_sessions(&self) -> u64 {
        self.inner.active_sessions.load(Ordering::Relaxed)
    }

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> u64 {
        self.inner.active_connections.load(Ordering::Relaxed)
    }
}

/// Session lifetime tracker.
///
/// Records the session as opened on creation and closed, with its duration
/// and close reason, when [`SessionTracker::finish`] is called or, failing
/// that, on drop.
#[derive(Debug)]
pub struct SessionTracker {
    start: Instant,
    metrics: FanoutMetrics,
    reason: Option<CloseReason>,
}

impl SessionTracker {
    /// Start tracking a session.
    pub fn new(metrics: FanoutMetrics) -> Self {
        metrics.session_opened();
        Self {
            start: Instant::now(),
            metrics,
            reason: None,
        }
    }

    /// Set the reason the session ended.
    pub fn finish(mut self, reason: CloseReason) {
        self.reason = Some(reason);
    }
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        let reason = self.reason.unwrap_or(CloseReason::Internal);
        self.metrics.session_closed(reason, self.start.elapsed());
    }
}
