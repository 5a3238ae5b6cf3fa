//! The fan-out cache: one writer, any number of independent readers.
//!
//! The writer side ([`FanoutCache::ingest`]) applies upstream updates to the
//! state table and buffers their net effect until the batching policy cuts a
//! new breadcrumb. The reader side hands out the latest `Full` breadcrumb and
//! lets each reader follow the chain at its own pace.
//!
//! The cache keeps no registry of readers. Publishing a breadcrumb costs the
//! same whether zero or ten thousand sessions are following the chain.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fanout_core::{FanoutError, FanoutResult, Sequence, SyncStatus, Update};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::breadcrumb::Breadcrumb;
use crate::config::CacheConfig;
use crate::state::{ChangeSet, Snapshot, StateTable};
use crate::stats::CacheStats;

/// Why a batch was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    BatchSize,
    BatchDelay,
    StatusChange,
    Explicit,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BatchSize => "batch_size",
            Self::BatchDelay => "batch_delay",
            Self::StatusChange => "status_change",
            Self::Explicit => "explicit",
        })
    }
}

/// State guarded by the cache lock.
#[derive(Debug, Default)]
struct CacheInner {
    table: StateTable,
    /// Net effect of updates ingested since the last breadcrumb.
    pending: ChangeSet,
    /// Raw updates ingested since the last breadcrumb.
    pending_updates: usize,
    /// When the oldest unpublished change arrived.
    pending_since: Option<Instant>,
    /// Latest status reported by the upstream adapter.
    status: SyncStatus,
    tail: Option<Arc<Breadcrumb>>,
    latest_full: Option<Arc<Breadcrumb>>,
    /// Delta breadcrumbs published since `latest_full`.
    since_full: u64,
}

/// Snapshot/delta fan-out cache.
///
/// ## Thread Safety
///
/// A single `parking_lot::Mutex` guards the state table, the pending batch
/// and the chain tail. It is only held for in-memory work and never across
/// an `.await`. Readers that already hold a breadcrumb with a linked
/// successor advance without taking it.
pub struct FanoutCache {
    config: CacheConfig,
    /// Identifies this chain; sequences from another cache are meaningless.
    epoch: u64,
    inner: Mutex<CacheInner>,
    /// Sequence of the tail, 0 before the first publication.
    tail_sequence: AtomicU64,
    /// Wakes readers waiting for the very first breadcrumb.
    first_published: Notify,
    /// Wakes the delayed-flush task when a batch starts.
    batch_started: Notify,
    closed: AtomicBool,
    stats: Arc<CacheStats>,
}

/// Wall-clock nanoseconds at creation, disambiguated within the process.
fn next_epoch() -> u64 {
    static CREATED: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_nanos() as u64);
    let epoch = nanos.wrapping_add(CREATED.fetch_add(1, Ordering::Relaxed) << 32);
    epoch.max(1)
}

impl Default for FanoutCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl fmt::Debug for FanoutCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutCache")
            .field("config", &self.config)
            .field("epoch", &self.epoch)
            .field("latest_sequence", &self.latest_sequence())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FanoutCache {
    /// Create a cache. Zero sizes in `config` are raised to one; use
    /// [`FanoutCache::try_new`] to reject them instead.
    pub fn new(mut config: CacheConfig) -> Self {
        config.max_batch_size = config.max_batch_size.max(1);
        config.full_snapshot_interval = config.full_snapshot_interval.max(1);
        config.max_entry_size = config.max_entry_size.max(1);
        Self {
            config,
            epoch: next_epoch(),
            inner: Mutex::new(CacheInner::default()),
            tail_sequence: AtomicU64::new(0),
            first_published: Notify::new(),
            batch_started: Notify::new(),
            closed: AtomicBool::new(false),
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Create a cache after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Configuration`] if the config is unusable.
    pub fn try_new(config: CacheConfig) -> FanoutResult<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// Get the cache configuration.
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Identity of this cache's breadcrumb chain.
    ///
    /// Sequences restart at one in every cache, so a reader resuming from a
    /// sequence must also present the epoch it got that sequence from.
    /// Never zero.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Get cache statistics.
    #[inline]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Whether [`FanoutCache::close`] has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // === Writer side ===

    /// Apply a batch of upstream updates, optionally with a new sync status.
    ///
    /// The updates are applied to the state table at once and their net
    /// effect is buffered. A breadcrumb is cut when the buffer reaches
    /// `max_batch_size` updates, when the oldest buffered change is older
    /// than `max_batch_delay`, or immediately when the sync status changes.
    ///
    /// Returns the sequence of the breadcrumb published by this call, if any.
    ///
    /// # Errors
    ///
    /// - [`FanoutError::InvalidUpdate`] if any update is malformed or larger
    ///   than `max_entry_size`; nothing from the batch is applied.
    /// - [`FanoutError::Shutdown`] if the cache is closed.
    pub fn ingest(
        &self,
        updates: Vec<Update>,
        status: Option<SyncStatus>,
    ) -> FanoutResult<Option<Sequence>> {
        if self.is_closed() {
            return Err(FanoutError::Shutdown);
        }

        let count = updates.len();
        let mut inner = self.inner.lock();

        let applied = self
            .check_entry_sizes(&updates)
            .and_then(|()| inner.table.apply(updates));
        let changes = match applied {
            Ok(changes) => changes,
            Err(err) => {
                self.stats.record_rejected();
                warn!(error = %err, updates = count, "rejected upstream batch");
                return Err(err);
            }
        };
        self.stats.record_ingest(count as u64);

        if !changes.is_empty() {
            if inner.pending_since.is_none() {
                inner.pending_since = Some(Instant::now());
                self.batch_started.notify_one();
            }
            inner.pending.merge(changes);
        }
        inner.pending_updates += count;

        let status_changed = match status {
            Some(status) if status != inner.status => {
                info!(from = %inner.status, to = %status, "upstream sync status changed");
                inner.status = status;
                true
            }
            _ => false,
        };

        let reason = if status_changed {
            Some(FlushReason::StatusChange)
        } else if inner.pending_updates >= self.config.max_batch_size {
            Some(FlushReason::BatchSize)
        } else if inner
            .pending_since
            .is_some_and(|since| since.elapsed() >= self.config.max_batch_delay)
        {
            Some(FlushReason::BatchDelay)
        } else {
            None
        };

        Ok(reason.and_then(|reason| self.publish_locked(&mut inner, reason)))
    }

    fn check_entry_sizes(&self, updates: &[Update]) -> FanoutResult<()> {
        let limit = self.config.max_entry_size;
        match updates.iter().find(|u| u.size_hint() > limit) {
            Some(update) => Err(FanoutError::invalid_update(
                update.key.as_str(),
                format!("entry of {} bytes exceeds {limit}", update.size_hint()),
            )),
            None => Ok(()),
        }
    }

    /// Publish whatever is buffered, regardless of the batching policy.
    pub fn flush(&self) -> Option<Sequence> {
        let mut inner = self.inner.lock();
        self.publish_locked(&mut inner, FlushReason::Explicit)
    }

    /// Publish the buffered batch if its delay has elapsed.
    pub fn flush_if_due(&self) -> Option<Sequence> {
        let mut inner = self.inner.lock();
        match inner.pending_since {
            Some(since) if since.elapsed() >= self.config.max_batch_delay => {
                self.publish_locked(&mut inner, FlushReason::BatchDelay)
            }
            _ => None,
        }
    }

    /// Publish buffered batches once they reach `max_batch_delay`, even if
    /// no further update arrives to trigger it. Runs until the cache is
    /// closed.
    pub async fn run_flusher(&self) {
        debug!(delay = ?self.config.max_batch_delay, "batch flusher started");
        loop {
            if self.is_closed() {
                break;
            }
            let due_at = self
                .inner
                .lock()
                .pending_since
                .map(|since| since + self.config.max_batch_delay);

            match due_at {
                Some(at) => {
                    tokio::time::sleep_until(at).await;
                    self.flush_if_due();
                }
                None => self.batch_started.notified().await,
            }
        }
        debug!("batch flusher stopped");
    }

    /// Stop accepting updates and wake every waiting reader.
    ///
    /// Already published breadcrumbs stay readable; readers waiting on the
    /// tail return as if their deadline had passed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tail = self.inner.lock().tail.clone();
        if let Some(tail) = tail {
            tail.wake_waiters();
        }
        self.first_published.notify_waiters();
        self.batch_started.notify_one();
        info!(sequence = ?self.latest_sequence(), "fan-out cache closed");
    }

    fn publish_locked(&self, inner: &mut CacheInner, reason: FlushReason) -> Option<Sequence> {
        let pending = std::mem::take(&mut inner.pending);
        let batched = std::mem::take(&mut inner.pending_updates);
        inner.pending_since = None;
        let deltas = pending.into_delta();

        // Before the first publication readers implicitly see `Resyncing`.
        let published_status = inner
            .tail
            .as_ref()
            .map_or(SyncStatus::default(), |tail| tail.sync_status());
        let status_changed = published_status != inner.status;

        if deltas.is_empty() && !status_changed {
            trace!(reason = %reason, batched, "batch had no net effect");
            return None;
        }

        let sequence = inner
            .tail
            .as_ref()
            .map_or(Sequence::FIRST, |tail| tail.sequence().next());
        let full = inner.tail.is_none()
            || status_changed
            || inner.since_full + 1 >= self.config.full_snapshot_interval;
        let snapshot = full.then(|| inner.table.snapshot());
        let delta_count = deltas.len();

        let crumb = Arc::new(Breadcrumb::new(
            sequence,
            inner.status,
            deltas,
            snapshot,
            Arc::clone(&self.stats),
        ));

        let first = match inner.tail.as_ref() {
            Some(tail) => {
                if tail.link(Arc::clone(&crumb)).is_err() {
                    // A second successor would fork the chain and break the
                    // ordering every reader relies on.
                    error!(
                        tail = %tail.sequence(),
                        sequence = %sequence,
                        "breadcrumb already linked; chain invariant violated"
                    );
                    std::process::abort();
                }
                false
            }
            None => true,
        };

        if full {
            inner.latest_full = Some(Arc::clone(&crumb));
            inner.since_full = 0;
        } else {
            inner.since_full += 1;
        }
        inner.tail = Some(crumb);
        self.tail_sequence.store(sequence.get(), Ordering::Release);
        self.stats.record_published(full);

        if first {
            self.first_published.notify_waiters();
        }

        debug!(
            sequence = %sequence,
            kind = if full { "full" } else { "delta" },
            deltas = delta_count,
            batched,
            status = %inner.status,
            reason = %reason,
            "published breadcrumb"
        );
        Some(sequence)
    }

    // === Reader side ===

    /// The latest `Full` breadcrumb: the starting point for a reader with no
    /// prior state. `None` until the first breadcrumb is published. Never
    /// waits for data.
    pub fn current_breadcrumb(&self) -> Option<Arc<Breadcrumb>> {
        self.inner.lock().latest_full.clone()
    }

    /// The most recently published breadcrumb.
    pub fn tail(&self) -> Option<Arc<Breadcrumb>> {
        self.inner.lock().tail.clone()
    }

    /// Sequence of the tail, read without locking.
    #[inline]
    pub fn latest_sequence(&self) -> Option<Sequence> {
        match self.tail_sequence.load(Ordering::Acquire) {
            0 => None,
            seq => Some(Sequence::new(seq)),
        }
    }

    /// How many breadcrumbs `sequence` is behind the tail.
    #[inline]
    pub fn lag(&self, sequence: Sequence) -> u64 {
        self.latest_sequence()
            .map_or(0, |tail| sequence.lag_behind(tail))
    }

    /// Wait until `from` has a successor or `deadline` passes.
    ///
    /// Any number of readers may wait on the same breadcrumb; they are all
    /// woken by one notification when the successor is linked.
    pub async fn next(&self, from: &Breadcrumb, deadline: Instant) -> Option<Arc<Breadcrumb>> {
        from.wait_next(deadline).await
    }

    /// Wait until the first breadcrumb is published or `deadline` passes,
    /// then return [`FanoutCache::current_breadcrumb`].
    pub async fn wait_for_first(&self, deadline: Instant) -> Option<Arc<Breadcrumb>> {
        if let Some(crumb) = self.current_breadcrumb() {
            return Some(crumb);
        }
        let notified = self.first_published.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if let Some(crumb) = self.current_breadcrumb() {
            return Some(crumb);
        }
        let _ = tokio::time::timeout_at(deadline, notified).await;
        self.current_breadcrumb()
    }

    /// Find the breadcrumb with `sequence` for a reader resuming after it.
    ///
    /// Only breadcrumbs from the latest `Full` onwards are reachable; older
    /// ones return `None` and the reader must start from a fresh snapshot.
    pub fn resume_at(&self, sequence: Sequence) -> Option<Arc<Breadcrumb>> {
        let mut crumb = self.current_breadcrumb()?;
        if sequence < crumb.sequence() {
            return None;
        }
        while crumb.sequence() < sequence {
            crumb = crumb.next_now()?;
        }
        Some(crumb)
    }

    // === Diagnostics ===

    /// Snapshot of the state table, including unpublished updates.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().table.snapshot()
    }

    /// Number of keys in the state table.
    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Whether the state table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest sync status reported by the upstream adapter.
    pub fn sync_status(&self) -> SyncStatus {
        self.inner.lock().status
    }
}
