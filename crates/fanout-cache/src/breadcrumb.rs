//! Breadcrumbs: the immutable, singly-linked chain of published versions.
//!
//! Every breadcrumb carries the delta since its predecessor. `Full`
//! breadcrumbs additionally carry a snapshot of the complete state table, so a
//! reader with no prior state can start from them.
//!
//! The only field that changes after construction is `next`, which goes from
//! unset to set exactly once when the successor is published. `OnceLock`
//! publishes it with release/acquire ordering, so a reader that observes
//! `next` also observes the fully constructed successor.

use std::fmt;
use std::sync::{Arc, OnceLock};

use fanout_core::{Sequence, SyncStatus, Update};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::state::Snapshot;
use crate::stats::CacheStats;

/// Whether a breadcrumb can be used as a starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreadcrumbKind {
    /// Carries a complete copy of the state table (and the delta).
    Full,
    /// Carries only the entries changed since the previous breadcrumb.
    Delta,
}

impl BreadcrumbKind {
    /// Static label for logs and metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Delta => "delta",
        }
    }
}

/// One published version of the cache.
pub struct Breadcrumb {
    sequence: Sequence,
    timestamp: Instant,
    sync_status: SyncStatus,
    deltas: Vec<Update>,
    snapshot: Option<Snapshot>,
    next: OnceLock<Arc<Breadcrumb>>,
    /// Readers caught up to this breadcrumb park here until `next` is set.
    published: Notify,
    stats: Arc<CacheStats>,
}

impl Breadcrumb {
    pub(crate) fn new(
        sequence: Sequence,
        sync_status: SyncStatus,
        deltas: Vec<Update>,
        snapshot: Option<Snapshot>,
        stats: Arc<CacheStats>,
    ) -> Self {
        stats.record_breadcrumb_created();
        Self {
            sequence,
            timestamp: Instant::now(),
            sync_status,
            deltas,
            snapshot,
            next: OnceLock::new(),
            published: Notify::new(),
            stats,
        }
    }

    /// Sequence number of this breadcrumb.
    #[inline]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Full or Delta.
    #[inline]
    pub fn kind(&self) -> BreadcrumbKind {
        if self.snapshot.is_some() {
            BreadcrumbKind::Full
        } else {
            BreadcrumbKind::Delta
        }
    }

    /// Whether this breadcrumb carries a complete snapshot.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Creation time. Diagnostic only, never used for ordering.
    #[inline]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Upstream sync status at creation.
    #[inline]
    pub fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    /// Entries changed since the previous breadcrumb, in key order.
    #[inline]
    pub fn deltas(&self) -> &[Update] {
        &self.deltas
    }

    /// Complete state at this breadcrumb, for `Full` breadcrumbs.
    #[inline]
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// The successor, if it has been published. Never blocks.
    #[inline]
    pub fn next_now(&self) -> Option<Arc<Breadcrumb>> {
        self.next.get().cloned()
    }

    /// Wait for the successor until `deadline`.
    ///
    /// Returns immediately, without any locking, if the successor is already
    /// linked. Returns `None` if the deadline passes first; that is a normal
    /// outcome that lets the caller send keepalives and wait again.
    pub async fn wait_next(&self, deadline: Instant) -> Option<Arc<Breadcrumb>> {
        if let Some(next) = self.next.get() {
            return Some(Arc::clone(next));
        }

        let notified = self.published.notified();
        tokio::pin!(notified);
        // Register before re-checking so a publish between the check and the
        // await is not missed.
        notified.as_mut().enable();
        if let Some(next) = self.next.get() {
            return Some(Arc::clone(next));
        }

        let _ = tokio::time::timeout_at(deadline, notified).await;
        self.next_now()
    }

    /// Link `next` as the successor and wake every waiting reader.
    ///
    /// Fails, returning `next`, if a successor was already linked.
    pub(crate) fn link(&self, next: Arc<Breadcrumb>) -> Result<(), Arc<Breadcrumb>> {
        self.next.set(next)?;
        self.published.notify_waiters();
        Ok(())
    }

    /// Wake waiting readers without linking a successor. Used on close.
    pub(crate) fn wake_waiters(&self) {
        self.published.notify_waiters();
    }
}

impl fmt::Debug for Breadcrumb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breadcrumb")
            .field("sequence", &self.sequence)
            .field("kind", &self.kind())
            .field("sync_status", &self.sync_status)
            .field("deltas", &self.deltas.len())
            .field("snapshot", &self.snapshot.as_ref().map(Snapshot::len))
            .field("linked", &self.next.get().is_some())
            .finish()
    }
}

impl Drop for Breadcrumb {
    fn drop(&mut self) {
        self.stats.record_breadcrumb_dropped();

        // Unlink the unreferenced suffix iteratively; letting `Arc` drop it
        // recursively overflows the stack on long chains.
        let mut next = self.next.take();
        while let Some(crumb) = next {
            match Arc::try_unwrap(crumb) {
                Ok(mut owned) => next = owned.next.take(),
                Err(_) => break,
            }
        }
    }
}
