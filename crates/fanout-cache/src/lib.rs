//! # fanout-cache
//!
//! Snapshot/delta fan-out cache for a single upstream source.
//!
//! This crate provides the caching layer between one upstream watch and any
//! number of downstream sessions:
//!
//! - [`StateTable`] - Current value of every key, with copy-on-write [`Snapshot`]s
//! - [`Breadcrumb`] - Immutable, append-only chain of published state versions
//! - [`FanoutCache`] - Writer-side ingestion with batching, reader-side
//!   "current / wait for next"
//! - [`CacheStats`] - Lock-free counters, including live breadcrumbs
//!
//! ## Key Design Decisions
//!
//! - One `parking_lot::Mutex` guards the state table and the chain tail; it
//!   is never held across an `.await`
//! - A breadcrumb's `next` link is set exactly once; readers that already
//!   have a successor follow it without touching the cache lock
//! - Waiting readers park on the breadcrumb they hold, so publication wakes
//!   them with a single notification regardless of their number
//! - Breadcrumbs are reference counted; the chain prefix no session holds is
//!   freed as soon as the last cursor moves past it
//!
//! ## Example
//!
//! ```rust
//! use fanout_cache::{CacheConfig, FanoutCache};
//! use fanout_core::{SyncStatus, Update};
//!
//! let cache = FanoutCache::new(CacheConfig::default());
//! cache.ingest(vec![Update::upsert("/k1", "v1")], Some(SyncStatus::InSync))?;
//!
//! let full = cache.current_breadcrumb().expect("published");
//! assert!(full.is_full());
//! # Ok::<(), fanout_core::FanoutError>(())
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod breadcrumb;
mod cache;
mod config;
mod state;
mod stats;

pub use breadcrumb::{Breadcrumb, BreadcrumbKind};
pub use cache::FanoutCache;
pub use config::{CacheConfig, DEFAULT_MAX_ENTRY_SIZE};
pub use state::{Change, ChangeSet, Snapshot, StateTable};
pub use stats::CacheStats;
