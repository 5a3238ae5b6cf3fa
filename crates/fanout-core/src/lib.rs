//! # fanout-core
//!
//! Core types and error handling shared by the fan-out cache crates.
//!
//! This crate provides the foundational types used across the workspace:
//!
//! - [`FanoutError`] - Error taxonomy for ingestion, sessions and transport
//! - [`Key`] and [`Update`] - Opaque keys and value-or-tombstone updates
//! - [`SyncStatus`] - Upstream connection health attached to every breadcrumb
//! - [`Sequence`] - Monotonic breadcrumb sequence numbers
//!
//! ## Example
//!
//! ```rust
//! use fanout_core::{Key, Sequence, SyncStatus, Update};
//!
//! let upsert = Update::upsert("/calico/v1/host/node-1", "10.0.0.1");
//! let delete = Update::delete("/calico/v1/host/node-2");
//!
//! assert!(!upsert.is_tombstone());
//! assert!(delete.is_tombstone());
//! assert_eq!(Sequence::FIRST.next(), Sequence::new(2));
//! assert!(!SyncStatus::Resyncing.is_in_sync());
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod key;
mod sequence;
mod status;

pub use error::{CloseReason, FanoutError};
pub use key::{Key, Update};
pub use sequence::Sequence;
pub use status::SyncStatus;

/// Result type alias using [`FanoutError`].
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Alias for Result, mirroring the naming used across the workspace.
pub type FanoutResult<T> = Result<T>;
