//! # nebucloud-fanout
//!
//! Fan-out caching proxy: one upstream watch, thousands of downstream
//! subscribers.
//!
//! The proxy keeps a single copy of the upstream key space and publishes
//! every change as an immutable breadcrumb. Each downstream session gets one
//! snapshot and then walks the breadcrumb chain, forwarding deltas at its own
//! pace, so upstream load and memory stay independent of the number of
//! subscribers.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nebucloud_fanout::prelude::*;
//! use std::sync::Arc;
//!
//! let cache = Arc::new(FanoutCache::new(CacheConfig::default()));
//! cache.ingest(vec![Update::upsert("/calico/v1/host/node-1", "10.0.0.1")], None)?;
//!
//! let server = FanoutServer::builder()
//!     .cache(Arc::clone(&cache))
//!     .build()?;
//! server.serve().await?;
//! ```
//!
//! ## Architecture
//!
//! - `fanout-core` - Keys, updates, sync status, sequences and errors
//! - `fanout-cache` - State table, breadcrumb chain and fan-out cache
//! - `fanout-server` - Wire protocol, client sessions, listener and client
//!
//! This crate re-exports them and adds the upstream adapter seam
//! ([`upstream`]) used by the `nebucloud-fanout` binary.
//!
//! ## Design Principles
//!
//! 1. **No panics in library code** - Errors are returned as `Result`; only
//!    a corrupted breadcrumb chain aborts the process
//! 2. **No locks held across await points**
//! 3. **Readers never block the writer** - A slow session falls behind and is
//!    disconnected; it never delays publication
//! 4. **Observable** - `tracing` everywhere, metrics via the `metrics` facade

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod upstream;

pub use fanout_cache as cache;
pub use fanout_core as core;
pub use fanout_server as server;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use nebucloud_fanout::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use fanout_core::{
        CloseReason, FanoutError, FanoutResult, Key, Sequence, SyncStatus, Update,
    };

    // Cache types
    pub use fanout_cache::{Breadcrumb, BreadcrumbKind, CacheConfig, CacheStats, FanoutCache, Snapshot};

    // Server types
    pub use fanout_server::{
        ClientEvent, FanoutServer, FanoutServerBuilder, ServerConfig, SessionConfig, SyncClient,
        SyncClientConfig,
    };

    // Upstream adapters
    pub use crate::upstream::{JsonLinesSource, UpstreamBatch, UpstreamSource};
}

/// Version information for this crate.
pub mod version {
    /// Crate version.
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Minimum supported Rust version.
    pub const MSRV: &str = "1.75";

    /// Get version info as a string.
    pub fn version_string() -> String {
        format!(
            "nebucloud-fanout {} (protocol v{}, MSRV {})",
            VERSION,
            fanout_server::protocol::PROTOCOL_VERSION,
            MSRV
        )
    }
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;

    #[test]
    fn prelude_imports_work() {
        let cache = FanoutCache::new(CacheConfig::unbatched());
        cache
            .ingest(vec![Update::upsert("/a", "1")], Some(SyncStatus::InSync))
            .unwrap();

        let crumb = cache.current_breadcrumb().unwrap();
        assert_eq!(crumb.sequence(), Sequence::FIRST);
        assert_eq!(crumb.kind(), BreadcrumbKind::Full);
    }

    #[test]
    fn server_builder_works() {
        let cache = Arc::new(FanoutCache::default());
        let result = FanoutServer::builder().cache(cache).build();
        assert!(result.is_ok());
    }

    #[test]
    fn version_info() {
        let version = super::version::version_string();
        assert!(version.contains("nebucloud-fanout"));
        assert!(version.contains("protocol v2"));
    }
}
