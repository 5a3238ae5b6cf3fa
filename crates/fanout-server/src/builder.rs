//! Server builder for configuring and creating the fan-out server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fanout_cache::FanoutCache;
use fanout_core::{FanoutError, FanoutResult};

use crate::config::{ServerConfig, SessionConfig};
use crate::connections::{ConnectionLimits, ConnectionTracker};
use crate::metrics::FanoutMetrics;
use crate::protocol;
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownController;
use crate::FanoutServer;

/// Builder for creating a [`FanoutServer`].
///
/// # Example
///
/// ```rust,ignore
/// use fanout_server::FanoutServerBuilder;
/// use fanout_cache::FanoutCache;
/// use std::sync::Arc;
///
/// let cache = Arc::new(FanoutCache::default());
/// let server = FanoutServerBuilder::new()
///     .cache(cache)
///     .listen_addr("127.0.0.1:5473".parse()?)
///     .max_lag(500)
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct FanoutServerBuilder {
    cache: Option<Arc<FanoutCache>>,
    config: ServerConfig,
    shutdown: Option<ShutdownController>,
}

impl FanoutServerBuilder {
    /// Create a new server builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache sessions read from.
    ///
    /// This is required.
    pub fn cache(mut self, cache: Arc<FanoutCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the listen address used by [`FanoutServer::bind`].
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set the per-session settings.
    pub fn session_config(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.handshake_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.session.ping_interval = interval;
        self
    }

    /// Set how long a ping may go unanswered.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.pong_timeout = timeout;
        self
    }

    /// Set the per-breadcrumb write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.write_timeout = timeout;
        self
    }

    /// Set how many breadcrumbs a session may fall behind.
    pub fn max_lag(mut self, max_lag: u64) -> Self {
        self.config.session.max_lag = max_lag;
        self
    }

    /// Set the maximum frame size in bytes.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.session.max_frame_size = size;
        self
    }

    /// Set the maximum entries per batch frame.
    pub fn max_updates_per_frame(mut self, max: usize) -> Self {
        self.config.session.max_updates_per_frame = max;
        self
    }

    /// Set connection limits.
    pub fn connection_limits(mut self, limits: ConnectionLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set how long shutdown waits for sessions to finish.
    pub fn grace_period(mut self, period: Duration) -> Self {
        self.config.grace_period = period;
        self
    }

    /// Publish metrics through the `metrics` facade.
    pub fn enable_metrics(mut self) -> Self {
        self.config.enable_metrics = true;
        self
    }

    /// Share an existing shutdown controller, e.g. with the upstream task.
    pub fn shutdown_controller(mut self, controller: ShutdownController) -> Self {
        self.shutdown = Some(controller);
        self
    }

    /// Build the server.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Configuration`] if no cache was provided, the
    /// configuration is invalid, or the cache accepts entries too large for
    /// one frame.
    pub fn build(self) -> FanoutResult<FanoutServer> {
        let cache = self
            .cache
            .ok_or_else(|| FanoutError::Configuration("cache is required".into()))?;
        self.config.validate()?;

        let frame_size = self.config.session.max_frame_size;
        let entry_size = cache.config().max_entry_size;
        if entry_size > protocol::max_entry_size(frame_size) {
            return Err(FanoutError::Configuration(format!(
                "cache max_entry_size {entry_size} does not fit in max_frame_size {frame_size}"
            )));
        }

        let metrics = self.config.enable_metrics.then(FanoutMetrics::new);
        let connections = ConnectionTracker::new(self.config.limits.clone());

        Ok(FanoutServer {
            cache,
            config: self.config,
            metrics,
            shutdown: self.shutdown.unwrap_or_default(),
            connections,
            sessions: SessionRegistry::new(),
        })
    }
}
