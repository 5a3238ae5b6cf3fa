//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use fanout_core::{FanoutError, FanoutResult};

use crate::connections::ConnectionLimits;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Per-session protocol settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed for the peer to send its `ClientHello`.
    pub handshake_timeout: Duration,
    /// Send a `Ping` after this long without one.
    pub ping_interval: Duration,
    /// Close the session if a `Ping` is not answered within this time.
    pub pong_timeout: Duration,
    /// Close the session if one breadcrumb cannot be written within this time.
    pub write_timeout: Duration,
    /// Close the session once it is more than this many breadcrumbs behind
    /// the tail.
    pub max_lag: u64,
    /// Maximum encoded frame size in bytes, in both directions.
    pub max_frame_size: usize,
    /// Maximum entries per `KvBatch` frame.
    pub max_updates_per_frame: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            max_lag: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_updates_per_frame: 1000,
        }
    }
}

impl SessionConfig {
    /// Check the configuration for unusable values.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Configuration`] naming the first bad field.
    pub fn validate(&self) -> FanoutResult<()> {
        let zero_durations = [
            ("handshake_timeout", self.handshake_timeout),
            ("ping_interval", self.ping_interval),
            ("pong_timeout", self.pong_timeout),
            ("write_timeout", self.write_timeout),
        ];
        for (name, value) in zero_durations {
            if value.is_zero() {
                return Err(FanoutError::Configuration(format!("{name} must be non-zero")));
            }
        }
        if self.max_updates_per_frame == 0 {
            return Err(FanoutError::Configuration(
                "max_updates_per_frame must be at least 1".into(),
            ));
        }
        if self.max_frame_size < 1024 {
            return Err(FanoutError::Configuration(
                "max_frame_size must be at least 1024 bytes".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the fan-out server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,
    /// Per-session settings.
    pub session: SessionConfig,
    /// Connection limits enforced before a session is created.
    pub limits: ConnectionLimits,
    /// How long shutdown waits for sessions to say goodbye.
    pub grace_period: Duration,
    /// Publish metrics through the `metrics` facade.
    pub enable_metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5473)),
            session: SessionConfig::default(),
            limits: ConnectionLimits::default(),
            grace_period: Duration::from_secs(30),
            enable_metrics: false,
        }
    }
}

impl ServerConfig {
    /// Check the configuration for unusable values.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Configuration`] naming the first bad field.
    pub fn validate(&self) -> FanoutResult<()> {
        self.session.validate()?;
        if self.limits.max_connections == 0 {
            return Err(FanoutError::Configuration(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.limits.max_per_ip == 0 {
            return Err(FanoutError::Configuration(
                "max_per_ip must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
