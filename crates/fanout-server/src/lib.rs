//! # fanout-server
//!
//! TCP server and wire protocol for the fan-out cache.
//!
//! This crate connects downstream clients to a [`FanoutCache`]:
//!
//! - [`FanoutServer`] - Accept loop handing each connection to a session task
//! - [`FanoutServerBuilder`] - Builder for configuring the server
//! - [`Session`] - Handshake, snapshot, then one delta per breadcrumb
//! - [`SyncClient`] - Client side of the protocol with a local replica
//! - Connection limits, a live session registry and graceful shutdown
//! - Metrics through the `metrics` facade
//!
//! ## Example
//!
//! ```rust,ignore
//! use fanout_server::FanoutServerBuilder;
//! use fanout_cache::FanoutCache;
//! use std::sync::Arc;
//!
//! let cache = Arc::new(FanoutCache::default());
//! let server = FanoutServerBuilder::new()
//!     .cache(Arc::clone(&cache))
//!     .listen_addr("[::]:5473".parse()?)
//!     .enable_metrics()
//!     .build()?;
//!
//! // Runs until SIGTERM/SIGINT, then drains sessions.
//! server.serve().await?;
//! ```
//!
//! ## Graceful Shutdown
//!
//! On shutdown the listener stops accepting, every session sends `Goodbye`
//! and drops its breadcrumb, and the server waits up to the grace period for
//! the session tasks to finish.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
pub mod client;
mod config;
pub mod connections;
pub mod metrics;
pub mod protocol;
pub mod registry;
mod session;
pub mod shutdown;

pub use builder::FanoutServerBuilder;
pub use client::{ClientEvent, Replica, SyncClient, SyncClientConfig};
pub use config::{ServerConfig, SessionConfig};
pub use connections::{ConnectionGuard, ConnectionLimits, ConnectionTracker};
pub use metrics::FanoutMetrics;
pub use registry::{SessionHandle, SessionId, SessionInfo, SessionRegistry};
pub use session::{Session, SessionOutcome, SessionState};
pub use shutdown::{ShutdownController, ShutdownSignal};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fanout_cache::FanoutCache;
use fanout_core::{FanoutError, FanoutResult};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::protocol::{Envelope, FrameCodec};
use crate::shutdown::wait_for_shutdown;

/// How often cache and session gauges are refreshed while metrics are on.
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound for telling a rejected connection why.
const REJECT_TIMEOUT: Duration = Duration::from_secs(1);

/// The fan-out server.
///
/// Owns the listener side: connection limits, the session registry and the
/// shutdown controller. The cache is shared with whatever feeds it.
#[derive(Debug)]
pub struct FanoutServer {
    /// Shared cache.
    cache: Arc<FanoutCache>,
    /// Server configuration.
    config: ServerConfig,
    /// Metrics collector.
    metrics: Option<FanoutMetrics>,
    /// Shutdown controller.
    shutdown: ShutdownController,
    /// Connection tracker.
    connections: ConnectionTracker,
    /// Live sessions.
    sessions: SessionRegistry,
}

impl FanoutServer {
    /// Create a new builder for configuring the server.
    pub fn builder() -> FanoutServerBuilder {
        FanoutServerBuilder::new()
    }

    /// Get a reference to the cache.
    #[inline]
    pub fn cache(&self) -> &Arc<FanoutCache> {
        &self.cache
    }

    /// Get the server configuration.
    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the metrics instance, if enabled.
    #[inline]
    pub fn metrics(&self) -> Option<&FanoutMetrics> {
        self.metrics.as_ref()
    }

    /// Get the shutdown controller.
    #[inline]
    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// Get the connection tracker.
    #[inline]
    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    /// Get the registry of live sessions.
    #[inline]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the address cannot be bound.
    pub async fn bind(&self) -> FanoutResult<TcpListener> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        Ok(listener)
    }

    /// Accept connections on `listener` until shutdown is initiated.
    ///
    /// Sessions keep running after this returns; use
    /// [`FanoutServer::shutdown`] to drain them.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's address cannot be read.
    pub async fn run(&self, listener: TcpListener) -> FanoutResult<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "fan-out server listening");

        let mut incoming = TcpListenerStream::new(listener);
        let mut shutdown = self.shutdown.subscribe();
        let mut gauges = tokio::time::interval(METRICS_INTERVAL);
        gauges.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let stream = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = gauges.tick(), if self.metrics.is_some() => {
                    self.record_gauges();
                    continue;
                }
                next = incoming.next() => match next {
                    Some(Ok(stream)) => stream,
                    Some(Err(err)) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                    None => break,
                },
            };

            let peer = stream.peer_addr().ok();
            if let Err(err) = stream.set_nodelay(true) {
                debug!(peer = ?peer, error = %err, "failed to set TCP_NODELAY");
            }
            self.handle_connection(stream, peer);
        }

        info!(addr = %local_addr, "listener stopped");
        Ok(())
    }

    /// Start a session for an accepted transport.
    ///
    /// Returns `None` if the connection limits refuse it; the peer is then
    /// sent a `Goodbye` and disconnected.
    pub fn handle_connection<T>(
        &self,
        transport: T,
        peer: Option<SocketAddr>,
    ) -> Option<JoinHandle<SessionOutcome>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let guard = match self.connections.try_acquire(peer) {
            Ok(guard) => guard,
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.connection_rejected();
                }
                tokio::spawn(reject(transport, err, self.config.session.max_frame_size));
                return None;
            }
        };

        let drain = self.shutdown.drain_guard();
        let registration = self.sessions.register(peer);
        let mut session = Session::new(
            transport,
            Arc::clone(&self.cache),
            self.config.session.clone(),
            self.shutdown.subscribe(),
        )
        .with_handle(Arc::clone(registration.handle()));

        let metrics = self.metrics.clone();
        if let Some(metrics) = &metrics {
            metrics.connection_opened();
            session = session.with_metrics(metrics.clone());
        }

        debug!(session = %session.id(), peer = ?peer, "starting session");
        Some(tokio::spawn(async move {
            let outcome = session.run().await;
            drop(registration);
            drop(guard);
            if let Some(metrics) = metrics {
                metrics.connection_closed();
            }
            drop(drain);
            outcome
        }))
    }

    /// Initiate shutdown and wait up to the grace period for sessions to
    /// finish.
    ///
    /// Returns `true` if every session finished in time.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.shutdown(self.config.grace_period).await
    }

    /// Bind, serve until SIGTERM/SIGINT or a programmatic shutdown, then
    /// drain sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the signal handlers cannot be
    /// installed.
    pub async fn serve(&self) -> FanoutResult<()> {
        let listener = self.bind().await?;
        tokio::select! {
            result = self.run(listener) => result?,
            signal = shutdown::wait_for_signal() => {
                signal.map_err(|err| FanoutError::internal("installing signal handlers", err))?;
            }
        }
        if !self.shutdown().await {
            warn!(remaining = self.sessions.len(), "sessions still running after grace period");
        }
        Ok(())
    }

    fn record_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache(&self.cache);
            let latest = self.cache.latest_sequence();
            ::metrics::gauge!("fanout_session_max_lag").set(self.sessions.max_lag(latest) as f64);
        }
    }
}

/// Tell a refused peer why, then wait for it to hang up.
///
/// Draining the peer's handshake before closing keeps the kernel from
/// resetting the connection ahead of the `Goodbye`.
async fn reject<T>(transport: T, err: FanoutError, max_frame_size: usize)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(transport, FrameCodec::new(max_frame_size));
    let goodbye = Envelope::goodbye("connection_limit", err.to_string());
    let _ = tokio::time::timeout(REJECT_TIMEOUT, async {
        framed.send(goodbye).await?;
        while framed.next().await.transpose()?.is_some() {}
        Ok::<_, FanoutError>(())
    })
    .await;
}
