//! Graceful shutdown coordination.
//!
//! The listener and every session watch one [`ShutdownController`]. Once it
//! is triggered the accept loop stops, each session sends `Goodbye` and lets
//! go of its breadcrumb, and the controller waits up to a grace period for
//! the last [`DrainGuard`] to drop.
//!
//! # Example
//!
//! ```rust,ignore
//! use fanout_server::shutdown::ShutdownController;
//! use std::time::Duration;
//!
//! let controller = ShutdownController::new();
//!
//! // Held by a session task for as long as it runs.
//! let guard = controller.drain_guard();
//!
//! // On SIGTERM:
//! let drained = controller.shutdown(Duration::from_secs(30)).await;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Broadcasts shutdown and tracks the tasks that must drain before the
/// process exits.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    triggered: watch::Sender<bool>,
    draining: AtomicUsize,
    drained: Notify,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    /// A controller that has not been triggered.
    pub fn new() -> Self {
        let (triggered, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                triggered,
                draining: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Receiver that flips to `true` on shutdown, for `select!` loops.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.triggered.subscribe()
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.shared.triggered.borrow()
    }

    /// Owned future-like handle for tasks outside the server, such as the
    /// upstream pump.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.subscribe(),
        }
    }

    /// Trigger shutdown and wait up to `grace_period` for every
    /// [`DrainGuard`] to drop.
    ///
    /// Returns `true` if everything drained in time. Only the first call
    /// waits; later calls return `true` at once.
    pub async fn shutdown(&self, grace_period: Duration) -> bool {
        let first = self.shared.triggered.send_if_modified(|triggered| {
            let was = *triggered;
            *triggered = true;
            !was
        });
        if !first {
            return true;
        }

        info!(
            grace_period = ?grace_period,
            draining = self.draining(),
            "shutting down"
        );
        if timeout(grace_period, self.drained()).await.is_ok() {
            info!("all sessions drained");
            return true;
        }
        warn!(
            draining = self.draining(),
            "grace period elapsed with sessions still running"
        );
        false
    }

    async fn drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.draining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Count a task that shutdown must wait for until the guard drops.
    pub fn drain_guard(&self) -> DrainGuard {
        self.shared.draining.fetch_add(1, Ordering::AcqRel);
        DrainGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Tasks still holding a [`DrainGuard`].
    pub fn draining(&self) -> usize {
        self.shared.draining.load(Ordering::Acquire)
    }
}

/// Keeps shutdown waiting while alive.
#[derive(Debug)]
pub struct DrainGuard {
    shared: Arc<Shared>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.shared.draining.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("last drain guard released");
            self.shared.drained.notify_waiters();
        }
    }
}

/// Resolves once shutdown is triggered or the controller is dropped.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for shutdown.
    pub async fn wait(mut self) {
        wait_for_shutdown(&mut self.rx).await;
    }
}

/// Cancel safe.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    // Err means every controller is gone, which counts as shutdown.
    let _ = rx.wait_for(|triggered| *triggered).await;
}

/// Resolve on SIGTERM or SIGINT (Ctrl+C elsewhere).
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = term.recv() => info!(signal = "SIGTERM", "shutdown requested"),
            _ = int.recv() => info!(signal = "SIGINT", "shutdown requested"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!(signal = "ctrl_c", "shutdown requested");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_are_counted() {
        let controller = ShutdownController::new();
        let a = controller.drain_guard();
        let b = controller.drain_guard();
        assert_eq!(controller.draining(), 2);
        drop(a);
        assert_eq!(controller.draining(), 1);
        drop(b);
        assert_eq!(controller.draining(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_shutdown() {
        let controller = ShutdownController::new();
        let mut rx = controller.subscribe();
        assert!(!controller.is_shutdown());

        let trigger = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.shutdown(Duration::from_millis(100)).await;
        });

        wait_for_shutdown(&mut rx).await;
        assert!(controller.is_shutdown());
    }

    #[tokio::test]
    async fn late_subscriber_sees_shutdown() {
        let controller = ShutdownController::new();
        assert!(controller.shutdown(Duration::from_secs(1)).await);
        controller.shutdown_signal().wait().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_sessions_to_drain() {
        let controller = ShutdownController::new();
        let session = controller.drain_guard();

        let handle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.shutdown(Duration::from_secs(5)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        drop(session);

        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_elapses() {
        let controller = ShutdownController::new();
        let _stuck = controller.drain_guard();
        assert!(!controller.shutdown(Duration::from_secs(1)).await);
        assert!(controller.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn dropped_controller_counts_as_shutdown() {
        let controller = ShutdownController::new();
        let signal = controller.shutdown_signal();
        drop(controller);
        signal.wait().await;
    }
}
