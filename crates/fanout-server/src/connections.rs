//! Connection admission.
//!
//! Every accepted transport takes a slot from the [`ConnectionTracker`]
//! before a session exists for it. The slot goes back when the
//! [`ConnectionGuard`] drops at the end of the session task. Per-session
//! details (peer, state, cursor) live in the session registry instead.
//!
//! ```rust
//! use fanout_server::connections::{ConnectionLimits, ConnectionTracker};
//!
//! let tracker = ConnectionTracker::new(ConnectionLimits::new(1000, 100));
//! let slot = tracker.try_acquire(None).unwrap();
//! assert_eq!(tracker.active_connections(), 1);
//! drop(slot);
//! assert_eq!(tracker.active_connections(), 0);
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use fanout_core::{FanoutError, FanoutResult};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Admission limits. Loopback peers count against `max_per_ip` like any
/// other address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Concurrent connections overall.
    pub max_connections: u64,
    /// Concurrent connections from a single IP address.
    pub max_per_ip: u64,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::new(10_000, 100)
    }
}

impl ConnectionLimits {
    /// Limits with the given total and per-IP caps.
    pub fn new(max_connections: u64, max_per_ip: u64) -> Self {
        Self {
            max_connections,
            max_per_ip,
        }
    }
}

/// Counts open connections and refuses new ones over the limits.
///
/// Clones share the same counts.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    shared: Arc<Tracked>,
}

#[derive(Debug, Default)]
struct Tracked {
    limits: ConnectionLimits,
    slots: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    total: u64,
    per_ip: HashMap<IpAddr, u64>,
}

impl ConnectionTracker {
    /// A tracker enforcing `limits`.
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            shared: Arc::new(Tracked {
                limits,
                slots: Mutex::default(),
            }),
        }
    }

    /// The enforced limits.
    pub fn limits(&self) -> &ConnectionLimits {
        &self.shared.limits
    }

    /// Connections currently holding a slot.
    pub fn active_connections(&self) -> u64 {
        self.shared.slots.lock().total
    }

    /// Connections currently holding a slot for `ip`.
    pub fn connections_for_ip(&self, ip: IpAddr) -> u64 {
        self.shared.slots.lock().per_ip.get(&ip).copied().unwrap_or(0)
    }

    /// Take a slot for a connection from `peer`.
    ///
    /// A transport without a peer address (in-memory pipes) only counts
    /// against the total.
    ///
    /// # Errors
    ///
    /// [`FanoutError::ConnectionLimit`] if either limit is reached.
    pub fn try_acquire(&self, peer: Option<SocketAddr>) -> FanoutResult<ConnectionGuard> {
        let limits = &self.shared.limits;
        let ip = peer.map(|addr| addr.ip());
        let mut slots = self.shared.slots.lock();

        if slots.total >= limits.max_connections {
            warn!(
                active = slots.total,
                limit = limits.max_connections,
                "refusing connection: server full"
            );
            return Err(FanoutError::ConnectionLimit {
                message: format!(
                    "{} connections (limit {})",
                    slots.total, limits.max_connections
                ),
            });
        }

        if let Some(ip) = ip {
            let from_ip = slots.per_ip.entry(ip).or_insert(0);
            if *from_ip >= limits.max_per_ip {
                let count = *from_ip;
                warn!(%ip, active = count, limit = limits.max_per_ip, "refusing connection: per-IP limit");
                return Err(FanoutError::ConnectionLimit {
                    message: format!("{count} connections from {ip} (limit {})", limits.max_per_ip),
                });
            }
            *from_ip += 1;
        }
        slots.total += 1;
        debug!(peer = ?peer, active = slots.total, "connection admitted");

        Ok(ConnectionGuard {
            tracker: self.clone(),
            ip,
        })
    }

    fn release(&self, ip: Option<IpAddr>) {
        let mut slots = self.shared.slots.lock();
        slots.total = slots.total.saturating_sub(1);
        if let Some(ip) = ip {
            if let Some(from_ip) = slots.per_ip.get_mut(&ip) {
                *from_ip -= 1;
                if *from_ip == 0 {
                    slots.per_ip.remove(&ip);
                }
            }
        }
    }
}

/// An admitted connection's slot; released on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    ip: Option<IpAddr>,
}

impl ConnectionGuard {
    /// The peer IP the slot is counted against, if any.
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(last: u8) -> Option<SocketAddr> {
        Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            40000,
        ))
    }

    #[test]
    fn slot_released_on_drop() {
        let tracker = ConnectionTracker::new(ConnectionLimits::new(10, 5));
        let slot = tracker.try_acquire(peer(1)).unwrap();
        assert_eq!(tracker.active_connections(), 1);
        assert_eq!(slot.ip(), peer(1).map(|p| p.ip()));

        drop(slot);
        assert_eq!(tracker.active_connections(), 0);
        assert_eq!(tracker.connections_for_ip(Ipv4Addr::new(10, 0, 0, 1).into()), 0);
    }

    #[test]
    fn total_limit() {
        let tracker = ConnectionTracker::new(ConnectionLimits::new(2, 10));
        let _a = tracker.try_acquire(None).unwrap();
        let _b = tracker.try_acquire(peer(1)).unwrap();
        assert!(matches!(
            tracker.try_acquire(peer(2)),
            Err(FanoutError::ConnectionLimit { .. })
        ));
    }

    #[test]
    fn per_ip_limit() {
        let tracker = ConnectionTracker::new(ConnectionLimits::new(100, 2));
        {
            let _a = tracker.try_acquire(peer(1)).unwrap();
            let _b = tracker.try_acquire(peer(1)).unwrap();
            assert!(tracker.try_acquire(peer(1)).is_err());
            let _other = tracker.try_acquire(peer(2)).unwrap();
            // Refusals leave the counts untouched.
            assert_eq!(tracker.active_connections(), 3);
        }

        let _c = tracker.try_acquire(peer(1)).unwrap();
        assert_eq!(tracker.connections_for_ip(Ipv4Addr::new(10, 0, 0, 1).into()), 1);
        assert_eq!(tracker.connections_for_ip(Ipv4Addr::new(10, 0, 0, 2).into()), 0);
    }

    #[test]
    fn clones_share_counts() {
        let tracker = ConnectionTracker::new(ConnectionLimits::new(1, 1));
        let clone = tracker.clone();
        let _slot = tracker.try_acquire(None).unwrap();
        assert!(clone.try_acquire(None).is_err());
    }
}
