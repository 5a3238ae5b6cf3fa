//! Client session: one connection walking the breadcrumb chain.
//!
//! A session performs the handshake, sends one snapshot (or resumes), then
//! forwards every following breadcrumb as a delta. Between breadcrumbs it
//! keeps the connection alive with pings and watches for shutdown.
//!
//! The session's cursor is an `Arc<Breadcrumb>`. Holding it keeps the chain
//! suffix alive; dropping it when the session ends lets the cache reclaim
//! everything no other session still references.
//!
//! ## Backpressure
//!
//! Breadcrumbs are immutable, so a session that writes slowly never loses
//! updates; it just falls behind. While a write is blocked the session
//! watches the tail, and once it is more than `max_lag` breadcrumbs behind
//! it is closed with [`CloseReason::SlowConsumer`]. The peer is expected to
//! reconnect and catch up from a fresh snapshot.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fanout_cache::{Breadcrumb, FanoutCache};
use fanout_core::{CloseReason, FanoutError, FanoutResult, Sequence, SyncStatus, Update};
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::metrics::{FanoutMetrics, SessionTracker};
use crate::protocol::{
    self, envelope::Body, BatchKind, Envelope, FrameCodec, ServerHello, RESUME_MIN_VERSION,
};
use crate::registry::{SessionHandle, SessionId};
use crate::shutdown::wait_for_shutdown;

/// Upper bound for writing the final `Goodbye`.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

/// Session lifecycle.
///
/// `CatchingUp` and `Streaming` only differ for reporting: a session is
/// `Streaming` once the peer holds a complete state and receives deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Waiting for the handshake.
    Connecting = 0,
    /// Handshake done, snapshot not yet sent.
    CatchingUp = 1,
    /// Forwarding deltas.
    Streaming = 2,
    /// Terminal.
    Closed = 3,
}

impl SessionState {
    /// Static label for logs and metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::CatchingUp => "catching_up",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::CatchingUp,
            2 => Self::Streaming,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    /// The session ID.
    pub id: SessionId,
    /// Why it ended.
    pub reason: CloseReason,
    /// Last breadcrumb fully sent.
    pub last_sequence: Option<Sequence>,
    /// Breadcrumbs sent over the session's lifetime.
    pub breadcrumbs_sent: u64,
    /// The error that ended the session, if any.
    pub error: Option<FanoutError>,
}

/// Ping schedule and outstanding pong.
#[derive(Debug)]
struct Keepalive {
    interval: Duration,
    timeout: Duration,
    next_ping: Instant,
    awaiting: Option<(u64, Instant)>,
    nonce: u64,
}

impl Keepalive {
    fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            next_ping: now + interval,
            awaiting: None,
            nonce: 0,
        }
    }

    /// When the session must wake up for keepalive work.
    fn deadline(&self) -> Instant {
        match self.awaiting {
            Some((_, due)) => due,
            None => self.next_ping,
        }
    }

    /// Returns the nonce of a ping to send now, if one is due.
    fn poll(&mut self, now: Instant) -> FanoutResult<Option<u64>> {
        if let Some((_, due)) = self.awaiting {
            if now >= due {
                return Err(FanoutError::timeout("pong"));
            }
            return Ok(None);
        }
        if now >= self.next_ping {
            self.nonce += 1;
            self.awaiting = Some((self.nonce, now + self.timeout));
            self.next_ping = now + self.interval;
            return Ok(Some(self.nonce));
        }
        Ok(None)
    }

    fn on_pong(&mut self, nonce: u64) -> bool {
        match self.awaiting {
            Some((expected, _)) if expected == nonce => {
                self.awaiting = None;
                true
            }
            _ => false,
        }
    }
}

enum Step {
    Shutdown,
    Incoming(Option<FanoutResult<Envelope>>),
    Breadcrumb(Option<Arc<Breadcrumb>>),
}

/// One client session over any byte transport.
pub struct Session<T> {
    handle: Arc<SessionHandle>,
    framed: Framed<T, FrameCodec>,
    cache: Arc<FanoutCache>,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
    metrics: Option<FanoutMetrics>,
    cursor: Option<Arc<Breadcrumb>>,
    /// Tail seen at the handshake, and how far the first snapshot's `Full`
    /// trailed it.
    catch_up: Option<(Sequence, u64)>,
    sent_status: Option<SyncStatus>,
    breadcrumbs_sent: u64,
}

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.handle.id())
            .field("state", &self.handle.state())
            .field("cursor", &self.cursor.as_ref().map(|c| c.sequence()))
            .finish()
    }
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session for an accepted transport.
    pub fn new(
        transport: T,
        cache: Arc<FanoutCache>,
        config: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let codec = FrameCodec::new(config.max_frame_size);
        Self {
            handle: Arc::new(SessionHandle::new(None)),
            framed: Framed::new(transport, codec),
            cache,
            config,
            shutdown,
            metrics: None,
            cursor: None,
            catch_up: None,
            sent_status: None,
            breadcrumbs_sent: 0,
        }
    }

    /// Report state through `handle`, typically one owned by a registry.
    pub fn with_handle(mut self, handle: Arc<SessionHandle>) -> Self {
        self.handle = handle;
        self
    }

    /// Record session metrics.
    pub fn with_metrics(mut self, metrics: FanoutMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The session ID.
    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    /// The shared state handle.
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Run the session to completion.
    ///
    /// Never fails: errors end the session and are reported in the outcome.
    pub async fn run(mut self) -> SessionOutcome {
        let tracker = self.metrics.clone().map(SessionTracker::new);
        let id = self.handle.id();

        let result = self.drive().await;
        let (reason, error) = match result {
            Ok(reason) => (reason, None),
            Err(err) => (err.close_reason(), Some(err)),
        };

        if server_initiated(reason) {
            self.say_goodbye(reason, error.as_ref()).await;
        }

        let last_sequence = self.cursor.take().map(|crumb| crumb.sequence());
        self.handle.set_state(SessionState::Closed);

        match &error {
            Some(err @ FanoutError::SlowConsumer { .. }) => {
                warn!(session = %id, error = %err, "disconnecting slow consumer");
            }
            Some(err) if reason == CloseReason::Disconnected => {
                debug!(session = %id, error = %err, "peer disconnected");
            }
            Some(err) => {
                warn!(session = %id, reason = %reason, error = %err, "session failed");
            }
            None => {
                info!(
                    session = %id,
                    reason = %reason,
                    last_sequence = ?last_sequence,
                    sent = self.breadcrumbs_sent,
                    "session closed"
                );
            }
        }

        if let Some(tracker) = tracker {
            tracker.finish(reason);
        }

        SessionOutcome {
            id,
            reason,
            last_sequence,
            breadcrumbs_sent: self.breadcrumbs_sent,
            error,
        }
    }

    async fn drive(&mut self) -> FanoutResult<CloseReason> {
        let mut shutdown = self.shutdown.clone();
        let resume = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => return Ok(CloseReason::Shutdown),
            resume = self.handshake() => resume?,
        };

        match resume {
            Some(crumb) => {
                self.sent_status = Some(crumb.sync_status());
                self.advance(crumb);
                self.handle.set_state(SessionState::Streaming);
            }
            None => self.handle.set_state(SessionState::CatchingUp),
        }

        let mut keepalive = Keepalive::new(
            self.config.ping_interval,
            self.config.pong_timeout,
            Instant::now(),
        );
        loop {
            if let Some(nonce) = keepalive.poll(Instant::now())? {
                trace!(session = %self.handle.id(), nonce, "sending ping");
                self.send_frames(vec![Envelope::ping(nonce)], None).await?;
            }

            let deadline = keepalive.deadline();
            let cursor = self.cursor.clone();
            let step = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => Step::Shutdown,
                incoming = self.framed.next() => Step::Incoming(incoming),
                crumb = next_breadcrumb(&self.cache, cursor.as_deref(), deadline) => {
                    Step::Breadcrumb(crumb)
                }
            };

            match step {
                Step::Shutdown => return Ok(CloseReason::Shutdown),
                Step::Incoming(None) => return Err(FanoutError::Disconnected),
                Step::Incoming(Some(frame)) => {
                    if let Some(reason) = self.handle_incoming(frame?, &mut keepalive).await? {
                        return Ok(reason);
                    }
                }
                Step::Breadcrumb(Some(crumb)) => self.deliver(crumb).await?,
                Step::Breadcrumb(None) => {
                    if self.cache.is_closed() {
                        return Ok(CloseReason::Shutdown);
                    }
                }
            }
        }
    }

    async fn handshake(&mut self) -> FanoutResult<Option<Arc<Breadcrumb>>> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let frame = match timeout_at(deadline, self.framed.next()).await {
            Err(_) => return Err(FanoutError::timeout("handshake")),
            Ok(None) => return Err(FanoutError::Disconnected),
            Ok(Some(frame)) => frame?,
        };

        let name = frame.name();
        let hello = match frame.body {
            Some(Body::ClientHello(hello)) => hello,
            _ => {
                return Err(FanoutError::protocol(format!(
                    "expected client_hello, got {name}"
                )))
            }
        };

        let version = protocol::negotiate_version(hello.min_version, hello.max_version)?;
        if !hello.client_name.is_empty() {
            self.handle.set_client_name(hello.client_name.clone());
        }

        let epoch = self.cache.epoch();
        let resume = match (hello.resume_from, hello.resume_epoch) {
            (Some(seq), Some(peer_epoch)) if version >= RESUME_MIN_VERSION => {
                self.resume_point(Sequence::new(seq), peer_epoch)
            }
            _ => None,
        };

        let latest = self.cache.latest_sequence();
        if resume.is_none() {
            self.catch_up = latest.map(|tail| (tail, 0));
        }
        let hello_reply = ServerHello {
            version,
            resumed: resume.is_some(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            latest_sequence: latest.map_or(0, |s| s.get()),
            epoch,
        };
        self.send_frames(vec![Envelope::server_hello(hello_reply)], None)
            .await?;

        info!(
            session = %self.handle.id(),
            remote_addr = ?self.handle.remote_addr(),
            client = %hello.client_name,
            client_version = %hello.client_version,
            version,
            resumed = resume.is_some(),
            "session established"
        );
        Ok(resume)
    }

    /// The breadcrumb to resume after, if the peer's position belongs to
    /// this cache, is still reachable and is not already too far behind.
    fn resume_point(&self, sequence: Sequence, peer_epoch: u64) -> Option<Arc<Breadcrumb>> {
        let id = self.handle.id();
        if peer_epoch != self.cache.epoch() {
            debug!(session = %id, peer_epoch, "resume from another cache epoch, sending snapshot");
            return None;
        }
        let lag = self.cache.lag(sequence);
        if lag > self.config.max_lag {
            debug!(session = %id, resume_from = %sequence, lag, "resume point too far behind, sending snapshot");
            return None;
        }
        let found = self.cache.resume_at(sequence);
        if found.is_none() {
            debug!(session = %id, resume_from = %sequence, "resume point not reachable, sending snapshot");
        }
        found
    }

    async fn handle_incoming(
        &mut self,
        frame: Envelope,
        keepalive: &mut Keepalive,
    ) -> FanoutResult<Option<CloseReason>> {
        let name = frame.name();
        match frame.body {
            Some(Body::Pong(pong)) => {
                if !keepalive.on_pong(pong.nonce) {
                    trace!(session = %self.handle.id(), nonce = pong.nonce, "unsolicited pong");
                }
                Ok(None)
            }
            Some(Body::Ping(ping)) => {
                self.send_frames(vec![Envelope::pong(ping.nonce)], None)
                    .await?;
                Ok(None)
            }
            Some(Body::Goodbye(goodbye)) => {
                debug!(
                    session = %self.handle.id(),
                    reason = %goodbye.reason,
                    "client said goodbye"
                );
                Ok(Some(CloseReason::ClientGoodbye))
            }
            _ => Err(FanoutError::protocol(format!(
                "unexpected {name} from client"
            ))),
        }
    }

    /// Send one breadcrumb: the snapshot of a `Full` if the peer has no
    /// state yet, its delta otherwise.
    async fn deliver(&mut self, crumb: Arc<Breadcrumb>) -> FanoutResult<()> {
        let sequence = crumb.sequence();
        let first = self.cursor.is_none();
        if first {
            // The latest Full may trail the tail by up to a full snapshot
            // interval; that backlog does not count against `max_lag`.
            let target = self
                .catch_up
                .map(|(tail, _)| tail)
                .or_else(|| self.cache.latest_sequence());
            self.catch_up = target.map(|tail| (tail, sequence.lag_behind(tail)));
        }
        let limit = self.lag_limit(sequence);
        let lag = self.cache.lag(sequence);
        if lag > limit {
            return Err(FanoutError::SlowConsumer { lag, limit });
        }

        let snapshot_updates;
        let (kind, updates): (BatchKind, &[Update]) = if first {
            let snapshot = crumb.snapshot().ok_or_else(|| FanoutError::Internal {
                message: format!("starting breadcrumb {sequence} carries no snapshot"),
                source: None,
            })?;
            snapshot_updates = snapshot.to_updates();
            (BatchKind::Snapshot, &snapshot_updates)
        } else {
            (BatchKind::Delta, crumb.deltas())
        };

        let mut frames = protocol::batch_frames(
            sequence,
            kind,
            updates,
            self.config.max_updates_per_frame,
            self.config.max_frame_size,
        );
        let status = crumb.sync_status();
        if self.sent_status != Some(status) {
            frames.push(Envelope::sync_status(status, sequence));
        }
        let frame_count = frames.len();
        let entries = updates.len();

        let bytes = self.send_frames(frames, Some((sequence, limit))).await?;

        if self.sent_status != Some(status) {
            debug!(session = %self.handle.id(), status = %status, sequence = %sequence, "sent sync status");
            self.sent_status = Some(status);
        }
        let label = match kind {
            BatchKind::Snapshot => "snapshot",
            BatchKind::Delta => "delta",
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_sent(label, frame_count, bytes);
            metrics.record_lag(lag);
        }
        trace!(
            session = %self.handle.id(),
            sequence = %sequence,
            kind = label,
            entries,
            frames = frame_count,
            lag,
            "sent breadcrumb"
        );

        self.advance(crumb);
        if first {
            self.handle.set_state(SessionState::Streaming);
        }
        if self.catch_up.is_some_and(|(target, _)| sequence >= target) {
            self.catch_up = None;
        }
        Ok(())
    }

    /// Lag allowed for `sequence`: `max_lag`, plus the initial backlog while
    /// a fresh session works through it.
    fn lag_limit(&self, sequence: Sequence) -> u64 {
        match self.catch_up {
            Some((target, backlog)) if sequence <= target => {
                self.config.max_lag.saturating_add(backlog)
            }
            _ => self.config.max_lag,
        }
    }

    fn advance(&mut self, crumb: Arc<Breadcrumb>) {
        self.handle.set_cursor(crumb.sequence());
        self.breadcrumbs_sent += 1;
        self.cursor = Some(crumb);
    }

    /// Write `frames` within `write_timeout`.
    ///
    /// While the write is pending and `sending` names a breadcrumb and its
    /// lag limit, every new breadcrumb re-checks that lag against the tail.
    async fn send_frames(
        &mut self,
        frames: Vec<Envelope>,
        sending: Option<(Sequence, u64)>,
    ) -> FanoutResult<usize> {
        let bytes: usize = frames.iter().map(|f| f.encoded_len() + 4).sum();
        let deadline = Instant::now() + self.config.write_timeout;
        let cache = &self.cache;
        let framed = &mut self.framed;

        let write = async move {
            for frame in frames {
                framed.feed(frame).await?;
            }
            framed.flush().await
        };
        tokio::pin!(write);

        loop {
            let tail = cache.tail();
            tokio::select! {
                result = &mut write => {
                    result?;
                    return Ok(bytes);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(FanoutError::timeout("write"));
                }
                Some(_) = wait_past(tail.as_deref(), deadline), if sending.is_some() => {
                    if let Some((sequence, limit)) = sending {
                        let lag = cache.lag(sequence);
                        if lag > limit {
                            return Err(FanoutError::SlowConsumer { lag, limit });
                        }
                    }
                }
            }
        }
    }

    async fn say_goodbye(&mut self, reason: CloseReason, error: Option<&FanoutError>) {
        let message = error.map(ToString::to_string).unwrap_or_default();
        let goodbye = Envelope::goodbye(reason.as_str(), message);
        if timeout(GOODBYE_TIMEOUT, self.framed.send(goodbye))
            .await
            .map_or(true, |result| result.is_err())
        {
            trace!(session = %self.handle.id(), "goodbye not delivered");
        }
    }
}

/// Whether the server, not the peer, ended the session and should tell the
/// peer why.
fn server_initiated(reason: CloseReason) -> bool {
    !matches!(
        reason,
        CloseReason::ClientGoodbye | CloseReason::Disconnected | CloseReason::TransportError
    )
}

async fn next_breadcrumb(
    cache: &FanoutCache,
    cursor: Option<&Breadcrumb>,
    deadline: Instant,
) -> Option<Arc<Breadcrumb>> {
    match cursor {
        Some(cursor) => cache.next(cursor, deadline).await,
        None => cache.wait_for_first(deadline).await,
    }
}

/// Resolve when a breadcrumb after `tail` is published.
async fn wait_past(tail: Option<&Breadcrumb>, deadline: Instant) -> Option<Arc<Breadcrumb>> {
    match tail {
        Some(tail) => tail.wait_next(deadline).await,
        None => None,
    }
}
