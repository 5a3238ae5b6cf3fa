//! Downstream client for the fan-out protocol.
//!
//! [`SyncClient`] performs the handshake, reassembles chunked batches and
//! maintains a local [`Replica`] of the key space. It answers keepalive pings
//! on its own; callers only see [`ClientEvent`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use fanout_server::client::{ClientEvent, SyncClient, SyncClientConfig};
//!
//! let mut client = SyncClient::connect(addr, SyncClientConfig::new("watcher")).await?;
//! while let Some(event) = client.next_event().await? {
//!     if let ClientEvent::Delta { sequence, updates } = event {
//!         println!("{sequence}: {} changes", updates.len());
//!     }
//! }
//! ```

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use fanout_core::{FanoutError, FanoutResult, Key, Sequence, SyncStatus, Update};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::protocol::{
    envelope::Body, BatchKind, ClientHello, Envelope, FrameCodec, KvBatch, DEFAULT_MAX_FRAME_SIZE,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};

/// Client settings.
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// Name reported in the handshake.
    pub client_name: String,
    /// Maximum accepted frame size.
    pub max_frame_size: usize,
    /// Time allowed for the server's reply to the handshake.
    pub handshake_timeout: Duration,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self::new("fanout-client")
    }
}

impl SyncClientConfig {
    /// Config with default limits and the given client name.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Local copy of the key space, as rebuilt from snapshots and deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    entries: BTreeMap<Key, Bytes>,
    last_sequence: Option<Sequence>,
    /// Server cache epoch `last_sequence` belongs to.
    epoch: Option<u64>,
    status: Option<SyncStatus>,
}

impl Replica {
    /// An empty replica that has never received a snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, Key, Bytes> {
        self.entries.iter()
    }

    /// Sequence of the last breadcrumb applied.
    pub fn last_sequence(&self) -> Option<Sequence> {
        self.last_sequence
    }

    /// Last sync status received.
    pub fn sync_status(&self) -> Option<SyncStatus> {
        self.status
    }

    /// Server cache epoch of the last snapshot, needed to resume.
    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    /// Position to offer for a resume, if the replica has one.
    fn resume_position(&self) -> Option<(u64, u64)> {
        Some((self.last_sequence?.get(), self.epoch?))
    }

    fn apply_snapshot(&mut self, epoch: u64, sequence: Sequence, updates: &[Update]) {
        self.entries.clear();
        for update in updates {
            if let Some(value) = &update.value {
                self.entries.insert(update.key.clone(), value.clone());
            }
        }
        self.last_sequence = Some(sequence);
        self.epoch = Some(epoch);
    }

    fn apply_delta(&mut self, sequence: Sequence, updates: &[Update]) -> FanoutResult<()> {
        let expected = self.last_sequence.map(|s| s.next());
        if expected != Some(sequence) {
            return Err(FanoutError::protocol(format!(
                "delta {sequence} does not follow {:?}",
                self.last_sequence.map(|s| s.get())
            )));
        }
        for update in updates {
            match &update.value {
                Some(value) => {
                    self.entries.insert(update.key.clone(), value.clone());
                }
                None => {
                    self.entries.remove(update.key.as_str());
                }
            }
        }
        self.last_sequence = Some(sequence);
        Ok(())
    }
}

/// What the server told the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The replica was replaced by a complete snapshot.
    Snapshot {
        /// Breadcrumb the snapshot was taken from.
        sequence: Sequence,
        /// Live keys in the snapshot.
        entries: usize,
    },
    /// A delta was applied to the replica.
    Delta {
        /// Breadcrumb the delta belongs to.
        sequence: Sequence,
        /// Net changes in the delta.
        updates: Vec<Update>,
    },
    /// The upstream sync status changed.
    SyncStatus {
        /// New status.
        status: SyncStatus,
        /// First breadcrumb carrying it.
        sequence: Sequence,
    },
    /// The server closed the session.
    Closed {
        /// Close reason label.
        reason: String,
        /// Optional detail.
        message: String,
    },
}

/// A batch whose frames have not all arrived yet.
#[derive(Debug)]
struct PendingBatch {
    sequence: Sequence,
    kind: BatchKind,
    updates: Vec<Update>,
}

/// Client side of one session.
#[derive(Debug)]
pub struct SyncClient<T> {
    framed: Framed<T, FrameCodec>,
    version: u32,
    epoch: u64,
    resumed: bool,
    replica: Replica,
    pending: Option<PendingBatch>,
    closed: bool,
}

impl SyncClient<TcpStream> {
    /// Connect over TCP and receive a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn connect(addr: SocketAddr, config: SyncClientConfig) -> FanoutResult<Self> {
        Self::connect_with_replica(addr, config, Replica::new()).await
    }

    /// Connect over TCP and try to resume after the replica's last sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn connect_with_replica(
        addr: SocketAddr,
        config: SyncClientConfig,
        replica: Replica,
    ) -> FanoutResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, config, replica).await
    }
}

impl<T> SyncClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake over an established transport.
    ///
    /// If `replica` came from an earlier session, the client asks to resume
    /// after its last sequence. When the server declines, the replica loses
    /// its position and is replaced by the next snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refuses the session, answers with
    /// anything but `ServerHello`, or does not answer in time.
    pub async fn handshake(
        transport: T,
        config: SyncClientConfig,
        mut replica: Replica,
    ) -> FanoutResult<Self> {
        let resume = replica.resume_position();
        let mut framed = Framed::new(transport, FrameCodec::new(config.max_frame_size));
        framed
            .send(Envelope::client_hello(ClientHello {
                max_version: PROTOCOL_VERSION,
                min_version: MIN_PROTOCOL_VERSION,
                client_name: config.client_name,
                client_version: env!("CARGO_PKG_VERSION").to_string(),
                resume_from: resume.map(|(sequence, _)| sequence),
                resume_epoch: resume.map(|(_, epoch)| epoch),
            }))
            .await?;

        let frame = match timeout(config.handshake_timeout, framed.next()).await {
            Err(_) => return Err(FanoutError::timeout("handshake")),
            Ok(None) => return Err(FanoutError::Disconnected),
            Ok(Some(frame)) => frame?,
        };
        let name = frame.name();
        let hello = match frame.body {
            Some(Body::ServerHello(hello)) => hello,
            Some(Body::Goodbye(goodbye)) => {
                return Err(match goodbye.reason.as_str() {
                    "connection_limit" => FanoutError::ConnectionLimit {
                        message: goodbye.message,
                    },
                    _ => FanoutError::protocol(format!(
                        "server refused session: {} {}",
                        goodbye.reason, goodbye.message
                    )),
                });
            }
            _ => {
                return Err(FanoutError::protocol(format!(
                    "expected server_hello, got {name}"
                )))
            }
        };

        debug!(
            version = hello.version,
            resumed = hello.resumed,
            server_version = %hello.server_version,
            latest_sequence = hello.latest_sequence,
            epoch = hello.epoch,
            "connected to fan-out server"
        );
        if !hello.resumed {
            replica.last_sequence = None;
            replica.epoch = None;
        }

        Ok(Self {
            framed,
            version: hello.version,
            epoch: hello.epoch,
            resumed: hello.resumed,
            replica,
            pending: None,
            closed: false,
        })
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether the server resumed instead of sending a snapshot.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// The local replica.
    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Take the replica, e.g. to resume on a new connection.
    pub fn into_replica(self) -> Replica {
        self.replica
    }

    /// Receive the next event, answering pings along the way.
    ///
    /// Returns `Ok(None)` once the transport is closed.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the server breaks ordering, e.g. a delta
    /// that does not follow the last applied sequence.
    pub async fn next_event(&mut self) -> FanoutResult<Option<ClientEvent>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            let Some(frame) = self.framed.next().await else {
                self.closed = true;
                return Ok(None);
            };
            let frame = frame?;
            let name = frame.name();
            match frame.body {
                Some(Body::Ping(ping)) => self.framed.send(Envelope::pong(ping.nonce)).await?,
                Some(Body::Pong(_)) => {}
                Some(Body::Batch(batch)) => {
                    if let Some(event) = self.on_batch(batch)? {
                        return Ok(Some(event));
                    }
                }
                Some(Body::SyncStatus(update)) => {
                    let status = update.sync_status()?;
                    self.replica.status = Some(status);
                    return Ok(Some(ClientEvent::SyncStatus {
                        status,
                        sequence: Sequence::new(update.sequence),
                    }));
                }
                Some(Body::Goodbye(goodbye)) => {
                    self.closed = true;
                    return Ok(Some(ClientEvent::Closed {
                        reason: goodbye.reason,
                        message: goodbye.message,
                    }));
                }
                _ => {
                    return Err(FanoutError::protocol(format!(
                        "unexpected {name} from server"
                    )))
                }
            }
        }
    }

    /// Process events until the replica reaches `sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Disconnected`] if the session ends first.
    pub async fn wait_for_sequence(&mut self, sequence: Sequence) -> FanoutResult<()> {
        while self.replica.last_sequence.map_or(true, |last| last < sequence) {
            match self.next_event().await? {
                None | Some(ClientEvent::Closed { .. }) => return Err(FanoutError::Disconnected),
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Say goodbye and close the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the goodbye cannot be written.
    pub async fn close(mut self) -> FanoutResult<Replica> {
        if !self.closed {
            self.framed
                .send(Envelope::goodbye("client_goodbye", ""))
                .await?;
            self.framed.close().await?;
        }
        Ok(self.replica)
    }

    fn on_batch(&mut self, batch: KvBatch) -> FanoutResult<Option<ClientEvent>> {
        let kind = batch.batch_kind()?;
        let sequence = Sequence::new(batch.sequence);
        let more = batch.more;
        let updates = batch
            .updates
            .into_iter()
            .map(Update::try_from)
            .collect::<FanoutResult<Vec<_>>>()?;

        let pending = match self.pending.take() {
            Some(mut pending) => {
                if pending.sequence != sequence || pending.kind != kind {
                    return Err(FanoutError::protocol(format!(
                        "batch {sequence} interleaved with unfinished batch {}",
                        pending.sequence
                    )));
                }
                pending.updates.extend(updates);
                pending
            }
            None => PendingBatch {
                sequence,
                kind,
                updates,
            },
        };
        if more {
            self.pending = Some(pending);
            return Ok(None);
        }

        let event = match pending.kind {
            BatchKind::Snapshot => {
                self
                    .replica
                    .apply_snapshot(self.epoch, pending.sequence, &pending.updates);
                ClientEvent::Snapshot {
                    sequence: pending.sequence,
                    entries: self.replica.len(),
                }
            }
            BatchKind::Delta => {
                self.replica.apply_delta(pending.sequence, &pending.updates)?;
                ClientEvent::Delta {
                    sequence: pending.sequence,
                    updates: pending.updates,
                }
            }
        };
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{batch_frames, ServerHello};
    use tokio::io::DuplexStream;

    type Server = Framed<DuplexStream, FrameCodec>;

    const EPOCH: u64 = 7;

    fn frames(
        sequence: u64,
        kind: BatchKind,
        updates: &[Update],
        per_frame: usize,
    ) -> Vec<Envelope> {
        batch_frames(
            Sequence::new(sequence),
            kind,
            updates,
            per_frame,
            DEFAULT_MAX_FRAME_SIZE,
        )
    }

    async fn connected(replica: Replica) -> (SyncClient<DuplexStream>, Server) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut server = Framed::new(server_io, FrameCodec::default());

        let accept = async {
            let hello = server.next().await.unwrap().unwrap();
            let resumed = match hello.body {
                Some(Body::ClientHello(hello)) => {
                    hello.resume_from.is_some() && hello.resume_epoch == Some(EPOCH)
                }
                other => panic!("expected client hello, got {other:?}"),
            };
            server
                .send(Envelope::server_hello(ServerHello {
                    version: PROTOCOL_VERSION,
                    resumed,
                    server_version: "test".into(),
                    latest_sequence: 0,
                    epoch: EPOCH,
                }))
                .await
                .unwrap();
        };
        let (client, ()) = tokio::join!(
            SyncClient::handshake(client_io, SyncClientConfig::new("test"), replica),
            accept
        );
        (client.unwrap(), server)
    }

    async fn send_all(server: &mut Server, frames: Vec<Envelope>) {
        for frame in frames {
            server.send(frame).await.unwrap();
        }
    }

    #[tokio::test]
    async fn reassembles_chunked_snapshot() {
        let (mut client, mut server) = connected(Replica::new()).await;
        let updates: Vec<Update> = (0..5)
            .map(|i| Update::upsert(format!("k{i}"), "v"))
            .collect();
        send_all(
            &mut server,
            frames(3, BatchKind::Snapshot, &updates, 2),
        )
        .await;

        let event = client.next_event().await.unwrap().unwrap();
        assert_eq!(
            event,
            ClientEvent::Snapshot {
                sequence: Sequence::new(3),
                entries: 5
            }
        );
        assert_eq!(client.replica().last_sequence(), Some(Sequence::new(3)));
        assert_eq!(client.replica().epoch(), Some(EPOCH));
    }

    #[tokio::test]
    async fn applies_deltas_and_tombstones() {
        let (mut client, mut server) = connected(Replica::new()).await;
        let base = [Update::upsert("a", "1"), Update::upsert("b", "2")];
        send_all(&mut server, frames(1, BatchKind::Snapshot, &base, 10)).await;
        let delta = [Update::delete("a"), Update::upsert("c", "3")];
        send_all(&mut server, frames(2, BatchKind::Delta, &delta, 10)).await;
        server
            .send(Envelope::sync_status(SyncStatus::InSync, Sequence::new(2)))
            .await
            .unwrap();

        client.wait_for_sequence(Sequence::new(2)).await.unwrap();
        assert!(client.replica().get("a").is_none());
        assert_eq!(client.replica().get("c").unwrap(), &Bytes::from("3"));

        let event = client.next_event().await.unwrap().unwrap();
        assert!(matches!(
            event,
            ClientEvent::SyncStatus {
                status: SyncStatus::InSync,
                ..
            }
        ));
        assert_eq!(client.replica().sync_status(), Some(SyncStatus::InSync));
    }

    #[tokio::test]
    async fn rejects_sequence_gap() {
        let (mut client, mut server) = connected(Replica::new()).await;
        send_all(&mut server, frames(1, BatchKind::Snapshot, &[], 10)).await;
        send_all(&mut server, frames(3, BatchKind::Delta, &[], 10)).await;

        client.next_event().await.unwrap();
        let err = client.next_event().await.unwrap_err();
        assert!(matches!(err, FanoutError::Protocol { .. }));
    }

    #[tokio::test]
    async fn answers_pings() {
        let (mut client, mut server) = connected(Replica::new()).await;
        server.send(Envelope::ping(9)).await.unwrap();
        server.send(Envelope::goodbye("shutdown", "")).await.unwrap();

        let event = client.next_event().await.unwrap().unwrap();
        assert!(matches!(event, ClientEvent::Closed { ref reason, .. } if reason == "shutdown"));
        assert_eq!(server.next().await.unwrap().unwrap(), Envelope::pong(9));
        assert!(client.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_keeps_replica() {
        let mut replica = Replica::new();
        replica.apply_snapshot(EPOCH, Sequence::new(4), &[Update::upsert("x", "1")]);

        let (mut client, mut server) = connected(replica).await;
        assert!(client.resumed());
        send_all(
            &mut server,
            frames(5, BatchKind::Delta, &[Update::upsert("y", "2")], 10),
        )
        .await;

        client.wait_for_sequence(Sequence::new(5)).await.unwrap();
        assert_eq!(client.replica().len(), 2);
    }

    #[tokio::test]
    async fn replica_from_another_epoch_starts_over() {
        let mut replica = Replica::new();
        replica.apply_snapshot(EPOCH + 1, Sequence::new(4), &[Update::upsert("old", "1")]);

        let (mut client, mut server) = connected(replica).await;
        assert!(!client.resumed());
        assert_eq!(client.replica().last_sequence(), None);

        send_all(
            &mut server,
            frames(1, BatchKind::Snapshot, &[Update::upsert("new", "1")], 10),
        )
        .await;
        client.wait_for_sequence(Sequence::FIRST).await.unwrap();
        assert!(client.replica().get("old").is_none());
        assert_eq!(client.replica().get("new").unwrap(), &Bytes::from("1"));
        assert_eq!(client.replica().epoch(), Some(EPOCH));
    }

    #[tokio::test]
    async fn refused_handshake() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut server = Framed::new(server_io, FrameCodec::default());
        server
            .send(Envelope::goodbye("connection_limit", "too many"))
            .await
            .unwrap();

        let err = SyncClient::handshake(client_io, SyncClientConfig::default(), Replica::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::ConnectionLimit { .. }));
    }
}
