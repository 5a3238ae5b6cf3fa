//! Wire protocol between a session and its remote peer.
//!
//! Every frame is a big-endian `u32` length followed by one protobuf-encoded
//! [`Envelope`]. A session exchanges, in order:
//!
//! 1. `ClientHello` from the peer, answered by `ServerHello`
//! 2. one snapshot (`KvBatch` with kind `Snapshot`) unless the peer resumed
//! 3. `KvBatch` deltas, one logical batch per breadcrumb, interleaved with
//!    `Ping`/`Pong` keepalives and a `SyncStatusUpdate` whenever the upstream
//!    status changes
//! 4. `Goodbye` from either side, or a closed transport
//!
//! Large batches are split into several frames; every frame but the last of
//! a batch has `more = true`.

use bytes::{Bytes, BytesMut};
use fanout_core::{FanoutError, Key, Sequence, SyncStatus, Update};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Newest protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest protocol version this build still accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// First protocol version that supports `ClientHello.resume_from`. Older
/// peers always receive a snapshot.
pub const RESUME_MIN_VERSION: u32 = 2;

/// Default upper bound for one frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound for everything in a batch frame except its entries: the
/// envelope tag and length, sequence, kind and `more`.
pub const BATCH_OVERHEAD: usize = 32;

/// Upper bound for the protobuf framing of one entry beyond its key and
/// value bytes.
pub const ENTRY_OVERHEAD: usize = 24;

/// Largest key plus value that is guaranteed to fit in a frame of
/// `max_frame_size` bytes.
pub const fn max_entry_size(max_frame_size: usize) -> usize {
    max_frame_size.saturating_sub(BATCH_OVERHEAD + ENTRY_OVERHEAD)
}

/// Top-level message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// The message carried by this frame.
    #[prost(oneof = "envelope::Body", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub body: Option<envelope::Body>,
}

/// Nested types for [`Envelope`].
pub mod envelope {
    /// The message carried by an [`Envelope`](super::Envelope).
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// Peer handshake.
        #[prost(message, tag = "1")]
        ClientHello(super::ClientHello),
        /// Server handshake reply.
        #[prost(message, tag = "2")]
        ServerHello(super::ServerHello),
        /// Upstream sync status changed.
        #[prost(message, tag = "3")]
        SyncStatus(super::SyncStatusUpdate),
        /// Snapshot or delta entries.
        #[prost(message, tag = "4")]
        Batch(super::KvBatch),
        /// Keepalive probe.
        #[prost(message, tag = "5")]
        Ping(super::Ping),
        /// Keepalive reply.
        #[prost(message, tag = "6")]
        Pong(super::Pong),
        /// Orderly close.
        #[prost(message, tag = "7")]
        Goodbye(super::Goodbye),
    }
}

/// First message sent by the peer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientHello {
    /// Highest protocol version the peer speaks.
    #[prost(uint32, tag = "1")]
    pub max_version: u32,
    /// Lowest protocol version the peer speaks.
    #[prost(uint32, tag = "2")]
    pub min_version: u32,
    /// Free-form client name, for logs.
    #[prost(string, tag = "3")]
    pub client_name: String,
    /// Free-form client version, for logs.
    #[prost(string, tag = "4")]
    pub client_version: String,
    /// Last sequence the peer fully applied, if it wants to resume.
    #[prost(uint64, optional, tag = "5")]
    pub resume_from: Option<u64>,
    /// Cache epoch `resume_from` belongs to, as last sent in
    /// [`ServerHello::epoch`].
    #[prost(uint64, optional, tag = "6")]
    pub resume_epoch: Option<u64>,
}

/// Server reply to [`ClientHello`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerHello {
    /// Negotiated protocol version.
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Whether the session resumes after `resume_from` instead of sending a
    /// snapshot.
    #[prost(bool, tag = "2")]
    pub resumed: bool,
    /// Server software version.
    #[prost(string, tag = "3")]
    pub server_version: String,
    /// Latest published sequence at handshake time, zero if none.
    #[prost(uint64, tag = "4")]
    pub latest_sequence: u64,
    /// Identity of the server's breadcrumb chain. Sequences restart with
    /// every cache, so a resume is only honoured within one epoch.
    #[prost(uint64, tag = "5")]
    pub epoch: u64,
}

/// Upstream sync status as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireSyncStatus {
    /// Initial load in progress.
    Resyncing = 0,
    /// Complete, consistent view.
    InSync = 1,
}

/// Sync status change notification.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncStatusUpdate {
    /// The new status.
    #[prost(enumeration = "WireSyncStatus", tag = "1")]
    pub status: i32,
    /// Breadcrumb at which the status took effect.
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
}

/// Kind of a [`KvBatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum BatchKind {
    /// Complete key/value set; replaces the peer's replica.
    Snapshot = 0,
    /// Changes since the previous batch.
    Delta = 1,
}

/// Entries of one breadcrumb, or one chunk of them.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KvBatch {
    /// Sequence of the breadcrumb.
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    /// Snapshot or delta.
    #[prost(enumeration = "BatchKind", tag = "2")]
    pub kind: i32,
    /// Upserts and tombstones, in key order.
    #[prost(message, repeated, tag = "3")]
    pub updates: Vec<KvUpdate>,
    /// More chunks of the same breadcrumb follow.
    #[prost(bool, tag = "4")]
    pub more: bool,
}

/// One entry; a missing value is a tombstone.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KvUpdate {
    /// Key.
    #[prost(string, tag = "1")]
    pub key: String,
    /// New value, absent for deletions.
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub value: Option<Bytes>,
}

/// Keepalive probe.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    /// Echoed back in the matching [`Pong`].
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

/// Keepalive reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
    /// Nonce of the [`Ping`] being answered.
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

/// Orderly close, with a machine-readable reason.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Goodbye {
    /// Close reason label, e.g. `slow_consumer`.
    #[prost(string, tag = "1")]
    pub reason: String,
    /// Human-readable detail.
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Envelope {
    fn wrap(body: envelope::Body) -> Self {
        Self { body: Some(body) }
    }

    /// Wrap a [`ClientHello`].
    pub fn client_hello(hello: ClientHello) -> Self {
        Self::wrap(envelope::Body::ClientHello(hello))
    }

    /// Wrap a [`ServerHello`].
    pub fn server_hello(hello: ServerHello) -> Self {
        Self::wrap(envelope::Body::ServerHello(hello))
    }

    /// A sync status notification.
    pub fn sync_status(status: SyncStatus, sequence: Sequence) -> Self {
        Self::wrap(envelope::Body::SyncStatus(SyncStatusUpdate {
            status: WireSyncStatus::from(status) as i32,
            sequence: sequence.get(),
        }))
    }

    /// Wrap a [`KvBatch`].
    pub fn batch(batch: KvBatch) -> Self {
        Self::wrap(envelope::Body::Batch(batch))
    }

    /// A keepalive probe.
    pub fn ping(nonce: u64) -> Self {
        Self::wrap(envelope::Body::Ping(Ping { nonce }))
    }

    /// A keepalive reply.
    pub fn pong(nonce: u64) -> Self {
        Self::wrap(envelope::Body::Pong(Pong { nonce }))
    }

    /// An orderly close.
    pub fn goodbye(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::wrap(envelope::Body::Goodbye(Goodbye {
            reason: reason.into(),
            message: message.into(),
        }))
    }

    /// Message name, for logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match &self.body {
            None => "empty",
            Some(envelope::Body::ClientHello(_)) => "client_hello",
            Some(envelope::Body::ServerHello(_)) => "server_hello",
            Some(envelope::Body::SyncStatus(_)) => "sync_status",
            Some(envelope::Body::Batch(_)) => "batch",
            Some(envelope::Body::Ping(_)) => "ping",
            Some(envelope::Body::Pong(_)) => "pong",
            Some(envelope::Body::Goodbye(_)) => "goodbye",
        }
    }
}

impl From<SyncStatus> for WireSyncStatus {
    fn from(status: SyncStatus) -> Self {
        match status {
            SyncStatus::Resyncing => Self::Resyncing,
            SyncStatus::InSync => Self::InSync,
        }
    }
}

impl From<WireSyncStatus> for SyncStatus {
    fn from(status: WireSyncStatus) -> Self {
        match status {
            WireSyncStatus::Resyncing => Self::Resyncing,
            WireSyncStatus::InSync => Self::InSync,
        }
    }
}

impl SyncStatusUpdate {
    /// Decode the status field.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for unknown values.
    pub fn sync_status(&self) -> Result<SyncStatus, FanoutError> {
        WireSyncStatus::try_from(self.status)
            .map(SyncStatus::from)
            .map_err(|_| FanoutError::protocol(format!("unknown sync status {}", self.status)))
    }
}

impl KvBatch {
    /// Decode the kind field.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for unknown values.
    pub fn batch_kind(&self) -> Result<BatchKind, FanoutError> {
        BatchKind::try_from(self.kind)
            .map_err(|_| FanoutError::protocol(format!("unknown batch kind {}", self.kind)))
    }
}

impl From<&Update> for KvUpdate {
    fn from(update: &Update) -> Self {
        Self {
            key: update.key.as_str().to_owned(),
            value: update.value.clone(),
        }
    }
}

impl TryFrom<KvUpdate> for Update {
    type Error = FanoutError;

    fn try_from(update: KvUpdate) -> Result<Self, Self::Error> {
        let update = Update {
            key: Key::new(update.key),
            value: update.value,
        };
        update.validate()?;
        Ok(update)
    }
}

/// Split `updates` into `KvBatch` frames of at most `max_per_frame` entries
/// and at most `max_frame_size` encoded bytes each.
///
/// Always yields at least one frame so that every breadcrumb is visible to
/// the peer, even one that only changes the sync status. An entry larger
/// than [`max_entry_size`] gets a frame of its own, which the codec then
/// refuses.
pub fn batch_frames(
    sequence: Sequence,
    kind: BatchKind,
    updates: &[Update],
    max_per_frame: usize,
    max_frame_size: usize,
) -> Vec<Envelope> {
    let max_per_frame = max_per_frame.max(1);
    let budget = max_frame_size.saturating_sub(BATCH_OVERHEAD);

    let mut chunks: Vec<Vec<KvUpdate>> = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0;
    for update in updates {
        let entry = KvUpdate::from(update);
        let len = entry.encoded_len();
        // Field tag, length prefix, message.
        let wire = 1 + prost::length_delimiter_len(len) + len;
        if !current.is_empty() && (current.len() >= max_per_frame || current_bytes + wire > budget)
        {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += wire;
        current.push(entry);
    }
    chunks.push(current);

    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, updates)| {
            Envelope::batch(KvBatch {
                sequence: sequence.get(),
                kind: kind as i32,
                updates,
                more: i < last,
            })
        })
        .collect()
}

/// Pick the highest version both sides speak.
///
/// # Errors
///
/// Returns [`FanoutError::VersionMismatch`] if the ranges do not overlap.
pub fn negotiate_version(peer_min: u32, peer_max: u32) -> Result<u32, FanoutError> {
    // Peers that predate the min field send zero.
    let peer_min = peer_min.max(1);
    let version = peer_max.min(PROTOCOL_VERSION);
    if version < MIN_PROTOCOL_VERSION || version < peer_min {
        return Err(FanoutError::VersionMismatch {
            requested: peer_max,
            min: MIN_PROTOCOL_VERSION,
            max: PROTOCOL_VERSION,
        });
    }
    Ok(version)
}

/// Length-delimited protobuf codec for [`Envelope`]s.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec rejecting frames larger than `max_frame_size` bytes.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_size)
                .new_codec(),
            max_frame_size,
        }
    }

    /// The configured frame size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = FanoutError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, FanoutError> {
        if src.len() >= 4 {
            let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if size > self.max_frame_size {
                return Err(FanoutError::FrameTooLarge {
                    size,
                    limit: self.max_frame_size,
                });
            }
        }

        match self.inner.decode(src)? {
            Some(frame) => Envelope::decode(frame.freeze())
                .map(Some)
                .map_err(|err| FanoutError::protocol(format!("malformed frame: {err}"))),
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = FanoutError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), FanoutError> {
        let size = item.encoded_len();
        if size > self.max_frame_size {
            return Err(FanoutError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        self.inner.encode(Bytes::from(item.encode_to_vec()), dst)?;
        Ok(())
    }
}
