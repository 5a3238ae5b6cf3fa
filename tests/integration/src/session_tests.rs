//! End-to-end session tests over real sockets and in-memory transports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fanout_server::protocol::{
    envelope::Body, ClientHello, Envelope, FrameCodec, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use fanout_server::Replica;
use futures::{SinkExt, StreamExt};
use nebucloud_fanout::prelude::*;
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(10);

struct Running {
    cache: Arc<FanoutCache>,
    server: Arc<FanoutServer>,
    addr: SocketAddr,
    _task: JoinHandle<FanoutResult<()>>,
}

async fn start(
    cache: FanoutCache,
    configure: impl FnOnce(FanoutServerBuilder) -> FanoutServerBuilder,
) -> Running {
    let cache = Arc::new(cache);
    let server = Arc::new(
        configure(FanoutServer::builder().cache(Arc::clone(&cache)))
            .build()
            .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run(listener).await }
    });
    Running {
        cache,
        server,
        addr,
        _task: task,
    }
}

fn client_config(name: &str) -> SyncClientConfig {
    SyncClientConfig::new(name)
}

/// A peer that speaks the protocol by hand, to look at raw frames.
async fn raw_peer(addr: SocketAddr) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::default());
    framed
        .send(Envelope::client_hello(ClientHello {
            max_version: PROTOCOL_VERSION,
            min_version: MIN_PROTOCOL_VERSION,
            client_name: "raw".into(),
            client_version: "0".into(),
            resume_from: None,
            resume_epoch: None,
        }))
        .await
        .unwrap();
    let hello = timeout(WAIT, framed.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(hello.body, Some(Body::ServerHello(_))));
    framed
}

/// Collect encoded frames until the batch for `last` is complete.
async fn frames_until(peer: &mut Framed<TcpStream, FrameCodec>, last: u64) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        let frame = timeout(WAIT, peer.next()).await.unwrap().unwrap().unwrap();
        let done = matches!(&frame.body, Some(Body::Batch(b)) if b.sequence == last && !b.more);
        frames.push(frame.encode_to_vec());
        if done {
            return frames;
        }
    }
}

#[tokio::test]
async fn sessions_from_same_start_see_identical_bytes() {
    let running = start(FanoutCache::new(CacheConfig::unbatched()), |b| b).await;
    let mut a = raw_peer(running.addr).await;
    let mut b = raw_peer(running.addr).await;

    running
        .cache
        .ingest(vec![Update::upsert("k1", "v1")], None)
        .unwrap();
    for i in 0..20 {
        let updates = vec![
            Update::upsert(format!("k{}", i % 7), format!("v{i}")),
            Update::delete(format!("k{}", (i + 3) % 7)),
        ];
        let status = (i == 10).then_some(SyncStatus::InSync);
        running.cache.ingest(updates, status).unwrap();
    }
    let last = running.cache.latest_sequence().unwrap().get();

    let from_a = frames_until(&mut a, last).await;
    let from_b = frames_until(&mut b, last).await;
    assert!(from_a.len() > 2);
    assert_eq!(from_a, from_b);
}

#[tokio::test]
async fn fresh_session_gets_snapshot_before_deltas() {
    let running = start(FanoutCache::new(CacheConfig::unbatched()), |b| b).await;
    running
        .cache
        .ingest(vec![Update::upsert("a", "1")], None)
        .unwrap();
    running
        .cache
        .ingest(vec![Update::upsert("b", "2")], Some(SyncStatus::InSync))
        .unwrap();

    let mut client = SyncClient::connect(running.addr, client_config("fresh"))
        .await
        .unwrap();
    let first = timeout(WAIT, client.next_event()).await.unwrap().unwrap();
    assert!(matches!(first, Some(ClientEvent::Snapshot { entries: 2, .. })));

    running
        .cache
        .ingest(vec![Update::delete("a")], None)
        .unwrap();
    let target = running.cache.latest_sequence().unwrap();
    timeout(WAIT, client.wait_for_sequence(target))
        .await
        .unwrap()
        .unwrap();
    assert!(client.replica().get("a").is_none());
    assert_eq!(client.replica().sync_status(), Some(SyncStatus::InSync));
}

#[tokio::test]
async fn stalled_session_is_dropped_and_fresh_session_catches_up() {
    let running = start(FanoutCache::new(CacheConfig::unbatched()), |b| {
        b.max_lag(2).write_timeout(Duration::from_secs(30))
    })
    .await;
    let big = Bytes::from(vec![b'x'; 16 * 1024]);
    running
        .cache
        .ingest(vec![Update::upsert("k0", big.clone())], None)
        .unwrap();

    // A peer on a tiny in-memory pipe that never reads past the handshake.
    let (server_io, client_io) = tokio::io::duplex(1024);
    let session = running.server.handle_connection(server_io, None).unwrap();
    let mut stalled = Framed::new(client_io, FrameCodec::default());
    stalled
        .send(Envelope::client_hello(ClientHello {
            max_version: PROTOCOL_VERSION,
            min_version: MIN_PROTOCOL_VERSION,
            client_name: "stalled".into(),
            client_version: "0".into(),
            resume_from: None,
            resume_epoch: None,
        }))
        .await
        .unwrap();
    let hello = timeout(WAIT, stalled.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(hello.body, Some(Body::ServerHello(_))));

    for i in 1..=3 {
        running
            .cache
            .ingest(vec![Update::upsert(format!("k{i}"), big.clone())], None)
            .unwrap();
    }

    let outcome = timeout(WAIT, session).await.unwrap().unwrap();
    assert_eq!(outcome.reason, CloseReason::SlowConsumer);
    assert!(matches!(
        outcome.error,
        Some(FanoutError::SlowConsumer { lag: 3, limit: 2 })
    ));
    assert!(running.server.sessions().is_empty());

    let mut fresh = SyncClient::connect(running.addr, client_config("fresh"))
        .await
        .unwrap();
    timeout(WAIT, fresh.wait_for_sequence(Sequence::new(4)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.replica().len(), 4);
    assert_eq!(fresh.replica().get("k3"), Some(&big));
}

#[tokio::test]
async fn reconnect_resumes_without_snapshot() {
    let running = start(FanoutCache::new(CacheConfig::unbatched()), |b| b).await;
    for i in 0..3 {
        running
            .cache
            .ingest(vec![Update::upsert(format!("k{i}"), "v")], None)
            .unwrap();
    }

    let mut client = SyncClient::connect(running.addr, client_config("resumer"))
        .await
        .unwrap();
    timeout(WAIT, client.wait_for_sequence(Sequence::new(3)))
        .await
        .unwrap()
        .unwrap();
    let replica: Replica = client.close().await.unwrap();

    running
        .cache
        .ingest(vec![Update::delete("k0"), Update::upsert("k3", "v")], None)
        .unwrap();

    let mut resumed =
        SyncClient::connect_with_replica(running.addr, client_config("resumer"), replica)
            .await
            .unwrap();
    assert!(resumed.resumed());
    let event = timeout(WAIT, resumed.next_event()).await.unwrap().unwrap();
    assert!(matches!(event, Some(ClientEvent::Delta { sequence, .. }) if sequence == Sequence::new(4)));

    let fresh = {
        let mut fresh = SyncClient::connect(running.addr, client_config("fresh"))
            .await
            .unwrap();
        timeout(WAIT, fresh.wait_for_sequence(Sequence::new(4)))
            .await
            .unwrap()
            .unwrap();
        fresh.into_replica()
    };
    let resumed = resumed.into_replica();
    assert_eq!(
        resumed.iter().collect::<Vec<_>>(),
        fresh.iter().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn replica_from_restarted_server_is_replaced() {
    let before = start(FanoutCache::new(CacheConfig::unbatched()), |b| b).await;
    for i in 0..3 {
        before
            .cache
            .ingest(vec![Update::upsert(format!("old{i}"), "v")], None)
            .unwrap();
    }
    let mut client = SyncClient::connect(before.addr, client_config("restart"))
        .await
        .unwrap();
    timeout(WAIT, client.wait_for_sequence(Sequence::new(3)))
        .await
        .unwrap()
        .unwrap();
    let replica = client.close().await.unwrap();
    assert_eq!(replica.epoch(), Some(before.cache.epoch()));
    before.server.shutdown().await;

    // Same sequence numbers, different data.
    let after = start(FanoutCache::new(CacheConfig::unbatched()), |b| b).await;
    for i in 0..4 {
        after
            .cache
            .ingest(vec![Update::upsert(format!("new{i}"), "v")], None)
            .unwrap();
    }

    let mut reconnected =
        SyncClient::connect_with_replica(after.addr, client_config("restart"), replica)
            .await
            .unwrap();
    assert!(!reconnected.resumed());
    let event = timeout(WAIT, reconnected.next_event()).await.unwrap().unwrap();
    assert!(matches!(event, Some(ClientEvent::Snapshot { entries: 4, .. })));

    let replica = reconnected.into_replica();
    assert!(replica.get("old0").is_none());
    assert_eq!(
        replica.iter().collect::<Vec<_>>(),
        after.cache.snapshot().iter().collect::<Vec<_>>()
    );
    assert_eq!(replica.epoch(), Some(after.cache.epoch()));
}

#[tokio::test]
async fn snapshot_larger_than_default_frame_is_delivered() {
    let running = start(FanoutCache::new(CacheConfig::unbatched()), |b| b).await;
    let value = Bytes::from(vec![b'v'; 5000]);
    let updates = (0..1000)
        .map(|i| Update::upsert(format!("/k{i:04}"), value.clone()))
        .collect();
    running.cache.ingest(updates, None).unwrap();

    let mut client = SyncClient::connect(running.addr, client_config("large"))
        .await
        .unwrap();
    let event = timeout(WAIT, client.next_event()).await.unwrap().unwrap();
    assert!(matches!(
        event,
        Some(ClientEvent::Snapshot { entries: 1000, sequence }) if sequence == Sequence::FIRST
    ));
    assert_eq!(client.replica().get("/k0999"), Some(&value));
}

#[tokio::test]
async fn fresh_client_catches_up_from_trailing_full() {
    let running = start(
        FanoutCache::new(CacheConfig::unbatched().with_full_snapshot_interval(64)),
        |b| b.max_lag(5),
    )
    .await;
    for i in 0..10 {
        running
            .cache
            .ingest(vec![Update::upsert(format!("k{i}"), "v")], None)
            .unwrap();
    }

    let mut client = SyncClient::connect(running.addr, client_config("late"))
        .await
        .unwrap();
    timeout(WAIT, client.wait_for_sequence(Sequence::new(10)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.replica().len(), 10);
    assert_eq!(running.server.sessions().len(), 1);
}

#[tokio::test]
async fn version_mismatch_gets_goodbye() {
    let running = start(FanoutCache::default(), |b| b).await;
    let stream = TcpStream::connect(running.addr).await.unwrap();
    let mut peer = Framed::new(stream, FrameCodec::default());
    peer.send(Envelope::client_hello(ClientHello {
        max_version: PROTOCOL_VERSION + 5,
        min_version: PROTOCOL_VERSION + 1,
        ..ClientHello::default()
    }))
    .await
    .unwrap();

    let frame = timeout(WAIT, peer.next()).await.unwrap().unwrap().unwrap();
    match frame.body {
        Some(Body::Goodbye(goodbye)) => assert_eq!(goodbye.reason, "version_mismatch"),
        other => panic!("expected goodbye, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let running = start(FanoutCache::new(CacheConfig::unbatched()), |b| {
        b.grace_period(Duration::from_secs(5))
    })
    .await;
    running
        .cache
        .ingest(vec![Update::upsert("a", "1")], None)
        .unwrap();

    let mut clients = Vec::new();
    for i in 0..5 {
        let mut client = SyncClient::connect(running.addr, client_config(&format!("c{i}")))
            .await
            .unwrap();
        timeout(WAIT, client.wait_for_sequence(Sequence::FIRST))
            .await
            .unwrap()
            .unwrap();
        clients.push(client);
    }
    assert_eq!(running.server.sessions().len(), 5);

    assert!(running.server.shutdown().await);
    assert!(running.server.sessions().is_empty());
    // Only the cache's own references remain.
    assert_eq!(running.cache.stats().live_breadcrumbs(), 1);

    for mut client in clients {
        let reason = loop {
            match timeout(WAIT, client.next_event()).await.unwrap().unwrap() {
                Some(ClientEvent::Closed { reason, .. }) => break reason,
                Some(_) => continue,
                None => panic!("transport closed without goodbye"),
            }
        };
        assert_eq!(reason, "shutdown");
    }
}
