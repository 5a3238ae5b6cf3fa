//! Load tests for the fan-out cache and server.
//!
//! These tests verify the system under high load:
//! - 10,000 concurrent single-key updates are batched
//! - Hundreds of subscribers converge on the same state
//! - Breadcrumbs are reclaimed once subscribers leave
//!
//! Run with: `cargo test --package integration-tests load_tests -- --nocapture`

use std::sync::Arc;
use std::time::{Duration, Instant};

use nebucloud_fanout::prelude::*;
use nebucloud_fanout::server::ConnectionLimits;
use tokio::net::TcpListener;
use tokio::sync::Barrier;
use tokio::time::timeout;

/// 10,000 single-key updates from concurrent writers yield far fewer
/// breadcrumbs than updates.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_10000_updates_are_batched() {
    let cache = Arc::new(FanoutCache::new(
        CacheConfig::default()
            .with_max_batch_size(100)
            .with_max_batch_delay(Duration::from_millis(50)),
    ));
    let flusher = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.run_flusher().await }
    });

    let writers = 8;
    let per_writer = 10_000 / writers;
    let barrier = Arc::new(Barrier::new(writers));
    let start = Instant::now();

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                for i in 0..per_writer {
                    cache
                        .ingest(vec![Update::upsert(format!("/w{w}/k{i}"), "v")], None)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    cache.flush();
    let elapsed = start.elapsed();

    let stats = cache.stats();
    println!(
        "Ingested {} updates into {} breadcrumbs in {:?} (ratio {:.1})",
        stats.updates_ingested(),
        stats.breadcrumbs_published(),
        elapsed,
        stats.batching_ratio()
    );

    assert_eq!(cache.len(), 10_000);
    assert_eq!(stats.updates_ingested(), 10_000);
    // Size-triggered publications account for at most 100; the rest come
    // from the delay and the final flush.
    let delay_bound = (elapsed.as_millis() / 50) as u64 + 2;
    assert!(stats.breadcrumbs_published() <= 100 + delay_bound);
    assert!(stats.breadcrumbs_published() < 1_000);

    cache.close();
    flusher.await.unwrap();
}

/// Hundreds of subscribers over TCP all converge on identical replicas.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_subscribers_converge() {
    let subscribers = 200;
    let cache = Arc::new(FanoutCache::new(
        CacheConfig::unbatched().with_full_snapshot_interval(16),
    ));
    cache
        .ingest(vec![Update::upsert("/seed", "0")], Some(SyncStatus::InSync))
        .unwrap();

    let server = Arc::new(
        FanoutServer::builder()
            .cache(Arc::clone(&cache))
            .connection_limits(ConnectionLimits::new(1_000, 1_000))
            .build()
            .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run(listener).await }
    });

    let mut clients = Vec::with_capacity(subscribers);
    for i in 0..subscribers {
        let config = SyncClientConfig::new(format!("subscriber-{i}"));
        let client = SyncClient::connect(addr, config).await.unwrap();
        clients.push(client);
    }

    let start = Instant::now();
    for round in 0..100u32 {
        let updates = (0..10)
            .map(|k| Update::upsert(format!("/k{k}"), format!("{round}")))
            .collect();
        cache.ingest(updates, None).unwrap();
    }
    let target = cache.latest_sequence().unwrap();

    let readers: Vec<_> = clients
        .into_iter()
        .map(|mut client| {
            tokio::spawn(async move {
                client.wait_for_sequence(target).await.unwrap();
                client.close().await.unwrap()
            })
        })
        .collect();

    let expected = cache.snapshot();
    for reader in readers {
        let replica = timeout(Duration::from_secs(30), reader)
            .await
            .expect("subscriber did not converge")
            .unwrap();
        assert_eq!(replica.last_sequence(), Some(target));
        assert_eq!(replica.len(), expected.len());
        assert!(replica.iter().eq(expected.iter()));
    }
    println!(
        "{} subscribers converged on sequence {} in {:?}",
        subscribers,
        target,
        start.elapsed()
    );

    // Once every session has gone, only the latest Full onwards is alive.
    timeout(Duration::from_secs(10), async {
        while !server.sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions did not end");
    assert!(cache.stats().live_breadcrumbs() <= 16);

    server.shutdown().await;
    accept.await.unwrap().unwrap();
}

/// Readers parked on the tail are all woken by one publication.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_1000_parked_readers_wake() {
    let cache = Arc::new(FanoutCache::new(CacheConfig::unbatched()));
    cache.ingest(vec![Update::upsert("/a", "1")], None).unwrap();
    let tail = cache.tail().unwrap();

    let readers = 1000;
    let barrier = Arc::new(Barrier::new(readers + 1));
    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let tail = Arc::clone(&tail);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
                cache.next(&tail, deadline).await.map(|c| c.sequence())
            })
        })
        .collect();

    barrier.wait().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let start = Instant::now();
    cache.ingest(vec![Update::upsert("/a", "2")], None).unwrap();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Some(Sequence::new(2)));
    }
    println!("Woke {} readers in {:?}", readers, start.elapsed());
}
