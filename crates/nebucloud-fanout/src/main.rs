//! `nebucloud-fanout` command-line entry point.
//!
//! - `serve` runs the proxy, fed by newline-delimited JSON batches
//! - `watch` connects as a downstream client and prints what it receives

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nebucloud_fanout::prelude::*;
use nebucloud_fanout::server::ConnectionLimits;
use nebucloud_fanout::upstream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Fan-out caching proxy.
#[derive(Parser, Debug)]
#[command(name = "nebucloud-fanout", version, about, long_about = None)]
struct Cli {
    /// Log filter, used when RUST_LOG is not set.
    #[arg(long, global = true, env = "FANOUT_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy.
    Serve(ServeArgs),
    /// Connect to a proxy and print snapshots, deltas and status changes.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "FANOUT_LISTEN", default_value = "0.0.0.0:5473")]
    listen: SocketAddr,

    /// Upstream JSON-lines input; `-` reads standard input.
    #[arg(long, env = "FANOUT_INPUT", default_value = "-")]
    input: PathBuf,

    /// Publish a breadcrumb once this many updates are buffered.
    #[arg(long, env = "FANOUT_MAX_BATCH_SIZE", default_value_t = 1000)]
    max_batch_size: usize,

    /// Publish a breadcrumb once the oldest buffered update is this old.
    #[arg(long, env = "FANOUT_MAX_BATCH_DELAY_MS", default_value_t = 100)]
    max_batch_delay_ms: u64,

    /// Cut a full snapshot at least every this many breadcrumbs.
    #[arg(long, env = "FANOUT_FULL_SNAPSHOT_INTERVAL", default_value_t = 256)]
    full_snapshot_interval: u64,

    /// Disconnect sessions more than this many breadcrumbs behind.
    #[arg(long, env = "FANOUT_MAX_LAG", default_value_t = 1000)]
    max_lag: u64,

    /// Seconds allowed for a client's hello.
    #[arg(long, env = "FANOUT_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    handshake_timeout_secs: u64,

    /// Seconds between keepalive pings.
    #[arg(long, env = "FANOUT_PING_INTERVAL_SECS", default_value_t = 30)]
    ping_interval_secs: u64,

    /// Seconds a ping may go unanswered.
    #[arg(long, env = "FANOUT_PONG_TIMEOUT_SECS", default_value_t = 10)]
    pong_timeout_secs: u64,

    /// Seconds allowed to write one breadcrumb.
    #[arg(long, env = "FANOUT_WRITE_TIMEOUT_SECS", default_value_t = 30)]
    write_timeout_secs: u64,

    /// Maximum frame size in bytes.
    #[arg(long, env = "FANOUT_MAX_FRAME_SIZE", default_value_t = 4 * 1024 * 1024)]
    max_frame_size: usize,

    /// Largest accepted key plus value in bytes; must fit in one frame.
    #[arg(long, env = "FANOUT_MAX_ENTRY_SIZE", default_value_t = 1024 * 1024)]
    max_entry_size: usize,

    /// Maximum entries per batch frame.
    #[arg(long, env = "FANOUT_MAX_UPDATES_PER_FRAME", default_value_t = 1000)]
    max_updates_per_frame: usize,

    /// Maximum concurrent connections.
    #[arg(long, env = "FANOUT_MAX_CONNECTIONS", default_value_t = 10_000)]
    max_connections: u64,

    /// Maximum concurrent connections from one IP address.
    #[arg(long, env = "FANOUT_MAX_PER_IP", default_value_t = 100)]
    max_per_ip: u64,

    /// Seconds shutdown waits for sessions to finish.
    #[arg(long, env = "FANOUT_GRACE_PERIOD_SECS", default_value_t = 30)]
    grace_period_secs: u64,

    /// Publish metrics through the `metrics` facade.
    #[arg(long, env = "FANOUT_METRICS")]
    metrics: bool,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Proxy address.
    #[arg(long, env = "FANOUT_SERVER", default_value = "127.0.0.1:5473")]
    server: SocketAddr,

    /// Name reported to the proxy.
    #[arg(long, default_value = "fanout-watch")]
    name: String,

    /// Print every key and value instead of counts.
    #[arg(long)]
    values: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("{}", nebucloud_fanout::version::version_string());

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Watch(args) => watch(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let cache_config = CacheConfig::default()
        .with_max_batch_size(args.max_batch_size)
        .with_max_batch_delay(Duration::from_millis(args.max_batch_delay_ms))
        .with_full_snapshot_interval(args.full_snapshot_interval)
        .with_max_entry_size(args.max_entry_size);
    let cache = Arc::new(FanoutCache::try_new(cache_config)?);

    let mut builder = FanoutServer::builder()
        .cache(Arc::clone(&cache))
        .listen_addr(args.listen)
        .handshake_timeout(Duration::from_secs(args.handshake_timeout_secs))
        .ping_interval(Duration::from_secs(args.ping_interval_secs))
        .pong_timeout(Duration::from_secs(args.pong_timeout_secs))
        .write_timeout(Duration::from_secs(args.write_timeout_secs))
        .max_lag(args.max_lag)
        .max_frame_size(args.max_frame_size)
        .max_updates_per_frame(args.max_updates_per_frame)
        .connection_limits(ConnectionLimits::new(args.max_connections, args.max_per_ip))
        .grace_period(Duration::from_secs(args.grace_period_secs));
    if args.metrics {
        builder = builder.enable_metrics();
    }
    let server = builder.build()?;

    let flusher = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.run_flusher().await }
    });

    let signal = server.shutdown_controller().shutdown_signal();
    let input = args.input.clone();
    let upstream = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move {
            let summary = if input.as_os_str() == "-" {
                upstream::pump(&mut JsonLinesSource::stdin(), &cache, signal).await?
            } else {
                let mut source = JsonLinesSource::open(&input).await?;
                upstream::pump(&mut source, &cache, signal).await?
            };
            Ok::<_, FanoutError>(summary)
        }
    });

    server.serve().await?;

    cache.close();
    if let Err(err) = flusher.await {
        warn!(error = %err, "batch flusher task failed");
    }
    match upstream.await {
        Ok(Ok(summary)) => info!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            "upstream finished"
        ),
        Ok(Err(err)) => warn!(error = %err, "upstream failed"),
        Err(err) => warn!(error = %err, "upstream task failed"),
    }
    Ok(())
}

async fn watch(args: WatchArgs) -> Result<()> {
    let mut client = SyncClient::connect(args.server, SyncClientConfig::new(args.name))
        .await
        .with_context(|| format!("connecting to {}", args.server))?;
    info!(
        server = %args.server,
        version = client.version(),
        "watching"
    );

    while let Some(event) = client.next_event().await? {
        match event {
            ClientEvent::Snapshot { sequence, entries } => {
                println!("snapshot seq={sequence} keys={entries}");
                if args.values {
                    for (key, value) in client.replica().iter() {
                        println!("  {key} = {}", String::from_utf8_lossy(value));
                    }
                }
            }
            ClientEvent::Delta { sequence, updates } => {
                println!("delta seq={sequence} changes={}", updates.len());
                if args.values {
                    for update in &updates {
                        match &update.value {
                            Some(value) => {
                                println!("  {} = {}", update.key, String::from_utf8_lossy(value))
                            }
                            None => println!("  {} deleted", update.key),
                        }
                    }
                }
            }
            ClientEvent::SyncStatus { status, sequence } => {
                println!("status {status} from seq={sequence}");
            }
            ClientEvent::Closed { reason, message } => {
                println!("closed by server: {reason} {message}");
            }
        }
    }
    Ok(())
}
