//! Upstream adapters.
//!
//! An [`UpstreamSource`] turns whatever the upstream store emits into
//! [`UpstreamBatch`]es; [`pump`] feeds them into a [`FanoutCache`]. The
//! bundled [`JsonLinesSource`] reads one JSON batch per line, which is
//! enough to drive the proxy from a file, a pipe or a test.
//!
//! ```text
//! {"updates": [{"key": "/a", "value": "1"}, {"key": "/b"}], "status": "in_sync"}
//! ```
//!
//! An update without `value` (or with `"value": null`) is a deletion.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use fanout_cache::FanoutCache;
use fanout_core::{FanoutError, FanoutResult, Key, SyncStatus, Update};
use fanout_server::ShutdownSignal;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info, warn};

/// One batch as delivered by the upstream store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamBatch {
    /// Updates applied together.
    pub updates: Vec<Update>,
    /// New sync status, if it changed with this batch.
    pub status: Option<SyncStatus>,
}

/// Source of upstream batches.
#[async_trait]
pub trait UpstreamSource: Send {
    /// Next batch, or `None` once the upstream has nothing more to send.
    async fn next_batch(&mut self) -> FanoutResult<Option<UpstreamBatch>>;
}

/// Totals reported by [`pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    /// Batches accepted by the cache.
    pub accepted: u64,
    /// Batches the cache rejected as malformed.
    pub rejected: u64,
}

/// Feed `source` into `cache` until it ends or `shutdown` fires.
///
/// Malformed batches are logged and skipped; the cache has already left its
/// state untouched for them. Whatever is still buffered when the source ends
/// is flushed.
///
/// # Errors
///
/// Returns the source's error, or [`FanoutError::Shutdown`] if the cache was
/// closed underneath the pump.
pub async fn pump<S>(
    source: &mut S,
    cache: &FanoutCache,
    shutdown: ShutdownSignal,
) -> FanoutResult<PumpSummary>
where
    S: UpstreamSource + ?Sized,
{
    let mut summary = PumpSummary::default();
    let stop = shutdown.wait();
    tokio::pin!(stop);

    loop {
        let batch = tokio::select! {
            biased;
            _ = &mut stop => {
                debug!("upstream pump stopped by shutdown");
                break;
            }
            batch = source.next_batch() => batch?,
        };
        let Some(batch) = batch else {
            info!(
                accepted = summary.accepted,
                rejected = summary.rejected,
                "upstream source ended"
            );
            break;
        };

        match cache.ingest(batch.updates, batch.status) {
            Ok(_) => summary.accepted += 1,
            Err(err @ FanoutError::InvalidUpdate { .. }) => {
                warn!(error = %err, "skipping malformed upstream batch");
                summary.rejected += 1;
            }
            Err(err) => return Err(err),
        }
    }

    cache.flush();
    Ok(summary)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonBatch {
    #[serde(default)]
    updates: Vec<JsonUpdate>,
    #[serde(default)]
    status: Option<SyncStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonUpdate {
    key: Key,
    #[serde(default)]
    value: Option<String>,
}

impl From<JsonBatch> for UpstreamBatch {
    fn from(batch: JsonBatch) -> Self {
        Self {
            updates: batch
                .updates
                .into_iter()
                .map(|u| Update {
                    key: u.key,
                    value: u.value.map(Bytes::from),
                })
                .collect(),
            status: batch.status,
        }
    }
}

/// Newline-delimited JSON batches from any async reader.
#[derive(Debug)]
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line: u64,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    /// Read batches from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

impl JsonLinesSource<BufReader<tokio::io::Stdin>> {
    /// Read batches from standard input.
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl JsonLinesSource<BufReader<tokio::fs::File>> {
    /// Read batches from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> FanoutResult<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(BufReader::new(file)))
    }
}

#[async_trait]
impl<R> UpstreamSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_batch(&mut self) -> FanoutResult<Option<UpstreamBatch>> {
        while let Some(text) = self.lines.next_line().await? {
            self.line += 1;
            let text = text.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let batch: JsonBatch = serde_json::from_str(text).map_err(|err| {
                FanoutError::protocol(format!("upstream line {}: {err}", self.line))
            })?;
            return Ok(Some(batch.into()));
        }
        Ok(None)
    }
}
