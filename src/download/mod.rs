//! Download engine
//!
//! Splits a GET into byte-range parts, fetches them through a bounded worker
//! pool and hands the results to the caller's sink. Two sinks are supported:
//!
//! - [`WriteAt`] (random access): parts land at their own offsets in
//!   whatever order they complete ([`Downloader::download`]).
//! - Sequential `AsyncWrite`: parts are reassembled in strict offset order
//!   through the sliding window ([`Downloader::download_stream`]), or pulled
//!   through a lazy [`ObjectReader`](crate::download::reader::ObjectReader).
//!
//! The total object size is discovered from the first response. When the
//! store cannot report it (a `Content-Range` total of `*`), parts are
//! fetched one at a time until a range-not-satisfiable response marks the
//! end of data.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mizuchi_transfer::client::{GetObjectInput, ObjectStore};
//! use mizuchi_transfer::download::Downloader;
//!
//! # async fn example(store: Arc<dyn ObjectStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = Downloader::builder(store).concurrency(8).build();
//!
//! let mut sink = Vec::new();
//! let n = downloader
//!     .download(&mut sink, GetObjectInput::new("my-bucket", "my-key"))
//!     .await?;
//! println!("downloaded {n} bytes");
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::buffer::{CapacityLease, PartBuffer, PartPool};
use crate::client::{ClientErrorKind, GetObjectInput, ObjectStore};
use crate::error::TransferError;
use crate::{DEFAULT_CONCURRENCY, DEFAULT_DOWNLOAD_PART_SIZE, DEFAULT_PART_BODY_MAX_RETRIES};

pub mod reader;
pub mod stream;

pub use reader::ObjectReader;

/// Random-access byte sink: the classic download path positions every part
/// by explicit offset, so completion order never matters.
#[async_trait]
pub trait WriteAt: Send {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;
}

/// In-memory sink; grows as needed, zero-filling any gap.
#[async_trait]
impl WriteAt for Vec<u8> {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let offset = offset as usize;
        let end = offset + data.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[offset..end].copy_from_slice(data);
        Ok(())
    }
}

/// Positional file writes. These are short synchronous writes issued from
/// the single sink task, not from the worker pool.
#[cfg(unix)]
#[async_trait]
impl WriteAt for std::fs::File {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.write_all_at(data, offset)
    }
}

/// A failed download, carrying the bytes already written to the sink. Bytes
/// already written are not rolled back.
#[derive(Debug, Error)]
#[error("download failed after {written} bytes: {source}")]
pub struct DownloadError {
    written: u64,
    source: TransferError,
}

impl DownloadError {
    fn new(written: u64, source: TransferError) -> Self {
        Self { written, source }
    }

    /// Bytes successfully written to the sink before the failure.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// The failure that terminated the download.
    pub fn cause(&self) -> &TransferError {
        &self.source
    }

    pub fn into_cause(self) -> TransferError {
        self.source
    }

    pub fn is_canceled(&self) -> bool {
        self.source.is_canceled()
    }
}

/// Builder for [`Downloader`].
#[derive(Clone)]
pub struct DownloaderBuilder {
    client: Arc<dyn ObjectStore>,
    part_size: u64,
    concurrency: usize,
    part_body_max_retries: u32,
    disable_validate_parts: bool,
    pool: Option<Arc<PartPool>>,
}

impl DownloaderBuilder {
    fn new(client: Arc<dyn ObjectStore>) -> Self {
        Self {
            client,
            part_size: DEFAULT_DOWNLOAD_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            part_body_max_retries: DEFAULT_PART_BODY_MAX_RETRIES,
            disable_validate_parts: false,
            pool: None,
        }
    }

    /// Byte size of each ranged GET. Zero selects the default (5 MiB).
    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Number of parts fetched in parallel. Zero selects the default (5).
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// How many times an interrupted part body read is retried before the
    /// download fails. Request-level failures are never retried here.
    pub fn part_body_max_retries(mut self, retries: u32) -> Self {
        self.part_body_max_retries = retries;
        self
    }

    /// Skip checking each part's `Content-Range` echo against the requested
    /// range. Validation is on by default; it catches proxies and CDNs that
    /// mishandle range requests.
    pub fn disable_validate_parts(mut self, disable: bool) -> Self {
        self.disable_validate_parts = disable;
        self
    }

    /// Share a buffer pool across transfers. The pool's buffer size must
    /// match `part_size` or a private pool is used instead; each transfer
    /// leases `concurrency + 1` additional slots for its duration, so a
    /// shared pool is typically created with a base capacity of zero.
    pub fn buffer_pool(mut self, pool: Arc<PartPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> Downloader {
        Downloader {
            client: self.client,
            part_size: self.part_size,
            concurrency: self.concurrency,
            part_body_max_retries: self.part_body_max_retries,
            disable_validate_parts: self.disable_validate_parts,
            pool: self.pool,
        }
    }
}

/// Concurrent multipart downloader. Cheap to clone; safe to use from many
/// tasks at once, each call running its own worker group.
#[derive(Clone)]
pub struct Downloader {
    client: Arc<dyn ObjectStore>,
    part_size: u64,
    concurrency: usize,
    part_body_max_retries: u32,
    disable_validate_parts: bool,
    pool: Option<Arc<PartPool>>,
}

impl Downloader {
    pub fn builder(client: Arc<dyn ObjectStore>) -> DownloaderBuilder {
        DownloaderBuilder::new(client)
    }

    /// Downloader with default settings.
    pub fn new(client: Arc<dyn ObjectStore>) -> Self {
        DownloaderBuilder::new(client).build()
    }

    pub(crate) fn effective_part_size(&self) -> u64 {
        if self.part_size == 0 {
            DEFAULT_DOWNLOAD_PART_SIZE
        } else {
            self.part_size
        }
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            self.concurrency
        }
    }

    pub(crate) fn part_fetcher(&self, input: &GetObjectInput) -> Arc<PartFetcher> {
        let mut template = input.clone();
        template.range = None;
        Arc::new(PartFetcher {
            client: Arc::clone(&self.client),
            template,
            retries: self.part_body_max_retries,
            validate: !self.disable_validate_parts,
            total: TotalTracker::default(),
        })
    }

    fn transfer_pool(&self, part_size: u64, concurrency: usize) -> (Arc<PartPool>, Option<CapacityLease>) {
        let cap = concurrency + 1;
        match &self.pool {
            Some(pool) if pool.part_size() == part_size as usize => {
                let lease = pool.lease(cap);
                (Arc::clone(pool), Some(lease))
            }
            // Wrong buffer size (or no shared pool): outstanding buffers
            // would not fit the configured parts, so use a private pool.
            _ => (PartPool::new(part_size as usize, cap), None),
        }
    }

    /// Download an object into a random-access sink, returning the number of
    /// bytes written.
    ///
    /// When `input.range` is set, exactly one request is issued for that
    /// range and part size/concurrency are ignored. Otherwise the first part
    /// doubles as size discovery; once the total is known the remaining
    /// parts fan out across the worker pool. A store that cannot report the
    /// total (`Content-Range: bytes x-y/*`) is read sequentially until it
    /// answers range-not-satisfiable, which is end of data rather than an
    /// error.
    ///
    /// Any part failure aborts the download; bytes already written stay
    /// written and are reported through [`DownloadError::bytes_written`].
    #[tracing::instrument(
        name = "transfer.download",
        skip(self, sink, input),
        fields(bucket = %input.bucket, key = %input.key),
        err
    )]
    pub async fn download<W>(&self, sink: &mut W, input: GetObjectInput) -> Result<u64, DownloadError>
    where
        W: WriteAt + ?Sized,
    {
        let part_size = self.effective_part_size();
        let concurrency = self.effective_concurrency();
        let (pool, _lease) = self.transfer_pool(part_size, concurrency);
        let fetcher = self.part_fetcher(&input);

        // An explicit range short-circuits the multipart machinery entirely.
        if let Some(range) = input.range.clone() {
            let mut buf = pool.get().await.map_err(|e| DownloadError::new(0, e))?;
            fetcher
                .fetch_into(&PartRange::Explicit(range), &mut buf)
                .await
                .map_err(|e| DownloadError::new(0, e))?;
            sink.write_at(0, &buf)
                .await
                .map_err(|e| DownloadError::new(0, TransferError::Io(e)))?;
            return Ok(buf.len() as u64);
        }

        // First part doubles as size discovery.
        let mut written: u64 = 0;
        {
            let mut buf = pool.get().await.map_err(|e| DownloadError::new(0, e))?;
            match fetcher
                .fetch_into(&PartRange::offset(0, part_size), &mut buf)
                .await
            {
                Ok(()) => {
                    sink.write_at(0, &buf)
                        .await
                        .map_err(|e| DownloadError::new(0, TransferError::Io(e)))?;
                    written += buf.len() as u64;
                }
                // Empty objects answer 416 to any ranged GET.
                Err(err) if is_range_not_satisfiable(&err) => return Ok(0),
                Err(err) => return Err(DownloadError::new(0, err)),
            }
        }

        match fetcher.total() {
            Total::Known(total) if total > part_size => {
                self.fan_out(sink, &fetcher, &pool, part_size, concurrency, total, written)
                    .await
            }
            Total::Known(_) => Ok(written),
            // Without a total there is nothing to plan parallel ranges
            // against; read forward one part at a time until 416.
            Total::Unknown | Total::Unresolved => {
                self.sequential_tail(sink, &fetcher, &pool, part_size, written)
                    .await
            }
        }
    }

    async fn fan_out<W>(
        &self,
        sink: &mut W,
        fetcher: &Arc<PartFetcher>,
        pool: &Arc<PartPool>,
        part_size: u64,
        concurrency: usize,
        total: u64,
        mut written: u64,
    ) -> Result<u64, DownloadError>
    where
        W: WriteAt + ?Sized,
    {
        let nparts = total.div_ceil(part_size);
        let next_index = Arc::new(AtomicU64::new(1));
        let first_err: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));
        let (done_tx, mut done_rx) = mpsc::channel::<(u64, PartBuffer)>(concurrency);

        let mut workers = JoinSet::new();
        let worker_count = concurrency.min((nparts - 1) as usize);
        for _ in 0..worker_count {
            let fetcher = Arc::clone(fetcher);
            let pool = Arc::clone(pool);
            let next_index = Arc::clone(&next_index);
            let first_err = Arc::clone(&first_err);
            let done_tx = done_tx.clone();

            workers.spawn(async move {
                loop {
                    if first_err.lock().is_some() {
                        break;
                    }
                    let index = next_index.fetch_add(1, Ordering::SeqCst);
                    if index >= nparts {
                        break;
                    }
                    let start = index * part_size;
                    let len = part_size.min(total - start);

                    let mut buf = match pool.get().await {
                        Ok(buf) => buf,
                        Err(err) => {
                            set_first_err(&first_err, err);
                            break;
                        }
                    };
                    match fetcher.fetch_into(&PartRange::offset(start, len), &mut buf).await {
                        Ok(()) => {
                            if done_tx.send((start, buf)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            set_first_err(&first_err, err);
                            break;
                        }
                    }
                }
            });
        }
        drop(done_tx);

        // Single sink task: parts land at their own offsets as they arrive.
        while let Some((offset, buf)) = done_rx.recv().await {
            if first_err.lock().is_some() {
                // Drain remaining completions so workers can exit; their
                // buffers go straight back to the pool.
                continue;
            }
            match sink.write_at(offset, &buf).await {
                Ok(()) => written += buf.len() as u64,
                Err(err) => set_first_err(&first_err, TransferError::Io(err)),
            }
        }
        while workers.join_next().await.is_some() {}

        let result = match first_err.lock().take() {
            Some(err) => Err(DownloadError::new(written, err)),
            None => Ok(written),
        };
        result
    }

    async fn sequential_tail<W>(
        &self,
        sink: &mut W,
        fetcher: &Arc<PartFetcher>,
        pool: &Arc<PartPool>,
        part_size: u64,
        mut written: u64,
    ) -> Result<u64, DownloadError>
    where
        W: WriteAt + ?Sized,
    {
        let mut pos = part_size;
        loop {
            let mut buf = pool
                .get()
                .await
                .map_err(|e| DownloadError::new(written, e))?;
            match fetcher
                .fetch_into(&PartRange::offset(pos, part_size), &mut buf)
                .await
            {
                Ok(()) => {
                    if buf.is_empty() {
                        break;
                    }
                    let n = buf.len() as u64;
                    sink.write_at(pos, &buf)
                        .await
                        .map_err(|e| DownloadError::new(written, TransferError::Io(e)))?;
                    written += n;
                    pos += part_size;
                }
                Err(err) if is_range_not_satisfiable(&err) => break,
                Err(err) => return Err(DownloadError::new(written, err)),
            }
        }
        Ok(written)
    }
}

fn set_first_err(slot: &Mutex<Option<TransferError>>, err: TransferError) {
    let mut guard = slot.lock();
    if guard.is_none() {
        *guard = Some(err);
    }
}

pub(crate) fn is_range_not_satisfiable(err: &TransferError) -> bool {
    matches!(
        err,
        TransferError::Client(client)
            if client.kind() == ClientErrorKind::RangeNotSatisfiable
    ) || err.status_code() == Some(416)
}

/// The byte range of one part request.
pub(crate) enum PartRange {
    Offset { start: u64, len: u64 },
    /// Caller-pinned range string, passed through untouched.
    Explicit(String),
}

impl PartRange {
    pub(crate) fn offset(start: u64, len: u64) -> Self {
        Self::Offset { start, len }
    }

    pub(crate) fn header(&self) -> String {
        match self {
            Self::Offset { start, len } => format!("bytes={}-{}", start, start + len - 1),
            Self::Explicit(range) => range.clone(),
        }
    }
}

/// Total object size as learned from responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Total {
    /// No response carried size information yet.
    Unresolved,
    /// The store reported `*`: it does not know the total.
    Unknown,
    Known(u64),
}

#[derive(Default)]
pub(crate) struct TotalTracker(Mutex<Option<Total>>);

impl TotalTracker {
    /// Record size information from a response. Only the first response to
    /// carry any wins; later responses cannot change the plan.
    fn record(&self, content_range: Option<&str>, content_length: u64) -> Result<(), TransferError> {
        let mut slot = self.0.lock();
        if matches!(*slot, Some(Total::Known(_) | Total::Unknown)) {
            return Ok(());
        }

        match content_range {
            // No Content-Range means the object came back whole; its length
            // is the total. Zero-length responses leave the size unresolved.
            None => {
                if content_length > 0 {
                    *slot = Some(Total::Known(content_length));
                }
            }
            Some(range) => {
                let (_, total) = parse_content_range(range).ok_or_else(|| {
                    TransferError::validation(format!("malformed content range {range:?}"))
                })?;
                *slot = Some(match total {
                    Some(total) => Total::Known(total),
                    None => Total::Unknown,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn total(&self) -> Total {
        self.0.lock().unwrap_or(Total::Unresolved)
    }
}

/// Shared per-transfer fetch plumbing: issues one ranged GET per part,
/// drains the body into the supplied buffer, retries interrupted body reads
/// and keeps the size tracker current.
pub(crate) struct PartFetcher {
    client: Arc<dyn ObjectStore>,
    template: GetObjectInput,
    retries: u32,
    validate: bool,
    total: TotalTracker,
}

impl PartFetcher {
    pub(crate) fn total(&self) -> Total {
        self.total.total()
    }

    pub(crate) async fn fetch_into(
        &self,
        range: &PartRange,
        buf: &mut BytesMut,
    ) -> Result<(), TransferError> {
        let mut attempt: u32 = 0;
        loop {
            match self.try_fetch(range, buf).await {
                Ok(()) => return Ok(()),
                Err(TransferError::BodyRead(err)) if attempt < self.retries => {
                    attempt += 1;
                    buf.clear();
                    tracing::warn!(
                        error = %err,
                        attempt,
                        range = %range.header(),
                        "part body download interrupted, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_fetch(&self, range: &PartRange, buf: &mut BytesMut) -> Result<(), TransferError> {
        let mut input = self.template.clone();
        input.range = Some(range.header());

        let out = self.client.get_object(input).await?;
        self.total
            .record(out.content_range.as_deref(), out.content_length)?;

        if self.validate {
            if let PartRange::Offset { start, .. } = range {
                validate_content_range(*start, out.content_range.as_deref())?;
            }
        }

        let mut body = out.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(TransferError::BodyRead)?;
            buf.extend_from_slice(&chunk);
        }
        Ok(())
    }
}

fn validate_content_range(expected_start: u64, content_range: Option<&str>) -> Result<(), TransferError> {
    let start = match content_range {
        // A whole-object response is only valid for the first part.
        None => 0,
        Some(range) => {
            parse_content_range(range)
                .ok_or_else(|| {
                    TransferError::validation(format!("malformed content range {range:?}"))
                })?
                .0
        }
    };
    if start != expected_start {
        return Err(TransferError::validation(format!(
            "invalid content range: part starts at {start}, requested {expected_start}"
        )));
    }
    Ok(())
}

/// Parse `bytes <start>-<end>/<total|*>` into `(start, total)`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    Some((start, total))
}
