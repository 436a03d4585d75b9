//! Strictly-ordered streaming download
//!
//! Parts are still fetched concurrently, but results pass through the
//! sliding window so bytes reach the sequential sink in increasing offset
//! order no matter how the fetches complete. The cost is bounded
//! head-of-line blocking: a slow early part delays flushing of later parts
//! that already finished.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::client::GetObjectInput;
use crate::download::{is_range_not_satisfiable, DownloadError, Downloader, PartRange, Total};
use crate::error::TransferError;
use crate::sync::window::SlidingWindow;

impl Downloader {
    /// Download an object into a sequential sink, returning the number of
    /// bytes written.
    ///
    /// Same discovery and termination rules as [`Downloader::download`]: an
    /// explicit `input.range` issues exactly one request, a known total
    /// plans the parts up front, and an unknown total keeps issuing ranged
    /// GETs until the store answers range-not-satisfiable.
    #[tracing::instrument(
        name = "transfer.download_stream",
        skip(self, sink, input),
        fields(bucket = %input.bucket, key = %input.key),
        err
    )]
    pub async fn download_stream<W>(
        &self,
        sink: &mut W,
        input: GetObjectInput,
    ) -> Result<u64, DownloadError>
    where
        W: AsyncWrite + Unpin,
    {
        let part_size = self.effective_part_size();
        let fetcher = self.part_fetcher(&input);
        let mut written: u64 = 0;

        if let Some(range) = input.range.clone() {
            let mut buf = BytesMut::new();
            fetcher
                .fetch_into(&PartRange::Explicit(range), &mut buf)
                .await
                .map_err(|e| DownloadError::new(0, e))?;
            sink.write_all(&buf)
                .await
                .map_err(|e| DownloadError::new(0, TransferError::Io(e)))?;
            return Ok(buf.len() as u64);
        }

        let mut window = self.spawn_part_window(fetcher, part_size);
        loop {
            match window.recv().await {
                Ok(Some(part)) => {
                    sink.write_all(&part)
                        .await
                        .map_err(|e| DownloadError::new(written, TransferError::Io(e)))?;
                    written += part.len() as u64;
                }
                Ok(None) => return Ok(written),
                Err(err) => return Err(DownloadError::new(written, err)),
            }
        }
    }

    /// Window of concurrent part fetches emitting fully-drained parts in
    /// sequence order. Shared by `download_stream` and `ObjectReader`.
    pub(crate) fn spawn_part_window(
        &self,
        fetcher: std::sync::Arc<super::PartFetcher>,
        part_size: u64,
    ) -> SlidingWindow<Bytes> {
        let concurrency = self.effective_concurrency();
        SlidingWindow::spawn(concurrency, move |seq| {
            let fetcher = std::sync::Arc::clone(&fetcher);
            async move {
                let start = seq * part_size;
                // Past the reported end of the object: close the window
                // without another request.
                if let Total::Known(total) = fetcher.total() {
                    if start >= total {
                        return Ok(None);
                    }
                }

                let mut buf = BytesMut::with_capacity(part_size as usize);
                match fetcher.fetch_into(&PartRange::offset(start, part_size), &mut buf).await {
                    Ok(()) => Ok(Some(buf.freeze())),
                    // The store told us we ran off the end; that is the EOF
                    // signal for unknown-length objects.
                    Err(err) if is_range_not_satisfiable(&err) => Ok(None),
                    Err(err) => Err(err),
                }
            }
        })
    }
}
