//! Lazy streaming object reader
//!
//! [`ObjectReader`] is an `AsyncRead` over an object. Nothing is fetched
//! until the first read; from then on up to `concurrency` chunks are
//! prefetched ahead of the consumer, with the sliding window keeping the
//! byte order strict. A missing object surfaces as
//! `io::ErrorKind::NotFound`, end of object as EOF.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{ClientErrorKind, GetObjectInput};
use crate::download::Downloader;
use crate::error::TransferError;

impl Downloader {
    /// A lazy reader over the object. Fetching begins on the first read.
    pub fn reader(&self, input: GetObjectInput) -> ObjectReader {
        ObjectReader {
            state: ReaderState::Idle(Some((self.clone(), input))),
        }
    }
}

enum ReaderState {
    Idle(Option<(Downloader, GetObjectInput)>),
    Streaming {
        rx: mpsc::Receiver<io::Result<Bytes>>,
        current: Bytes,
        done: bool,
        driver: JoinHandle<()>,
    },
}

pub struct ObjectReader {
    state: ReaderState,
}

impl ObjectReader {
    fn start(downloader: Downloader, input: GetObjectInput) -> ReaderState {
        let part_size = downloader.effective_part_size();
        let concurrency = downloader.effective_concurrency();
        let fetcher = downloader.part_fetcher(&input);
        let (tx, rx) = mpsc::channel(concurrency);

        let driver = tokio::spawn(async move {
            let mut window = downloader.spawn_part_window(fetcher, part_size);
            loop {
                match window.recv().await {
                    Ok(Some(chunk)) => {
                        if !chunk.is_empty() && tx.send(Ok(chunk)).await.is_err() {
                            // Reader dropped; stop fetching.
                            break;
                        }
                    }
                    // Dropping the sender is the EOF signal.
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(Err(into_io_error(err))).await;
                        break;
                    }
                }
            }
        });

        ReaderState::Streaming {
            rx,
            current: Bytes::new(),
            done: false,
            driver,
        }
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let ReaderState::Idle(start) = &mut self.state {
            match start.take() {
                Some((downloader, input)) => self.state = Self::start(downloader, input),
                None => return Poll::Ready(Ok(())),
            }
        }

        let ReaderState::Streaming {
            rx,
            current,
            done,
            ..
        } = &mut self.state
        else {
            return Poll::Ready(Ok(()));
        };

        loop {
            if !current.is_empty() {
                let n = current.len().min(buf.remaining());
                buf.put_slice(&current.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if *done {
                return Poll::Ready(Ok(()));
            }
            match rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => *current = chunk,
                Poll::Ready(Some(Err(err))) => {
                    *done = true;
                    return Poll::Ready(Err(err));
                }
                Poll::Ready(None) => {
                    *done = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for ObjectReader {
    fn drop(&mut self) {
        if let ReaderState::Streaming { driver, .. } = &self.state {
            driver.abort();
        }
    }
}

fn into_io_error(err: TransferError) -> io::Error {
    match &err {
        TransferError::Client(client) if client.kind() == ClientErrorKind::NotFound => {
            io::Error::new(io::ErrorKind::NotFound, err.to_string())
        }
        TransferError::Client(client) if client.is_canceled() => {
            io::Error::new(io::ErrorKind::Interrupted, err.to_string())
        }
        TransferError::BodyRead(_) | TransferError::Io(_) => {
            io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string())
        }
        _ => io::Error::other(err.to_string()),
    }
}
