//! Push-based streaming upload
//!
//! [`ObjectWriter`] accepts chunks of any size and assembles them into
//! parts. Whether the object goes up as a single PUT or a multipart session
//! is decided by the very first part boundary: if the writer is closed
//! before one full part has accumulated, a single `PutObject` is issued
//! (including for an empty object); the moment a first full part exists,
//! a multipart session is created and parts stream out behind the
//! concurrency gate while the caller keeps writing.
//!
//! The writer must be closed: [`ObjectWriter::close`] uploads the trailing
//! partial part, waits for the in-flight ones and completes the session.
//! Any deferred part failure is returned from `close`, joined with the
//! abort outcome.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mizuchi_transfer::client::ObjectStore;
//! use mizuchi_transfer::upload::{UploadInput, Uploader};
//!
//! # async fn example(store: Arc<dyn ObjectStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let uploader = Uploader::new(store);
//! let mut writer = uploader.writer(UploadInput::new("my-bucket", "my-key"));
//! for chunk in [&b"hello "[..], &b"world"[..]] {
//!     writer.write(chunk).await?;
//! }
//! let out = writer.close().await?;
//! println!("etag: {:?}", out.etag);
//! # Ok(())
//! # }
//! ```

use bytes::BytesMut;

use crate::error::TransferError;
use crate::upload::{MultipartSession, UploadInput, UploadOutput, Uploader};

impl Uploader {
    /// A push-based writer for the given destination. Part size, concurrency
    /// and failure policy come from the uploader.
    pub fn writer(&self, input: UploadInput) -> ObjectWriter {
        ObjectWriter {
            uploader: self.clone(),
            input,
            buf: BytesMut::new(),
            session: None,
            next_part_number: 1,
            poisoned: false,
            closed: false,
        }
    }
}

/// Streaming writer returned by [`Uploader::writer`].
pub struct ObjectWriter {
    uploader: Uploader,
    input: UploadInput,
    buf: BytesMut,
    session: Option<MultipartSession>,
    next_part_number: u32,
    poisoned: bool,
    closed: bool,
}

impl ObjectWriter {
    /// Append bytes to the object. Chunks may be any size; a part is
    /// dispatched every time one part size has accumulated.
    ///
    /// A failure of an already-dispatched part surfaces here as soon as it
    /// is observed; the full cause (with upload ID and abort outcome) comes
    /// from [`ObjectWriter::close`].
    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), TransferError> {
        if self.closed || self.poisoned {
            return Err(TransferError::Canceled(
                "object writer is no longer usable".into(),
            ));
        }
        if matches!(&self.session, Some(session) if session.errored()) {
            return Err(TransferError::Canceled(
                "a part upload failed; close() returns the cause".into(),
            ));
        }

        let part_size = match self.uploader.validate_part_size() {
            Ok(size) => size as usize,
            Err(err) => {
                self.poisoned = true;
                return Err(err);
            }
        };

        while !data.is_empty() {
            let room = part_size - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.buf.len() == part_size {
                if let Err(err) = self.flush_part().await {
                    self.poisoned = true;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn flush_part(&mut self) -> Result<(), TransferError> {
        if self.session.is_none() {
            // First full part: the object is larger than one part, so this
            // is a multipart upload.
            let session = MultipartSession::create(&self.uploader, &self.input).await?;
            self.session = Some(session);
        }

        let part_number = self.next_part_number;
        self.next_part_number += 1;
        let body = self.buf.split().freeze();

        if let Some(session) = self.session.as_mut() {
            let max_parts = self.uploader.effective_max_parts();
            if part_number > max_parts {
                let err = TransferError::config(format!(
                    "exceeded total allowed configured MaxUploadParts ({max_parts}); \
                     adjust PartSize to fit in this limit"
                ));
                session.record_failure(err);
                return Err(TransferError::config(format!(
                    "exceeded total allowed configured MaxUploadParts ({max_parts})"
                )));
            }
            session.dispatch(part_number, body).await;
        }
        Ok(())
    }

    /// Finalize the object and return the store's result.
    ///
    /// With less than one part written this issues the single `PutObject`;
    /// otherwise the trailing partial part is uploaded and the multipart
    /// session completed, or aborted if any part failed.
    #[tracing::instrument(
        name = "transfer.writer_close",
        skip(self),
        fields(bucket = %self.input.bucket, key = %self.input.key),
        err
    )]
    pub async fn close(mut self) -> Result<UploadOutput, TransferError> {
        self.closed = true;

        match self.session.take() {
            None => {
                if self.poisoned {
                    return Err(TransferError::Canceled(
                        "object writer already failed".into(),
                    ));
                }
                let body = self.buf.split().freeze();
                self.uploader.put_single(&self.input, body).await
            }
            Some(mut session) => {
                if !self.buf.is_empty() && !session.errored() {
                    let part_number = self.next_part_number;
                    session.dispatch(part_number, self.buf.split().freeze()).await;
                }
                session.finish().await
            }
        }
    }

    /// Bytes buffered towards the next part.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
