//! Upload engine
//!
//! Decides between a single-shot PUT and a multipart session, fans part
//! uploads across a bounded worker pool, and completes or aborts the
//! session. Two body shapes are supported: an in-memory [`Bytes`] payload
//! (size known up front, parts are zero-copy slices) and an arbitrary
//! `AsyncRead` (size unknown, one part is probe-read to pick the strategy).
//! The push-based [`ObjectWriter`](writer::ObjectWriter) covers callers that
//! produce data incrementally.
//!
//! On any part failure the session stops dispatching and, unless
//! `leave_parts_on_error` is set, aborts the multipart upload server-side;
//! the returned [`MultipartUploadError`](crate::error::MultipartUploadError)
//! carries the upload ID either way so abandoned parts can be cleaned up by
//! external tooling.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mizuchi_transfer::client::ObjectStore;
//! use mizuchi_transfer::upload::{UploadInput, Uploader};
//!
//! # async fn example(store: Arc<dyn ObjectStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let uploader = Uploader::builder(store).concurrency(8).build();
//!
//! let payload = std::fs::read("large-file.bin")?;
//! let out = uploader
//!     .upload(UploadInput::new("my-bucket", "my-key"), payload.into())
//!     .await?;
//! println!("etag: {:?}", out.etag);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;

use crate::buffer::{CapacityLease, PartPool};
use crate::client::{
    AbortMultipartUploadInput, ChecksumAlgorithm, CompleteMultipartUploadInput, CompletedPart,
    CreateMultipartUploadInput, ObjectStore, PutObjectInput, UploadPartInput,
};
use crate::error::{MultipartUploadError, TransferError};
use crate::sync::gate::ConcurrencyGate;
use crate::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_UPLOAD_PARTS, DEFAULT_UPLOAD_PART_SIZE, MAX_UPLOAD_PART_SIZE,
    MIN_UPLOAD_PART_SIZE,
};

pub mod writer;

pub use writer::ObjectWriter;

/// Destination and metadata of an upload. The payload travels separately as
/// an [`UploadBody`] so the same input can describe a single-shot PUT, a
/// multipart session or a streaming writer.
#[derive(Debug, Clone, Default)]
pub struct UploadInput {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub acl: Option<String>,
    pub storage_class: Option<String>,
    pub metadata: HashMap<String, String>,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
}

impl UploadInput {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    fn to_put(&self, body: Bytes) -> PutObjectInput {
        PutObjectInput {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            body,
            content_type: self.content_type.clone(),
            cache_control: self.cache_control.clone(),
            acl: self.acl.clone(),
            storage_class: self.storage_class.clone(),
            metadata: self.metadata.clone(),
            checksum_algorithm: self.checksum_algorithm,
        }
    }

    fn to_create(&self) -> CreateMultipartUploadInput {
        CreateMultipartUploadInput {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            content_type: self.content_type.clone(),
            cache_control: self.cache_control.clone(),
            acl: self.acl.clone(),
            storage_class: self.storage_class.clone(),
            metadata: self.metadata.clone(),
            checksum_algorithm: self.checksum_algorithm,
        }
    }
}

/// The payload of an upload.
pub enum UploadBody {
    /// In-memory payload; the size is known up front and parts are cheap
    /// slices of the original buffer.
    Bytes(Bytes),
    /// Arbitrary byte source; the size is discovered by reading, so the
    /// single-vs-multipart decision happens after probing one part.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl UploadBody {
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::Reader(Box::new(reader))
    }

    pub fn empty() -> Self {
        Self::Bytes(Bytes::new())
    }
}

impl From<Bytes> for UploadBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for UploadBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static str> for UploadBody {
    fn from(s: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => write!(f, "UploadBody::Bytes({} bytes)", b.len()),
            Self::Reader(_) => f.write_str("UploadBody::Reader"),
        }
    }
}

/// Result of a finished upload. `upload_id` is set only for multipart
/// uploads; checksums are whatever the store returned, never recomputed.
#[derive(Debug, Clone, Default)]
pub struct UploadOutput {
    pub location: Option<String>,
    pub upload_id: Option<String>,
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub checksum_crc32: Option<String>,
    pub checksum_crc32c: Option<String>,
    pub checksum_sha1: Option<String>,
    pub checksum_sha256: Option<String>,
}

/// Builder for [`Uploader`].
#[derive(Clone)]
pub struct UploaderBuilder {
    client: Arc<dyn ObjectStore>,
    part_size: u64,
    concurrency: usize,
    max_upload_parts: u32,
    leave_parts_on_error: bool,
    pool: Option<Arc<PartPool>>,
}

impl UploaderBuilder {
    fn new(client: Arc<dyn ObjectStore>) -> Self {
        Self {
            client,
            part_size: DEFAULT_UPLOAD_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            max_upload_parts: DEFAULT_MAX_UPLOAD_PARTS,
            leave_parts_on_error: false,
            pool: None,
        }
    }

    /// Byte size of each uploaded part. Must be at least
    /// [`MIN_UPLOAD_PART_SIZE`]; zero selects the default (5 MiB). The
    /// effective size is grown automatically when the payload would
    /// otherwise exceed `max_upload_parts`.
    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Number of parts uploaded in parallel. Zero selects the default (5).
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Ceiling on the number of parts per upload. Zero selects the default
    /// (10,000, the S3 limit).
    pub fn max_upload_parts(mut self, max: u32) -> Self {
        self.max_upload_parts = max;
        self
    }

    /// Keep already-uploaded parts on failure instead of aborting the
    /// multipart session. Off by default; abandoned parts accrue storage
    /// until removed.
    pub fn leave_parts_on_error(mut self, leave: bool) -> Self {
        self.leave_parts_on_error = leave;
        self
    }

    /// Share a buffer pool across transfers (reader-body uploads only; see
    /// `DownloaderBuilder::buffer_pool` for the sharing contract).
    pub fn buffer_pool(mut self, pool: Arc<PartPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> Uploader {
        Uploader {
            client: self.client,
            part_size: self.part_size,
            concurrency: self.concurrency,
            max_upload_parts: self.max_upload_parts,
            leave_parts_on_error: self.leave_parts_on_error,
            pool: self.pool,
        }
    }
}

/// Concurrent multipart uploader. Cheap to clone; safe to use from many
/// tasks at once, each call running its own worker group.
#[derive(Clone)]
pub struct Uploader {
    client: Arc<dyn ObjectStore>,
    part_size: u64,
    concurrency: usize,
    max_upload_parts: u32,
    leave_parts_on_error: bool,
    pool: Option<Arc<PartPool>>,
}

impl Uploader {
    pub fn builder(client: Arc<dyn ObjectStore>) -> UploaderBuilder {
        UploaderBuilder::new(client)
    }

    /// Uploader with default settings.
    pub fn new(client: Arc<dyn ObjectStore>) -> Self {
        UploaderBuilder::new(client).build()
    }

    pub(crate) fn effective_part_size(&self) -> u64 {
        if self.part_size == 0 {
            DEFAULT_UPLOAD_PART_SIZE
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

    pub(crate) fn effective_max_parts(&self) -> u32 {
        if self.max_upload_parts == 0 {
            DEFAULT_MAX_UPLOAD_PARTS
        } else {
            self.max_upload_parts
        }
    }

    pub(crate) fn validate_part_size(&self) -> Result<u64, TransferError> {
        let part_size = self.effective_part_size();
        if part_size < MIN_UPLOAD_PART_SIZE {
            return Err(TransferError::config(format!(
                "part size must be at least {MIN_UPLOAD_PART_SIZE} bytes, configured {part_size}"
            )));
        }
        Ok(part_size)
    }

    /// Upload a payload, choosing single-shot PUT or multipart by size.
    ///
    /// Payloads smaller than one part (including empty ones) go up as one
    /// `PutObject`; everything else becomes a multipart session. A payload
    /// of exactly one part size produces a multipart upload with exactly one
    /// part.
    #[tracing::instrument(
        name = "transfer.upload",
        skip(self, input, body),
        fields(bucket = %input.bucket, key = %input.key),
        err
    )]
    pub async fn upload(
        &self,
        input: UploadInput,
        body: UploadBody,
    ) -> Result<UploadOutput, TransferError> {
        let part_size = self.validate_part_size()?;
        match body {
            UploadBody::Bytes(bytes) => self.upload_sized(input, bytes, part_size).await,
            UploadBody::Reader(reader) => self.upload_reader(input, reader, part_size).await,
        }
    }

    async fn upload_sized(
        &self,
        input: UploadInput,
        bytes: Bytes,
        mut part_size: u64,
    ) -> Result<UploadOutput, TransferError> {
        let total = bytes.len() as u64;
        let max_parts = self.effective_max_parts();

        // With the size known up front the part plan is validated before any
        // request goes out: grow the part size (never the concurrency) until
        // the object fits under the part-count ceiling.
        if total.div_ceil(part_size.max(1)) > u64::from(max_parts) {
            part_size = total / u64::from(max_parts) + 1;
            if part_size > MAX_UPLOAD_PART_SIZE {
                return Err(TransferError::config(format!(
                    "configured MaxUploadParts ({max_parts}) cannot fit a {total} byte object \
                     within the maximum part size"
                )));
            }
            tracing::debug!(part_size, "part size increased to honor max part count");
        }

        if total < part_size {
            return self.put_single(&input, bytes).await;
        }

        let mut session = MultipartSession::create(self, &input).await?;
        let mut part_number: u32 = 0;
        let mut offset: u64 = 0;
        while offset < total {
            if session.errored() {
                break;
            }
            part_number += 1;
            let end = (offset + part_size).min(total);
            session
                .dispatch(part_number, bytes.slice(offset as usize..end as usize))
                .await;
            offset = end;
        }
        session.finish().await
    }

    async fn upload_reader(
        &self,
        input: UploadInput,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        part_size: u64,
    ) -> Result<UploadOutput, TransferError> {
        let concurrency = self.effective_concurrency();
        let max_parts = self.effective_max_parts();
        let (pool, _lease) = self.transfer_pool(part_size, concurrency);

        // Probe one part to decide the strategy. A source error here aborts
        // before any request — the session is never created.
        let mut probe = pool.get().await?;
        read_part(&mut reader, &mut probe, part_size as usize)
            .await
            .map_err(TransferError::Io)?;
        if (probe.len() as u64) < part_size {
            let body = probe.take_bytes();
            return self.put_single(&input, body).await;
        }

        let mut session = MultipartSession::create(self, &input).await?;
        session.dispatch(1, probe.take_bytes()).await;
        drop(probe);

        let mut part_number: u32 = 1;
        loop {
            if session.errored() {
                break;
            }
            let mut buf = match pool.get().await {
                Ok(buf) => buf,
                Err(err) => return Err(session.fail_with(err).await),
            };
            let n = match read_part(&mut reader, &mut buf, part_size as usize).await {
                Ok(n) => n,
                Err(err) => return Err(session.fail_with(TransferError::Io(err)).await),
            };
            if n == 0 {
                // Source ended exactly on a part boundary; no empty part.
                break;
            }

            part_number += 1;
            if part_number > max_parts {
                let err = TransferError::config(format!(
                    "exceeded total allowed configured MaxUploadParts ({max_parts}); \
                     adjust PartSize to fit in this limit"
                ));
                return Err(session.fail_with(err).await);
            }
            session.dispatch(part_number, buf.take_bytes()).await;

            if (n as u64) < part_size {
                break;
            }
        }
        session.finish().await
    }

    pub(crate) async fn put_single(
        &self,
        input: &UploadInput,
        body: Bytes,
    ) -> Result<UploadOutput, TransferError> {
        let out = self.client.put_object(input.to_put(body)).await?;
        Ok(UploadOutput {
            location: None,
            upload_id: None,
            etag: out.etag,
            version_id: out.version_id,
            checksum_crc32: out.checksum_crc32,
            checksum_crc32c: out.checksum_crc32c,
            checksum_sha1: out.checksum_sha1,
            checksum_sha256: out.checksum_sha256,
        })
    }

    fn transfer_pool(
        &self,
        part_size: u64,
        concurrency: usize,
    ) -> (Arc<PartPool>, Option<CapacityLease>) {
        let cap = concurrency + 1;
        match &self.pool {
            Some(pool) if pool.part_size() == part_size as usize => {
                let lease = pool.lease(cap);
                (Arc::clone(pool), Some(lease))
            }
            _ => (PartPool::new(part_size as usize, cap), None),
        }
    }
}

/// One live multipart upload: the server-assigned ID plus the part
/// descriptors collected as workers finish. Part uploads run behind the
/// concurrency gate; the first failure closes the gate, which stops
/// dispatch and unblocks anything still waiting on a slot.
pub(crate) struct MultipartSession {
    client: Arc<dyn ObjectStore>,
    input: UploadInput,
    upload_id: String,
    leave_parts_on_error: bool,
    gate: ConcurrencyGate,
    parts: Arc<Mutex<Vec<CompletedPart>>>,
    first_err: Arc<Mutex<Option<TransferError>>>,
    tasks: JoinSet<()>,
}

impl MultipartSession {
    pub(crate) async fn create(
        uploader: &Uploader,
        input: &UploadInput,
    ) -> Result<Self, TransferError> {
        let out = uploader
            .client
            .create_multipart_upload(input.to_create())
            .await?;
        tracing::debug!(upload_id = %out.upload_id, "created multipart upload");
        Ok(Self {
            client: Arc::clone(&uploader.client),
            input: input.clone(),
            upload_id: out.upload_id,
            leave_parts_on_error: uploader.leave_parts_on_error,
            gate: ConcurrencyGate::new(uploader.effective_concurrency()),
            parts: Arc::new(Mutex::new(Vec::new())),
            first_err: Arc::new(Mutex::new(None)),
            tasks: JoinSet::new(),
        })
    }

    pub(crate) fn errored(&self) -> bool {
        self.first_err.lock().is_some()
    }

    /// Record a failure observed outside the worker tasks and stop all
    /// dispatch.
    pub(crate) fn record_failure(&self, err: TransferError) {
        let mut guard = self.first_err.lock();
        if guard.is_none() {
            *guard = Some(err);
        }
        drop(guard);
        self.gate.close();
    }

    /// Queue one part upload behind the gate. Failures are recorded, not
    /// returned: callers watch [`MultipartSession::errored`] and settle
    /// through [`MultipartSession::finish`] or
    /// [`MultipartSession::fail_with`].
    pub(crate) async fn dispatch(&mut self, part_number: u32, body: Bytes) {
        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            // Gate closed: a part already failed and its error is recorded.
            Err(_) => return,
        };

        let client = Arc::clone(&self.client);
        let parts = Arc::clone(&self.parts);
        let first_err = Arc::clone(&self.first_err);
        let gate = self.gate.clone();
        let input = UploadPartInput {
            bucket: self.input.bucket.clone(),
            key: self.input.key.clone(),
            upload_id: self.upload_id.clone(),
            part_number,
            body,
            checksum_algorithm: self.input.checksum_algorithm,
        };

        self.tasks.spawn(async move {
            let _permit = permit;
            match client.upload_part(input).await {
                Ok(out) => parts.lock().push(CompletedPart {
                    part_number,
                    etag: out.etag,
                    checksum_crc32: out.checksum_crc32,
                    checksum_crc32c: out.checksum_crc32c,
                    checksum_sha1: out.checksum_sha1,
                    checksum_sha256: out.checksum_sha256,
                }),
                Err(err) => {
                    tracing::warn!(part_number, error = %err, "part upload failed");
                    let mut guard = first_err.lock();
                    if guard.is_none() {
                        *guard = Some(err.into());
                    }
                    drop(guard);
                    gate.close();
                }
            }
        });
    }

    async fn join(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    /// Wait for outstanding parts, then abort (honoring
    /// `leave_parts_on_error`) and wrap `cause` with the upload ID.
    pub(crate) async fn fail_with(mut self, cause: TransferError) -> TransferError {
        self.join().await;
        self.fail(cause).await
    }

    async fn fail(&self, cause: TransferError) -> TransferError {
        let abort_failure = if self.leave_parts_on_error {
            None
        } else {
            let input = AbortMultipartUploadInput {
                bucket: self.input.bucket.clone(),
                key: self.input.key.clone(),
                upload_id: self.upload_id.clone(),
            };
            match self.client.abort_multipart_upload(input).await {
                Ok(()) => {
                    tracing::debug!(upload_id = %self.upload_id, "aborted multipart upload");
                    None
                }
                Err(err) => {
                    tracing::warn!(upload_id = %self.upload_id, error = %err, "abort failed");
                    Some(err)
                }
            }
        };
        MultipartUploadError::new(self.upload_id.clone(), cause, abort_failure).into()
    }

    /// Wait for outstanding parts and complete the session, or abort on any
    /// recorded failure.
    pub(crate) async fn finish(mut self) -> Result<UploadOutput, TransferError> {
        self.join().await;

        if let Some(err) = self.first_err.lock().take() {
            return Err(self.fail(err).await);
        }

        let mut parts = std::mem::take(&mut *self.parts.lock());
        parts.sort_by_key(|part| part.part_number);

        let input = CompleteMultipartUploadInput {
            bucket: self.input.bucket.clone(),
            key: self.input.key.clone(),
            upload_id: self.upload_id.clone(),
            parts,
        };
        match self.client.complete_multipart_upload(input).await {
            Ok(out) => Ok(UploadOutput {
                location: out.location,
                upload_id: Some(self.upload_id.clone()),
                etag: out.etag,
                version_id: out.version_id,
                checksum_crc32: out.checksum_crc32,
                checksum_crc32c: out.checksum_crc32c,
                checksum_sha1: out.checksum_sha1,
                checksum_sha256: out.checksum_sha256,
            }),
            Err(err) => Err(self.fail(err.into()).await),
        }
    }
}

/// Read up to `part_size` bytes into `buf`, stopping early only at EOF.
/// Returns the number of bytes added.
async fn read_part<R>(reader: &mut R, buf: &mut BytesMut, part_size: usize) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let start = buf.len();
    while buf.len() < part_size {
        let remaining = part_size - buf.len();
        let mut limited = (&mut *buf).limit(remaining);
        let n = reader.read_buf(&mut limited).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf.len() - start)
}
