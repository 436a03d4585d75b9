//! Input and output types for the object-store client operations.
//!
//! These mirror the subset of the S3 REST surface the transfer engine
//! actually drives. Anything the engine does not branch on (SSE, object
//! lock, grants) is deliberately absent; implementations are free to carry
//! such fields out of band.

use std::collections::HashMap;
use std::fmt;
use std::io;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Streaming object payload returned by `get_object`.
///
/// The engine drains the stream chunk by chunk into a part buffer; a stream
/// error is treated as a transient body-read interruption and the ranged GET
/// is re-issued (see `Downloader::part_body_max_retries`).
pub struct ObjectBody {
    inner: BoxStream<'static, io::Result<Bytes>>,
}

impl ObjectBody {
    /// Wrap an arbitrary byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// A body consisting of a single in-memory chunk.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self::from_stream(futures::stream::iter([Ok(bytes)]))
    }

    /// An empty body.
    pub fn empty() -> Self {
        Self::from_stream(futures::stream::empty())
    }

    /// Next chunk of the payload, `None` at end of body.
    pub async fn next(&mut self) -> Option<io::Result<Bytes>> {
        self.inner.next().await
    }

    /// Drain the whole body into one contiguous buffer.
    pub async fn collect(mut self) -> io::Result<Bytes> {
        let mut out = bytes::BytesMut::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ObjectBody")
    }
}

/// Checksum algorithm requested for upload operations.
///
/// The engine never computes digests itself; it forwards the algorithm and
/// carries whatever per-part values the store returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Crc32,
    Crc32c,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crc32 => "CRC32",
            Self::Crc32c => "CRC32C",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }
}

/// Input for a (optionally ranged) GET.
#[derive(Debug, Clone, Default)]
pub struct GetObjectInput {
    pub bucket: String,
    pub key: String,
    /// HTTP byte-range header value, e.g. `bytes=0-5242879`. When set by the
    /// caller the downloader performs exactly one request for that range.
    pub range: Option<String>,
    pub version_id: Option<String>,
}

impl GetObjectInput {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Output of a GET. The body must be fully drained (or dropped) by the
/// caller; the engine owns it only long enough to copy it out.
#[derive(Debug)]
pub struct GetObjectOutput {
    pub body: ObjectBody,
    /// Length of this response's payload (the part, not the whole object).
    pub content_length: u64,
    /// `Content-Range` echo, e.g. `bytes 0-5242879/12582912`. A total of `*`
    /// means the store does not know the full object size.
    pub content_range: Option<String>,
    pub etag: Option<String>,
}

/// Input for a single-shot PUT.
#[derive(Debug)]
pub struct PutObjectInput {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub acl: Option<String>,
    pub storage_class: Option<String>,
    pub metadata: HashMap<String, String>,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
}

#[derive(Debug, Clone, Default)]
pub struct PutObjectOutput {
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub checksum_crc32: Option<String>,
    pub checksum_crc32c: Option<String>,
    pub checksum_sha1: Option<String>,
    pub checksum_sha256: Option<String>,
}

/// Input initiating a multipart session. Mirrors the metadata surface of
/// [`PutObjectInput`] so both upload paths create objects with the same
/// parameters.
#[derive(Debug, Clone, Default)]
pub struct CreateMultipartUploadInput {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub acl: Option<String>,
    pub storage_class: Option<String>,
    pub metadata: HashMap<String, String>,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
}

#[derive(Debug, Clone)]
pub struct CreateMultipartUploadOutput {
    /// Server-assigned session identifier.
    pub upload_id: String,
}

#[derive(Debug)]
pub struct UploadPartInput {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// 1-based part number.
    pub part_number: u32,
    pub body: Bytes,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadPartOutput {
    pub etag: Option<String>,
    pub checksum_crc32: Option<String>,
    pub checksum_crc32c: Option<String>,
    pub checksum_sha1: Option<String>,
    pub checksum_sha256: Option<String>,
}

/// Descriptor of a finished part, collected by the engine and handed to the
/// completing call sorted by part number.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: Option<String>,
    pub checksum_crc32: Option<String>,
    pub checksum_crc32c: Option<String>,
    pub checksum_sha1: Option<String>,
    pub checksum_sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompleteMultipartUploadInput {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// Must be sorted by `part_number`, ascending, no gaps.
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteMultipartUploadOutput {
    pub etag: Option<String>,
    pub location: Option<String>,
    pub version_id: Option<String>,
    pub checksum_crc32: Option<String>,
    pub checksum_crc32c: Option<String>,
    pub checksum_sha1: Option<String>,
    pub checksum_sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AbortMultipartUploadInput {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// Input for the anonymous region-discovery HEAD. Implementations must send
/// this unsigned and with redirect-following disabled, so the region header
/// of a 301 response survives (see `region::get_bucket_region`).
#[derive(Debug, Clone)]
pub struct HeadBucketInput {
    pub bucket: String,
}

#[derive(Debug, Clone, Default)]
pub struct HeadBucketOutput {
    /// Value of the `x-amz-bucket-region` response header, if present.
    pub bucket_region: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObjectIdentifier {
    pub key: String,
    pub version_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeleteObjectsInput {
    pub bucket: String,
    pub mfa: Option<String>,
    pub request_payer: Option<String>,
    pub objects: Vec<ObjectIdentifier>,
}

/// Per-key failure reported inside an otherwise successful batch delete.
#[derive(Debug, Clone)]
pub struct DeleteObjectsError {
    pub key: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteObjectsOutput {
    pub errors: Vec<DeleteObjectsError>,
}

#[derive(Debug, Clone, Default)]
pub struct ListObjectsInput {
    pub bucket: String,
    pub prefix: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ListObjectsOutput {
    pub contents: Vec<ObjectSummary>,
    pub next_continuation_token: Option<String>,
    pub is_truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_collect() {
        let body = ObjectBody::from_stream(futures::stream::iter([
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]));
        let all = body.collect().await.unwrap();
        assert_eq!(&all[..], b"hello world");
    }

    #[tokio::test]
    async fn test_body_error_surfaces() {
        let body = ObjectBody::from_stream(futures::stream::iter([
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]));
        assert!(body.collect().await.is_err());
    }

    #[test]
    fn test_checksum_algorithm_names() {
        assert_eq!(ChecksumAlgorithm::Crc32.as_str(), "CRC32");
        assert_eq!(ChecksumAlgorithm::Sha256.as_str(), "SHA256");
    }
}
