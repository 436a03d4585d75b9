//! Object-store client abstraction
//!
//! The transfer engine drives any S3-compatible store through this narrow
//! async trait; HTTP transport, signing, endpoint resolution and wire-format
//! marshaling all live behind it. The engine only ever branches on the
//! *kind* of a failure ([`ClientErrorKind`]), never on transport details:
//!
//! - `RangeNotSatisfiable` (416) terminates unknown-length downloads,
//! - `NotFound` (404) maps to `io::ErrorKind::NotFound` / bucket-not-found,
//! - `Canceled` aborts the transfer with a canceled error,
//! - everything else is a request failure surfaced as-is. Retrying failed
//!   requests is the client's job; the engine retries only interrupted part
//!   body reads.
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_transfer::client::{GetObjectInput, ObjectStore};
//! # async fn example(store: std::sync::Arc<dyn ObjectStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let out = store
//!     .get_object(GetObjectInput::new("my-bucket", "my-key"))
//!     .await?;
//! let bytes = out.body.collect().await?;
//! println!("read {} bytes", bytes.len());
//! # Ok(())
//! # }
//! ```

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

mod types;

pub use types::*;

/// Classification of a client failure. The engine's control flow depends on
/// these kinds alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// 404-class: bucket or object does not exist.
    NotFound,
    /// 416-class: the requested byte range starts past the end of the
    /// object. Unknown-length downloads treat this as end of data.
    RangeNotSatisfiable,
    /// Any other non-2xx response, with the HTTP status when available.
    RequestFailure { status: Option<u16> },
    /// The operation was canceled before completing.
    Canceled,
    /// Transport or protocol failure with no HTTP status.
    Other,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::RangeNotSatisfiable => f.write_str("requested range not satisfiable"),
            Self::RequestFailure {
                status: Some(status),
            } => write!(f, "request failure (status {status})"),
            Self::RequestFailure { status: None } => f.write_str("request failure"),
            Self::Canceled => f.write_str("canceled"),
            Self::Other => f.write_str("client error"),
        }
    }
}

/// Error returned by [`ObjectStore`] operations.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct ClientError {
    kind: ClientErrorKind,
    message: String,
    /// Region header captured from the response, if any. S3 includes it even
    /// on 301/404 responses to `HeadBucket`.
    bucket_region: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            bucket_region: None,
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::NotFound, message)
    }

    pub fn range_not_satisfiable() -> Self {
        Self::new(
            ClientErrorKind::RangeNotSatisfiable,
            "requested range is outside the object",
        )
    }

    pub fn request_failure(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            ClientErrorKind::RequestFailure {
                status: Some(status),
            },
            message,
        )
    }

    pub fn canceled() -> Self {
        Self::new(ClientErrorKind::Canceled, "operation canceled")
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Other, message)
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_bucket_region(mut self, region: impl Into<String>) -> Self {
        self.bucket_region = Some(region.into());
        self
    }

    pub fn kind(&self) -> ClientErrorKind {
        self.kind
    }

    /// HTTP status code of the failure, when one applies.
    pub fn status_code(&self) -> Option<u16> {
        match self.kind {
            ClientErrorKind::NotFound => Some(404),
            ClientErrorKind::RangeNotSatisfiable => Some(416),
            ClientErrorKind::RequestFailure { status } => status,
            _ => None,
        }
    }

    pub fn bucket_region(&self) -> Option<&str> {
        self.bucket_region.as_deref()
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ClientErrorKind::Canceled
    }
}

/// The object-store operations the transfer engine consumes.
///
/// Implementations must be safe to share across the engine's worker tasks.
/// `head_bucket` has two extra contract points: the request is sent
/// anonymously, and HTTP redirects are not followed (a cross-region 301
/// carries the region header but no `Location`, which redirect-following
/// transports drop on the floor).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, input: GetObjectInput) -> Result<GetObjectOutput, ClientError>;

    async fn put_object(&self, input: PutObjectInput) -> Result<PutObjectOutput, ClientError>;

    async fn create_multipart_upload(
        &self,
        input: CreateMultipartUploadInput,
    ) -> Result<CreateMultipartUploadOutput, ClientError>;

    async fn upload_part(&self, input: UploadPartInput) -> Result<UploadPartOutput, ClientError>;

    async fn complete_multipart_upload(
        &self,
        input: CompleteMultipartUploadInput,
    ) -> Result<CompleteMultipartUploadOutput, ClientError>;

    async fn abort_multipart_upload(
        &self,
        input: AbortMultipartUploadInput,
    ) -> Result<(), ClientError>;

    async fn head_bucket(&self, input: HeadBucketInput) -> Result<HeadBucketOutput, ClientError>;

    async fn delete_objects(
        &self,
        input: DeleteObjectsInput,
    ) -> Result<DeleteObjectsOutput, ClientError>;

    async fn list_objects(&self, input: ListObjectsInput)
        -> Result<ListObjectsOutput, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ClientError::not_found("x").status_code(), Some(404));
        assert_eq!(ClientError::range_not_satisfiable().status_code(), Some(416));
        assert_eq!(
            ClientError::request_failure(503, "slow down").status_code(),
            Some(503)
        );
        assert_eq!(ClientError::canceled().status_code(), None);
    }

    #[test]
    fn test_canceled_display_mentions_cancellation() {
        let err = ClientError::canceled();
        assert!(err.to_string().contains("canceled"));
        assert!(err.is_canceled());
    }

    #[test]
    fn test_bucket_region_passthrough() {
        let err = ClientError::request_failure(301, "moved").with_bucket_region("eu-central-1");
        assert_eq!(err.bucket_region(), Some("eu-central-1"));
    }
}
