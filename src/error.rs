//! Transfer engine errors
//!
//! One error type covers every operation, with variants matching how the
//! engine reacts: configuration and validation failures are returned before
//! or instead of network work, body-read interruptions are retried up to a
//! bound, client failures and cancellation abort the transfer, and multipart
//! failures carry the upload ID so abandoned sessions can be inspected or
//! cleaned up externally.

use std::fmt;

use thiserror::Error;

use crate::batch::BatchError;
use crate::client::ClientError;

/// Errors produced by transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Invalid configuration, rejected before any request is issued.
    #[error("configuration error: {0}")]
    Config(String),

    /// A response did not match what was requested (e.g. a part's
    /// `Content-Range` echo disagrees with the requested range).
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient interruption while draining a part body. Retried up to
    /// `part_body_max_retries` before surfacing.
    #[error("part body read interrupted: {0}")]
    BodyRead(#[source] std::io::Error),

    /// I/O failure on the caller-supplied source or sink.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the underlying object-store client.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The transfer was canceled.
    #[error("operation canceled: {0}")]
    Canceled(String),

    /// A multipart upload failed after the session was created.
    #[error(transparent)]
    MultipartUpload(#[from] MultipartUploadError),

    /// Aggregate failure from a batch operation.
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Region discovery could not find the bucket.
    #[error("bucket not found")]
    BucketNotFound,
}

impl TransferError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True when the failure is a cancellation, at whatever layer it was
    /// observed.
    pub fn is_canceled(&self) -> bool {
        match self {
            Self::Canceled(_) => true,
            Self::Client(err) => err.is_canceled(),
            Self::MultipartUpload(err) => err.source.is_canceled(),
            _ => false,
        }
    }

    /// HTTP status carried by the underlying client failure, if any.
    pub(crate) fn status_code(&self) -> Option<u16> {
        match self {
            Self::Client(err) => err.status_code(),
            _ => None,
        }
    }
}

/// A multipart upload failed partway through.
///
/// Carries the server-assigned upload ID. Unless the uploader was configured
/// with `leave_parts_on_error`, a best-effort abort was already attempted;
/// if that abort itself failed, the failure is reported here as well rather
/// than swallowed, since the abandoned parts keep accruing storage until
/// cleaned up out of band.
#[derive(Debug)]
pub struct MultipartUploadError {
    upload_id: String,
    source: Box<TransferError>,
    abort_failure: Option<ClientError>,
}

impl MultipartUploadError {
    pub(crate) fn new(
        upload_id: impl Into<String>,
        source: TransferError,
        abort_failure: Option<ClientError>,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            source: Box::new(source),
            abort_failure,
        }
    }

    /// The server-assigned identifier of the failed upload session.
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// The failure that ended the upload.
    pub fn cause(&self) -> &TransferError {
        &self.source
    }

    /// The abort failure, when cleanup was attempted and also failed.
    pub fn abort_failure(&self) -> Option<&ClientError> {
        self.abort_failure.as_ref()
    }
}

impl fmt::Display for MultipartUploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "multipart upload failed, upload id: {}, cause: {}",
            self.upload_id, self.source
        )?;
        if let Some(abort) = &self.abort_failure {
            write!(f, " (abort also failed: {abort})")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultipartUploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_error_carries_upload_id() {
        let err = MultipartUploadError::new(
            "upload-123",
            TransferError::Client(ClientError::request_failure(500, "boom")),
            None,
        );
        assert_eq!(err.upload_id(), "upload-123");
        assert!(err.to_string().contains("upload-123"));
    }

    #[test]
    fn test_multipart_error_reports_failed_abort() {
        let err = MultipartUploadError::new(
            "upload-456",
            TransferError::Client(ClientError::request_failure(500, "boom")),
            Some(ClientError::request_failure(503, "busy")),
        );
        assert!(err.to_string().contains("abort also failed"));
    }

    #[test]
    fn test_canceled_detection_through_layers() {
        let err = TransferError::Client(ClientError::canceled());
        assert!(err.is_canceled());
        assert!(err.to_string().contains("canceled"));

        let err = TransferError::Config("too small".into());
        assert!(!err.is_canceled());
    }
}
