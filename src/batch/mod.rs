//! Batch operations
//!
//! Bulk helpers built on the transfer engine: grouped `DeleteObjects`
//! batches fed by a stream (including a paginated list-driven source), and
//! per-item upload/download drivers. Batch operations never stop at the
//! first failure — every per-item error is collected into one
//! [`BatchError`] and each item's `after` hook runs whether or not the item
//! succeeded. The exception is cancellation: once an item fails with a
//! canceled error, no further requests are issued and every remaining item
//! is reported as canceled.

use std::fmt;

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use thiserror::Error;

use crate::client::{
    ClientError, DeleteObjectsInput, GetObjectInput, ListObjectsInput, ObjectIdentifier,
    ObjectStore,
};
use crate::download::{Downloader, WriteAt};
use crate::error::TransferError;
use crate::upload::{UploadBody, UploadInput, Uploader};
use crate::DEFAULT_BATCH_SIZE;

/// Callback run after an item is processed, success or not.
pub type AfterHook = Box<dyn FnOnce() -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

/// Failure of one item within a batch.
#[derive(Debug, Error)]
#[error("failed to perform batch operation on {key:?} in {bucket:?}")]
pub struct BatchItemError {
    bucket: String,
    key: String,
    #[source]
    source: TransferError,
}

impl BatchItemError {
    fn new(bucket: impl Into<String>, key: impl Into<String>, source: TransferError) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            source,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cause(&self) -> &TransferError {
        &self.source
    }
}

/// Aggregate of every per-item failure in one batch operation, in the order
/// the failures were observed.
#[derive(Debug)]
pub struct BatchError {
    message: String,
    failures: Vec<BatchItemError>,
}

impl BatchError {
    fn new(message: impl Into<String>, failures: Vec<BatchItemError>) -> Self {
        Self {
            message: message.into(),
            failures,
        }
    }

    pub fn failures(&self) -> &[BatchItemError] {
        &self.failures
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} failure(s)", self.message, self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  {failure}: {}", failure.source)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// One object to delete, with the request parameters that decide which
/// `DeleteObjects` call it can share.
pub struct BatchDeleteObject {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub mfa: Option<String>,
    pub request_payer: Option<String>,
    pub after: Option<AfterHook>,
}

impl BatchDeleteObject {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            mfa: None,
            request_payer: None,
            after: None,
        }
    }

    /// Objects can ride in the same `DeleteObjects` call only when bucket,
    /// MFA and request-payer all match.
    fn has_parity(&self, other: &BatchDeleteObject) -> bool {
        self.bucket == other.bucket
            && self.mfa == other.mfa
            && self.request_payer == other.request_payer
    }
}

impl fmt::Debug for BatchDeleteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDeleteObject")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("version_id", &self.version_id)
            .finish()
    }
}

/// Bulk delete client: groups objects into `DeleteObjects` calls of up to
/// `batch_size` entries.
pub struct BatchDelete {
    client: Arc<dyn ObjectStore>,
    batch_size: usize,
}

impl BatchDelete {
    pub fn new(client: Arc<dyn ObjectStore>) -> Self {
        Self {
            client,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Number of objects per `DeleteObjects` call (default 100).
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Delete every object produced by the stream.
    ///
    /// Consecutive objects sharing bucket/MFA/request-payer are grouped into
    /// one call; a parity break or a full batch flushes. A stream error ends
    /// iteration and is reported alongside the per-item failures.
    #[tracing::instrument(name = "transfer.batch_delete", skip(self, objects), err)]
    pub async fn delete<S>(&self, objects: S) -> Result<(), BatchError>
    where
        S: Stream<Item = Result<BatchDeleteObject, TransferError>>,
    {
        let mut objects = std::pin::pin!(objects);
        let mut failures: Vec<BatchItemError> = Vec::new();
        let mut group: Vec<BatchDeleteObject> = Vec::new();
        let mut canceled = false;

        loop {
            let next = objects.next().await;
            match next {
                Some(Ok(object)) => {
                    if canceled {
                        failures.push(BatchItemError::new(
                            &object.bucket,
                            &object.key,
                            TransferError::Canceled("batch delete canceled".into()),
                        ));
                        run_after(object.after, &object.bucket, &object.key, &mut failures);
                        continue;
                    }

                    let parity = group
                        .first()
                        .map(|head| head.has_parity(&object))
                        .unwrap_or(true);
                    if !parity || group.len() == self.batch_size {
                        self.flush(&mut group, &mut failures, &mut canceled).await;
                    }
                    group.push(object);
                }
                Some(Err(err)) => {
                    failures.push(BatchItemError::new("", "", err));
                    break;
                }
                None => break,
            }
        }
        if !group.is_empty() && !canceled {
            self.flush(&mut group, &mut failures, &mut canceled).await;
        }
        // Anything still grouped after a cancellation is reported, not sent.
        for object in group.drain(..) {
            failures.push(BatchItemError::new(
                &object.bucket,
                &object.key,
                TransferError::Canceled("batch delete canceled".into()),
            ));
            run_after(object.after, &object.bucket, &object.key, &mut failures);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BatchError::new(
                "some objects have failed to be deleted",
                failures,
            ))
        }
    }

    async fn flush(
        &self,
        group: &mut Vec<BatchDeleteObject>,
        failures: &mut Vec<BatchItemError>,
        canceled: &mut bool,
    ) {
        if group.is_empty() {
            return;
        }
        let head = &group[0];
        let input = DeleteObjectsInput {
            bucket: head.bucket.clone(),
            mfa: head.mfa.clone(),
            request_payer: head.request_payer.clone(),
            objects: group
                .iter()
                .map(|object| ObjectIdentifier {
                    key: object.key.clone(),
                    version_id: object.version_id.clone(),
                })
                .collect(),
        };

        match self.client.delete_objects(input).await {
            Ok(out) => {
                // The call succeeded but individual keys can still fail.
                for err in out.errors {
                    let key = err.key.unwrap_or_default();
                    let message = err.message.unwrap_or_else(|| "failed to delete".into());
                    failures.push(BatchItemError::new(
                        &head.bucket,
                        key,
                        TransferError::Client(ClientError::other(message)),
                    ));
                }
            }
            Err(err) => {
                if err.is_canceled() {
                    *canceled = true;
                }
                for object in group.iter() {
                    failures.push(BatchItemError::new(
                        &object.bucket,
                        &object.key,
                        TransferError::Client(ClientError::new(err.kind(), err.to_string())),
                    ));
                }
            }
        }

        for object in group.drain(..) {
            run_after(object.after, &object.bucket, &object.key, failures);
        }
    }
}

fn run_after(
    after: Option<AfterHook>,
    bucket: &str,
    key: &str,
    failures: &mut Vec<BatchItemError>,
) {
    if let Some(hook) = after {
        if let Err(err) = hook() {
            failures.push(BatchItemError::new(
                bucket,
                key,
                TransferError::Io(std::io::Error::other(err)),
            ));
        }
    }
}

/// Stream of delete requests for every object under a prefix, produced by
/// paginating `ListObjectsV2`. Feed it to [`BatchDelete::delete`] to clear a
/// prefix without materializing the listing.
pub fn delete_list_stream(
    client: Arc<dyn ObjectStore>,
    bucket: impl Into<String>,
    prefix: Option<String>,
) -> impl Stream<Item = Result<BatchDeleteObject, TransferError>> + Send {
    struct PageState {
        client: Arc<dyn ObjectStore>,
        bucket: String,
        prefix: Option<String>,
        token: Option<String>,
        started: bool,
    }

    let state = PageState {
        client,
        bucket: bucket.into(),
        prefix,
        token: None,
        started: false,
    };

    stream::try_unfold(state, |mut state| async move {
        if state.started && state.token.is_none() {
            return Ok::<_, TransferError>(None);
        }
        let out = state
            .client
            .list_objects(ListObjectsInput {
                bucket: state.bucket.clone(),
                prefix: state.prefix.clone(),
                continuation_token: state.token.take(),
                max_keys: None,
            })
            .await
            .map_err(TransferError::from)?;

        state.started = true;
        state.token = out.next_continuation_token.clone();

        let page: Vec<BatchDeleteObject> = out
            .contents
            .into_iter()
            .map(|object| BatchDeleteObject::new(state.bucket.clone(), object.key))
            .collect();
        Ok(Some((page, state)))
    })
    .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
    .try_flatten()
}

/// One object for [`upload_objects`].
pub struct BatchUploadObject {
    pub input: UploadInput,
    pub body: UploadBody,
    pub after: Option<AfterHook>,
}

/// Upload each object in turn, collecting every failure. `after` hooks run
/// unconditionally; a canceled item stops further uploads and marks the
/// remaining objects canceled.
pub async fn upload_objects(
    uploader: &Uploader,
    objects: Vec<BatchUploadObject>,
) -> Result<(), BatchError> {
    let mut failures = Vec::new();
    let mut canceled = false;

    for object in objects {
        let bucket = object.input.bucket.clone();
        let key = object.input.key.clone();
        if canceled {
            failures.push(BatchItemError::new(
                &bucket,
                &key,
                TransferError::Canceled("batch upload canceled".into()),
            ));
        } else if let Err(err) = uploader.upload(object.input, object.body).await {
            canceled = err.is_canceled();
            failures.push(BatchItemError::new(&bucket, &key, err));
        }
        run_after(object.after, &bucket, &key, &mut failures);
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BatchError::new(
            "some objects have failed to upload",
            failures,
        ))
    }
}

/// One object for [`download_objects`].
pub struct BatchDownloadObject {
    pub input: GetObjectInput,
    pub sink: Box<dyn WriteAt + Send>,
    pub after: Option<AfterHook>,
}

/// Download each object in turn into its sink, collecting every failure the
/// same way as [`upload_objects`].
pub async fn download_objects(
    downloader: &Downloader,
    objects: Vec<BatchDownloadObject>,
) -> Result<(), BatchError> {
    let mut failures = Vec::new();
    let mut canceled = false;

    for mut object in objects {
        let bucket = object.input.bucket.clone();
        let key = object.input.key.clone();
        if canceled {
            failures.push(BatchItemError::new(
                &bucket,
                &key,
                TransferError::Canceled("batch download canceled".into()),
            ));
        } else if let Err(err) = downloader.download(object.sink.as_mut(), object.input).await {
            let err = err.into_cause();
            canceled = err.is_canceled();
            failures.push(BatchItemError::new(&bucket, &key, err));
        }
        run_after(object.after, &bucket, &key, &mut failures);
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BatchError::new(
            "some objects have failed to download",
            failures,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity_rules() {
        let a = BatchDeleteObject::new("bucket-a", "k1");
        let b = BatchDeleteObject::new("bucket-a", "k2");
        let c = BatchDeleteObject::new("bucket-b", "k3");
        let mut d = BatchDeleteObject::new("bucket-a", "k4");
        d.mfa = Some("mfa-token".into());

        assert!(a.has_parity(&b));
        assert!(!a.has_parity(&c));
        assert!(!a.has_parity(&d));
    }

    #[test]
    fn test_batch_error_lists_failures() {
        let err = BatchError::new(
            "some objects have failed to be deleted",
            vec![
                BatchItemError::new("b", "k1", TransferError::Validation("x".into())),
                BatchItemError::new("b", "k2", TransferError::Validation("y".into())),
            ],
        );
        let text = err.to_string();
        assert!(text.contains("2 failure(s)"));
        assert!(text.contains("k1"));
        assert!(text.contains("k2"));
    }
}
