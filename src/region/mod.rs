//! Bucket region discovery
//!
//! A single anonymous `HeadBucket` answers which region a bucket lives in:
//! the store puts the region in a response header even when the request
//! lands in the wrong region (301) — which is why the client contract
//! requires redirect-following disabled, since a 301 without a `Location`
//! would otherwise be eaten by the transport. Legacy location values are
//! normalized to region IDs.

use crate::client::{HeadBucketInput, ObjectStore};
use crate::error::TransferError;

/// Discover the region a bucket resides in.
///
/// Returns [`TransferError::BucketNotFound`] when the bucket does not exist
/// in the partition the client is configured against.
#[tracing::instrument(name = "transfer.get_bucket_region", skip(client), err)]
pub async fn get_bucket_region(
    client: &dyn ObjectStore,
    bucket: &str,
) -> Result<String, TransferError> {
    let input = HeadBucketInput {
        bucket: bucket.to_string(),
    };
    match client.head_bucket(input).await {
        Ok(out) => Ok(normalize_bucket_location(
            out.bucket_region.unwrap_or_default(),
        )),
        Err(err) => {
            // Error responses (301 on region mismatch, 403 without list
            // permission) still carry the region header.
            if let Some(region) = err.bucket_region() {
                return Ok(normalize_bucket_location(region.to_string()));
            }
            if err.status_code() == Some(404) {
                return Err(TransferError::BucketNotFound);
            }
            Err(err.into())
        }
    }
}

/// Map legacy `GetBucketLocation`-style values to region IDs: an empty
/// location is `us-east-1`, `EU` is `eu-west-1`.
fn normalize_bucket_location(location: String) -> String {
    match location.as_str() {
        "" => "us-east-1".to_string(),
        "EU" => "eu-west-1".to_string(),
        _ => location,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, HeadBucketOutput, MockObjectStore};

    #[test]
    fn test_normalize_legacy_locations() {
        assert_eq!(normalize_bucket_location(String::new()), "us-east-1");
        assert_eq!(normalize_bucket_location("EU".to_string()), "eu-west-1");
        assert_eq!(
            normalize_bucket_location("ap-southeast-2".to_string()),
            "ap-southeast-2"
        );
    }

    #[tokio::test]
    async fn test_region_from_success_response() {
        let mut store = MockObjectStore::new();
        store.expect_head_bucket().times(1).returning(|_| {
            Ok(HeadBucketOutput {
                bucket_region: Some("eu-central-1".to_string()),
            })
        });

        let region = get_bucket_region(&store, "my-bucket").await.unwrap();
        assert_eq!(region, "eu-central-1");
    }

    #[tokio::test]
    async fn test_region_from_redirect_error() {
        let mut store = MockObjectStore::new();
        store.expect_head_bucket().times(1).returning(|_| {
            Err(ClientError::request_failure(301, "moved permanently")
                .with_bucket_region("us-west-2"))
        });

        let region = get_bucket_region(&store, "my-bucket").await.unwrap();
        assert_eq!(region, "us-west-2");
    }

    #[tokio::test]
    async fn test_missing_bucket_is_distinguished() {
        let mut store = MockObjectStore::new();
        store
            .expect_head_bucket()
            .times(1)
            .returning(|_| Err(ClientError::not_found("no such bucket")));

        let err = get_bucket_region(&store, "missing").await.unwrap_err();
        assert!(matches!(err, TransferError::BucketNotFound));
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let mut store = MockObjectStore::new();
        store
            .expect_head_bucket()
            .times(1)
            .returning(|_| Err(ClientError::request_failure(500, "internal error")));

        let err = get_bucket_region(&store, "my-bucket").await.unwrap_err();
        assert!(matches!(err, TransferError::Client(_)));
    }

    #[tokio::test]
    async fn test_empty_header_defaults_to_us_east_1() {
        let mut store = MockObjectStore::new();
        store
            .expect_head_bucket()
            .times(1)
            .returning(|_| Ok(HeadBucketOutput::default()));

        let region = get_bucket_region(&store, "my-bucket").await.unwrap();
        assert_eq!(region, "us-east-1");
    }
}
