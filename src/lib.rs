//! Mizuchi Transfer Library
//!
//! Concurrent multipart transfer engine for S3-compatible object stores.
//!
//! # Features
//!
//! - **Multipart Downloads**: ranged GETs fanned across a bounded worker
//!   pool, into a random-access sink or a strictly-ordered stream
//! - **Multipart Uploads**: automatic single-PUT vs multipart decision,
//!   streaming writer, cleanup on failure
//! - **Client Agnostic**: drives any store through the narrow
//!   [`ObjectStore`](client::ObjectStore) trait
//! - **Bounded Memory**: part buffers come from a capacity-bounded pool
//! - **Batch Helpers**: grouped deletes, per-item bulk upload/download
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mizuchi_transfer::client::{GetObjectInput, ObjectStore};
//! use mizuchi_transfer::{Downloader, Uploader, UploadInput};
//!
//! # async fn example(store: Arc<dyn ObjectStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let uploader = Uploader::new(Arc::clone(&store));
//! uploader
//!     .upload(UploadInput::new("bucket", "key"), b"payload".to_vec().into())
//!     .await?;
//!
//! let downloader = Downloader::new(store);
//! let mut sink = Vec::new();
//! downloader
//!     .download(&mut sink, GetObjectInput::new("bucket", "key"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod buffer;
pub mod client;
pub mod download;
pub mod error;
pub mod region;
pub mod upload;

pub(crate) mod sync;

// Re-export the main entry points
pub use download::{DownloadError, Downloader, ObjectReader, WriteAt};
pub use error::{MultipartUploadError, TransferError};
pub use region::get_bucket_region;
pub use upload::{ObjectWriter, UploadBody, UploadInput, UploadOutput, Uploader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default size of a download part, in bytes (5 MiB).
pub const DEFAULT_DOWNLOAD_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Default size of an upload part, in bytes (5 MiB).
pub const DEFAULT_UPLOAD_PART_SIZE: u64 = MIN_UPLOAD_PART_SIZE;

/// Smallest part size a multipart upload may use (5 MiB, an S3 limit).
pub const MIN_UPLOAD_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest part size a multipart upload may use (5 GiB, an S3 limit).
pub const MAX_UPLOAD_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Default ceiling on the number of parts per upload (the S3 limit).
pub const DEFAULT_MAX_UPLOAD_PARTS: u32 = 10_000;

/// Default number of parts transferred in parallel per operation.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default number of retries for an interrupted part body read.
pub const DEFAULT_PART_BODY_MAX_RETRIES: u32 = 3;

/// Default number of objects per batched `DeleteObjects` call.
pub const DEFAULT_BATCH_SIZE: usize = 100;
