//! Shared test support: an in-memory object store with fault injection.
//!
//! The store keeps whole objects in a map and serves ranged GETs, multipart
//! sessions, batched deletes and paginated listings from it. Knobs switch on
//! the failure modes the engine must handle: interrupted part bodies,
//! unknown object totals, misreported ranges, failing parts/aborts and
//! blanket cancellation. Every operation is recorded so tests can assert on
//! exactly which requests were issued.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use mizuchi_transfer::client::{
    AbortMultipartUploadInput, ChecksumAlgorithm, ClientError, CompleteMultipartUploadInput,
    CompleteMultipartUploadOutput, CreateMultipartUploadInput, CreateMultipartUploadOutput,
    DeleteObjectsError, DeleteObjectsInput, DeleteObjectsOutput, GetObjectInput, GetObjectOutput,
    HeadBucketInput, HeadBucketOutput, ListObjectsInput, ListObjectsOutput, ObjectBody,
    ObjectStore, ObjectSummary, PutObjectInput, PutObjectOutput, UploadPartInput,
    UploadPartOutput,
};

/// One recorded client operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Get { range: Option<String> },
    Put { len: usize },
    Create,
    UploadPart { part_number: u32, len: usize },
    Complete { parts: usize },
    Abort,
    DeleteObjects { keys: Vec<String> },
    List,
    HeadBucket,
}

struct UploadSession {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, Bytes>,
    checksum_algorithm: Option<ChecksumAlgorithm>,
}

#[derive(Default)]
struct State {
    objects: HashMap<(String, String), Bytes>,
    uploads: HashMap<String, UploadSession>,
    interrupt_bodies: u32,
    fail_part: Option<(u32, u32)>, // (part number, remaining failures)
    get_delays: HashMap<u64, u64>, // range start -> delay ms
    fail_range_starts: Vec<u64>,
}

pub struct InMemoryStore {
    state: Mutex<State>,
    ops: Mutex<Vec<Op>>,
    aborted: Mutex<Vec<String>>,
    hide_total: bool,
    misreport_ranges: bool,
    fail_abort: bool,
    cancel_all: bool,
    list_page_size: usize,
    delete_error_keys: Vec<String>,
    bucket_region: Option<String>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            ops: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            hide_total: false,
            misreport_ranges: false,
            fail_abort: false,
            cancel_all: false,
            list_page_size: 1000,
            delete_error_keys: Vec::new(),
            bucket_region: Some("us-east-1".to_string()),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `Content-Range` with a `*` total, as stores that do not know
    /// the object size do.
    pub fn hide_total(mut self) -> Self {
        self.hide_total = true;
        self
    }

    /// Echo a wrong start offset in every `Content-Range`.
    pub fn misreport_ranges(mut self) -> Self {
        self.misreport_ranges = true;
        self
    }

    /// Fail `AbortMultipartUpload` calls.
    pub fn fail_abort(mut self) -> Self {
        self.fail_abort = true;
        self
    }

    /// Every operation fails with a canceled error.
    pub fn cancel_all(mut self) -> Self {
        self.cancel_all = true;
        self
    }

    pub fn list_page_size(mut self, size: usize) -> Self {
        self.list_page_size = size;
        self
    }

    /// These keys report per-key errors from `DeleteObjects`.
    pub fn delete_error_keys(mut self, keys: &[&str]) -> Self {
        self.delete_error_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_object(self, bucket: &str, key: &str, data: impl Into<Bytes>) -> Self {
        self.insert_object(bucket, key, data);
        self
    }

    pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.state
            .lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// The next `n` GET bodies are interrupted halfway through.
    pub fn interrupt_bodies(&self, n: u32) {
        self.state.lock().interrupt_bodies = n;
    }

    /// `UploadPart` for this part number fails `times` times.
    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.state.lock().fail_part = Some((part_number, times));
    }

    /// Delay GETs whose range starts at `start` by `ms` milliseconds.
    pub fn delay_range(&self, start: u64, ms: u64) {
        self.state.lock().get_delays.insert(start, ms);
    }

    /// GETs whose range starts at `start` fail with a request error.
    pub fn fail_range(&self, start: u64) {
        self.state.lock().fail_range_starts.push(start);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn get_ranges(&self) -> Vec<Option<String>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Get { range } => Some(range),
                _ => None,
            })
            .collect()
    }

    pub fn count_gets(&self) -> usize {
        self.get_ranges().len()
    }

    pub fn count_puts(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Put { .. }))
            .count()
    }

    pub fn count_creates(&self) -> usize {
        self.ops().iter().filter(|op| matches!(op, Op::Create)).count()
    }

    pub fn count_upload_parts(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::UploadPart { .. }))
            .count()
    }

    pub fn count_completes(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Complete { .. }))
            .count()
    }

    pub fn count_aborts(&self) -> usize {
        self.ops().iter().filter(|op| matches!(op, Op::Abort)).count()
    }

    pub fn uploaded_part_sizes(&self) -> Vec<usize> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::UploadPart { len, .. } => Some(len),
                _ => None,
            })
            .collect()
    }

    /// Upload IDs of sessions that were aborted.
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.aborted.lock().clone()
    }

    /// Upload IDs of sessions still open (neither completed nor aborted).
    pub fn open_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }

    fn check_canceled(&self) -> Result<(), ClientError> {
        if self.cancel_all {
            Err(ClientError::canceled())
        } else {
            Ok(())
        }
    }
}

impl InMemoryStore {
    fn next_upload_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

fn parse_byte_range(range: &str) -> Option<(u64, u64)> {
    let rest = range.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn checksum_for(algorithm: Option<ChecksumAlgorithm>, part_number: u32) -> UploadPartOutput {
    let mut out = UploadPartOutput {
        etag: Some(format!("\"etag-{part_number}\"")),
        ..Default::default()
    };
    match algorithm {
        Some(ChecksumAlgorithm::Crc32) => out.checksum_crc32 = Some(format!("crc32-{part_number}")),
        Some(ChecksumAlgorithm::Crc32c) => {
            out.checksum_crc32c = Some(format!("crc32c-{part_number}"))
        }
        Some(ChecksumAlgorithm::Sha1) => out.checksum_sha1 = Some(format!("sha1-{part_number}")),
        Some(ChecksumAlgorithm::Sha256) => {
            out.checksum_sha256 = Some(format!("sha256-{part_number}"))
        }
        None => {}
    }
    out
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_object(&self, input: GetObjectInput) -> Result<GetObjectOutput, ClientError> {
        self.check_canceled()?;
        self.record(Op::Get {
            range: input.range.clone(),
        });

        let (data, interrupt, delay) = {
            let mut state = self.state.lock();
            let data = state
                .objects
                .get(&(input.bucket.clone(), input.key.clone()))
                .cloned()
                .ok_or_else(|| ClientError::not_found("no such key"))?;
            let requested_start = input.range.as_deref().and_then(parse_byte_range);
            if let Some((start, _)) = requested_start {
                if state.fail_range_starts.contains(&start) {
                    return Err(ClientError::request_failure(500, "injected range failure"));
                }
            }
            let interrupt = if state.interrupt_bodies > 0 {
                state.interrupt_bodies -= 1;
                true
            } else {
                false
            };
            let delay = requested_start.and_then(|(start, _)| state.get_delays.get(&start).copied());
            (data, interrupt, delay)
        };

        if let Some(ms) = delay {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }

        let len = data.len() as u64;
        let (slice, content_range) = match input.range.as_deref() {
            None => (data, None),
            Some(range) => {
                let (start, end) = parse_byte_range(range)
                    .ok_or_else(|| ClientError::other(format!("bad range {range:?}")))?;
                if start >= len {
                    return Err(ClientError::range_not_satisfiable());
                }
                let end = end.min(len - 1);
                let slice = data.slice(start as usize..=end as usize);
                let reported_start = if self.misreport_ranges { start + 1 } else { start };
                let content_range = if self.hide_total {
                    format!("bytes {reported_start}-{end}/*")
                } else {
                    format!("bytes {reported_start}-{end}/{len}")
                };
                (slice, Some(content_range))
            }
        };

        let content_length = slice.len() as u64;
        let body = if interrupt {
            let half = slice.slice(..slice.len() / 2);
            ObjectBody::from_stream(futures::stream::iter([
                Ok(half),
                Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset mid-body",
                )),
            ]))
        } else if slice.len() > 1 {
            // Two chunks, so the drain loop actually loops.
            let mid = slice.len() / 2;
            ObjectBody::from_stream(futures::stream::iter([
                Ok(slice.slice(..mid)),
                Ok(slice.slice(mid..)),
            ]))
        } else {
            ObjectBody::from_bytes(slice)
        };

        Ok(GetObjectOutput {
            body,
            content_length,
            content_range,
            etag: Some("\"etag\"".to_string()),
        })
    }

    async fn put_object(&self, input: PutObjectInput) -> Result<PutObjectOutput, ClientError> {
        self.check_canceled()?;
        self.record(Op::Put {
            len: input.body.len(),
        });
        self.state
            .lock()
            .objects
            .insert((input.bucket, input.key), input.body);
        Ok(PutObjectOutput {
            etag: Some("\"etag-put\"".to_string()),
            ..Default::default()
        })
    }

    async fn create_multipart_upload(
        &self,
        input: CreateMultipartUploadInput,
    ) -> Result<CreateMultipartUploadOutput, ClientError> {
        self.check_canceled()?;
        self.record(Op::Create);
        let upload_id = self.next_upload_id();
        self.state.lock().uploads.insert(
            upload_id.clone(),
            UploadSession {
                bucket: input.bucket,
                key: input.key,
                parts: BTreeMap::new(),
                checksum_algorithm: input.checksum_algorithm,
            },
        );
        Ok(CreateMultipartUploadOutput { upload_id })
    }

    async fn upload_part(&self, input: UploadPartInput) -> Result<UploadPartOutput, ClientError> {
        self.check_canceled()?;
        self.record(Op::UploadPart {
            part_number: input.part_number,
            len: input.body.len(),
        });

        let mut state = self.state.lock();
        if let Some((fail_number, remaining)) = state.fail_part {
            if fail_number == input.part_number && remaining > 0 {
                state.fail_part = Some((fail_number, remaining - 1));
                return Err(ClientError::request_failure(500, "injected part failure"));
            }
        }
        let session = state
            .uploads
            .get_mut(&input.upload_id)
            .ok_or_else(|| ClientError::not_found("no such upload"))?;
        let algorithm = session.checksum_algorithm;
        session.parts.insert(input.part_number, input.body);
        Ok(checksum_for(algorithm, input.part_number))
    }

    async fn complete_multipart_upload(
        &self,
        input: CompleteMultipartUploadInput,
    ) -> Result<CompleteMultipartUploadOutput, ClientError> {
        self.check_canceled()?;
        self.record(Op::Complete {
            parts: input.parts.len(),
        });

        let mut state = self.state.lock();
        let session = state
            .uploads
            .remove(&input.upload_id)
            .ok_or_else(|| ClientError::not_found("no such upload"))?;

        // The engine must hand over an ascending, gap-free part list.
        for (i, part) in input.parts.iter().enumerate() {
            if part.part_number != (i + 1) as u32 {
                return Err(ClientError::other(format!(
                    "parts out of order: slot {i} has part number {}",
                    part.part_number
                )));
            }
        }

        let mut assembled = Vec::new();
        for bytes in session.parts.values() {
            assembled.extend_from_slice(bytes);
        }
        state
            .objects
            .insert((session.bucket.clone(), session.key.clone()), assembled.into());

        Ok(CompleteMultipartUploadOutput {
            etag: Some(format!("\"etag-{}-parts\"", input.parts.len())),
            location: Some(format!(
                "https://{}.example.com/{}",
                session.bucket, session.key
            )),
            ..Default::default()
        })
    }

    async fn abort_multipart_upload(
        &self,
        input: AbortMultipartUploadInput,
    ) -> Result<(), ClientError> {
        self.check_canceled()?;
        self.record(Op::Abort);
        if self.fail_abort {
            return Err(ClientError::request_failure(500, "injected abort failure"));
        }
        self.state.lock().uploads.remove(&input.upload_id);
        self.aborted.lock().push(input.upload_id);
        Ok(())
    }

    async fn head_bucket(&self, _input: HeadBucketInput) -> Result<HeadBucketOutput, ClientError> {
        self.check_canceled()?;
        self.record(Op::HeadBucket);
        Ok(HeadBucketOutput {
            bucket_region: self.bucket_region.clone(),
        })
    }

    async fn delete_objects(
        &self,
        input: DeleteObjectsInput,
    ) -> Result<DeleteObjectsOutput, ClientError> {
        self.check_canceled()?;
        self.record(Op::DeleteObjects {
            keys: input.objects.iter().map(|o| o.key.clone()).collect(),
        });

        let mut state = self.state.lock();
        let mut errors = Vec::new();
        for object in input.objects {
            if self.delete_error_keys.contains(&object.key) {
                errors.push(DeleteObjectsError {
                    key: Some(object.key),
                    message: Some("access denied".to_string()),
                });
                continue;
            }
            state
                .objects
                .remove(&(input.bucket.clone(), object.key.clone()));
        }
        Ok(DeleteObjectsOutput { errors })
    }

    async fn list_objects(
        &self,
        input: ListObjectsInput,
    ) -> Result<ListObjectsOutput, ClientError> {
        self.check_canceled()?;
        self.record(Op::List);

        let state = self.state.lock();
        let mut keys: Vec<(String, u64)> = state
            .objects
            .iter()
            .filter(|((bucket, key), _)| {
                *bucket == input.bucket
                    && input
                        .prefix
                        .as_deref()
                        .map(|prefix| key.starts_with(prefix))
                        .unwrap_or(true)
            })
            .map(|((_, key), data)| (key.clone(), data.len() as u64))
            .collect();
        keys.sort();

        let start = match &input.continuation_token {
            Some(token) => keys.iter().position(|(key, _)| key > token).unwrap_or(keys.len()),
            None => 0,
        };
        let page_size = input.max_keys.unwrap_or(self.list_page_size);
        let page: Vec<_> = keys[start..].iter().take(page_size).collect();
        let truncated = start + page.len() < keys.len();
        let next_token = if truncated {
            page.last().map(|(key, _)| key.clone())
        } else {
            None
        };

        Ok(ListObjectsOutput {
            contents: page
                .into_iter()
                .map(|(key, size)| ObjectSummary {
                    key: key.clone(),
                    size: *size,
                })
                .collect(),
            next_continuation_token: next_token,
            is_truncated: truncated,
        })
    }
}

/// Deterministic pseudo-random payload.
pub fn test_payload(len: usize) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(len as u64);
    (0..len).map(|_| rng.random()).collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
