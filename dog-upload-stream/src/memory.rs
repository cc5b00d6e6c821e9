use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::client::{AbortUploadRequest, CompleteUploadRequest, CreatedUpload, UploadPartRequest, UploadedPart};
use crate::{BlobError, BlobResult, Destination, SessionId, StorageClient, UploadReceipt};

/// Highest part number a multipart upload accepts
const MAX_PART_NUMBER: u32 = 10_000;

/// In-memory multipart backend for testing and development.
///
/// Cloning shares the underlying state, so a test can keep one handle for
/// inspection while an adapter owns another.
#[derive(Clone, Default)]
pub struct MemoryStorageClient {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    /// In-progress uploads indexed by session id
    uploads: RwLock<HashMap<SessionId, PendingUpload>>,

    /// Assembled objects: (bucket, key) -> object
    objects: RwLock<HashMap<(String, String), StoredObject>>,

    /// Every call in the order it was received
    calls: Mutex<Vec<StorageCall>>,

    faults: Mutex<FaultPlan>,
}

struct PendingUpload {
    destination: Destination,
    parts: BTreeMap<u32, StoredPart>,
}

struct StoredPart {
    etag: String,
    body: Bytes,
}

#[derive(Default)]
struct FaultPlan {
    fail_create: bool,
    fail_parts: HashSet<u32>,
    fail_complete: bool,
    fail_abort: bool,
    create_delay: Option<Duration>,
    part_delays: HashMap<u32, Duration>,
}

/// An object assembled from a completed upload
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub etag: String,
    pub content_type: Option<String>,
    pub parts: u32,
    pub last_modified: DateTime<Utc>,
}

/// Record of a call made against the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    CreateMultipartUpload { destination: Destination },
    UploadPart { session_id: SessionId, part_number: u32, size: usize },
    CompleteMultipartUpload { session_id: SessionId, part_numbers: Vec<u32> },
    AbortMultipartUpload { session_id: SessionId },
}

impl MemoryStorageClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every create call fail
    pub fn fail_create(&self) {
        self.inner.faults.lock().fail_create = true;
    }

    /// Make uploads of `part_number` fail
    pub fn fail_part(&self, part_number: u32) {
        self.inner.faults.lock().fail_parts.insert(part_number);
    }

    /// Make every complete call fail
    pub fn fail_complete(&self) {
        self.inner.faults.lock().fail_complete = true;
    }

    /// Make every abort call fail
    pub fn fail_abort(&self) {
        self.inner.faults.lock().fail_abort = true;
    }

    /// Hold create calls for `delay` before answering
    pub fn delay_create(&self, delay: Duration) {
        self.inner.faults.lock().create_delay = Some(delay);
    }

    /// Hold uploads of `part_number` for `delay` before answering
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.inner.faults.lock().part_delays.insert(part_number, delay);
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<StorageCall> {
        self.inner.calls.lock().clone()
    }

    /// Sizes of uploaded parts in call order
    pub fn part_sizes(&self) -> Vec<(u32, usize)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StorageCall::UploadPart { part_number, size, .. } => Some((part_number, size)),
                _ => None,
            })
            .collect()
    }

    /// Assembled object at `bucket`/`key`
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.inner
            .objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of uploads that were neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.inner.uploads.read().len()
    }

    fn record(&self, call: StorageCall) {
        self.inner.calls.lock().push(call);
    }

    fn content_etag(body: &[u8]) -> String {
        let mut hasher = DefaultHasher::new();
        body.hash(&mut hasher);
        format!("\"{:016x}\"", hasher.finish())
    }

    fn multipart_etag(etags: &[&str], parts: usize) -> String {
        let mut hasher = DefaultHasher::new();
        etags.hash(&mut hasher);
        format!("\"{:016x}-{}\"", hasher.finish(), parts)
    }
}

#[async_trait]
impl StorageClient for MemoryStorageClient {
    async fn create_multipart_upload(&self, destination: &Destination) -> BlobResult<CreatedUpload> {
        self.record(StorageCall::CreateMultipartUpload {
            destination: destination.clone(),
        });

        let (fail, delay) = {
            let faults = self.inner.faults.lock();
            (faults.fail_create, faults.create_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BlobError::backend_message("injected create failure"));
        }

        let session_id = SessionId(format!("mpu_{}", Uuid::new_v4().simple()));
        self.inner.uploads.write().insert(
            session_id.clone(),
            PendingUpload {
                destination: destination.clone(),
                parts: BTreeMap::new(),
            },
        );
        debug!(session_id = %session_id, destination = %destination, "Created in-memory multipart upload");

        Ok(CreatedUpload {
            session_id,
            destination: destination.clone(),
        })
    }

    async fn upload_part(&self, request: UploadPartRequest) -> BlobResult<UploadedPart> {
        self.record(StorageCall::UploadPart {
            session_id: request.session_id.clone(),
            part_number: request.part_number,
            size: request.body.len(),
        });

        let (fail, delay) = {
            let faults = self.inner.faults.lock();
            (
                faults.fail_parts.contains(&request.part_number),
                faults.part_delays.get(&request.part_number).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BlobError::backend_message(format!(
                "injected failure for part {}",
                request.part_number
            )));
        }

        if request.part_number == 0 || request.part_number > MAX_PART_NUMBER {
            return Err(BlobError::invalid(format!(
                "Invalid part number: {} (must be 1-{})",
                request.part_number, MAX_PART_NUMBER
            )));
        }

        let mut uploads = self.inner.uploads.write();
        let upload = uploads
            .get_mut(&request.session_id)
            .ok_or_else(|| BlobError::upload_not_found(request.session_id.as_str()))?;

        let etag = Self::content_etag(&request.body);
        upload.parts.insert(
            request.part_number,
            StoredPart {
                etag: etag.clone(),
                body: request.body,
            },
        );

        Ok(UploadedPart { etag })
    }

    async fn complete_multipart_upload(&self, request: CompleteUploadRequest) -> BlobResult<UploadReceipt> {
        self.record(StorageCall::CompleteMultipartUpload {
            session_id: request.session_id.clone(),
            part_numbers: request.parts.iter().map(|p| p.part_number).collect(),
        });

        if self.inner.faults.lock().fail_complete {
            return Err(BlobError::backend_message("injected complete failure"));
        }
        if request.parts.is_empty() {
            return Err(BlobError::invalid("Complete requires at least one part"));
        }
        if request.parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BlobError::invalid("Parts must be listed in ascending order"));
        }

        let mut uploads = self.inner.uploads.write();
        let upload = uploads
            .get(&request.session_id)
            .ok_or_else(|| BlobError::upload_not_found(request.session_id.as_str()))?;

        let mut body = BytesMut::new();
        let mut etags = Vec::with_capacity(request.parts.len());
        for part in &request.parts {
            let stored = upload
                .parts
                .get(&part.part_number)
                .filter(|stored| stored.etag == part.etag)
                .ok_or_else(|| BlobError::invalid(format!("Missing or mismatched part {}", part.part_number)))?;
            body.extend_from_slice(&stored.body);
            etags.push(stored.etag.as_str());
        }

        let etag = Self::multipart_etag(&etags, etags.len());
        let destination = upload.destination.clone();
        uploads.remove(&request.session_id);
        drop(uploads);

        let parts = request.parts.len() as u32;
        self.inner.objects.write().insert(
            (destination.bucket.clone(), destination.key.clone()),
            StoredObject {
                body: body.freeze(),
                etag: etag.clone(),
                content_type: destination.content_type.clone(),
                parts,
                last_modified: Utc::now(),
            },
        );

        let location = format!("memory://{}/{}", destination.bucket, destination.key);
        Ok(UploadReceipt::new(destination, request.session_id, parts)
            .with_location(location)
            .with_etag(etag))
    }

    async fn abort_multipart_upload(&self, request: AbortUploadRequest) -> BlobResult<()> {
        self.record(StorageCall::AbortMultipartUpload {
            session_id: request.session_id.clone(),
        });

        if self.inner.faults.lock().fail_abort {
            return Err(BlobError::backend_message("injected abort failure"));
        }

        self.inner
            .uploads
            .write()
            .remove(&request.session_id)
            .map(|_| ())
            .ok_or_else(|| BlobError::upload_not_found(request.session_id.as_str()))
    }
}
