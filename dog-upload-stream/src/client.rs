use async_trait::async_trait;
use bytes::Bytes;
use crate::{BlobResult, CompletedPart, Destination, SessionId, UploadReceipt};

/// Multipart primitives of a remote object store.
///
/// Each call either succeeds or fails terminally; retries and timeouts are the
/// implementation's business. Upload sessions never retry a failed call.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Initialize a multipart upload
    async fn create_multipart_upload(&self, destination: &Destination) -> BlobResult<CreatedUpload>;

    /// Upload one part and return its integrity tag
    async fn upload_part(&self, request: UploadPartRequest) -> BlobResult<UploadedPart>;

    /// Assemble the listed parts into the final object
    async fn complete_multipart_upload(&self, request: CompleteUploadRequest) -> BlobResult<UploadReceipt>;

    /// Abort the upload and release every stored part
    async fn abort_multipart_upload(&self, request: AbortUploadRequest) -> BlobResult<()>;
}

/// Result of initializing a multipart upload
#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub session_id: SessionId,
    pub destination: Destination,
}

/// One part of a multipart upload
#[derive(Debug, Clone)]
pub struct UploadPartRequest {
    pub destination: Destination,
    pub session_id: SessionId,
    pub part_number: u32,
    pub body: Bytes,
}

/// Tag issued for an uploaded part
#[derive(Debug, Clone)]
pub struct UploadedPart {
    pub etag: String,
}

/// Finalize request; `parts` are sorted by part number
#[derive(Debug, Clone)]
pub struct CompleteUploadRequest {
    pub destination: Destination,
    pub session_id: SessionId,
    pub parts: Vec<CompletedPart>,
}

/// Abort request for a backend-held session
#[derive(Debug, Clone)]
pub struct AbortUploadRequest {
    pub destination: Destination,
    pub session_id: SessionId,
}
