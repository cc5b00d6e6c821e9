use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::{
    BlobResult, ByteStream, Destination, StorageClient, UploadConfig, UploadError, UploadEvent,
    UploadEvents, UploadReceipt, UploadSession,
};

/// Entry point for streaming uploads - embed one per storage backend
#[derive(Clone)]
pub struct UploadAdapter {
    client: Arc<dyn StorageClient>,
    config: UploadConfig,
}

impl UploadAdapter {
    /// Create a new upload adapter
    pub fn new<C: StorageClient + 'static>(client: C, config: UploadConfig) -> Self {
        Self {
            client: Arc::new(client),
            config,
        }
    }

    /// Create from a client that is shared with other components
    pub fn from_shared(client: Arc<dyn StorageClient>, config: UploadConfig) -> Self {
        Self { client, config }
    }

    /// Open a session that streams into `destination`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn upload(&self, destination: Destination) -> BlobResult<(UploadSession, UploadEvents)> {
        destination.validate()?;
        info!(destination = %destination, "Opening upload session");
        UploadSession::open(self.client.clone(), destination, &self.config)
    }

    /// Pipe a byte stream into a new session and wait for the assembled object.
    ///
    /// Reading stops as soon as the session fails. If the source itself fails
    /// the session is abandoned, which aborts the backend upload.
    pub async fn upload_stream(&self, destination: Destination, mut body: ByteStream) -> Result<UploadReceipt, UploadError> {
        let (session, mut events) = self
            .upload(destination)
            .map_err(|source| UploadError::Invalid { source })?;

        loop {
            let next = tokio::select! {
                biased;
                event = events.recv() => Piped::Event(event),
                chunk = body.next() => Piped::Chunk(chunk),
            };

            match next {
                Piped::Event(Some(UploadEvent::Part(part))) => {
                    debug!(part_number = part.part_number, "Part uploaded");
                }
                Piped::Event(Some(UploadEvent::Uploaded(receipt))) => return Ok(receipt),
                Piped::Event(Some(UploadEvent::Error(err))) => return Err(err),
                Piped::Event(None) => return Err(UploadError::Abandoned),
                Piped::Chunk(Some(Ok(chunk))) => session.write(chunk),
                Piped::Chunk(Some(Err(source))) => {
                    warn!(error = %source, "Upload source failed, abandoning session");
                    drop(session);
                    if let Err(err) = events.outcome().await {
                        if err.abort_failed() {
                            error!(error = %err, "Abandoned upload was not cleaned up");
                        }
                    }
                    return Err(UploadError::Source { source });
                }
                Piped::Chunk(None) => {
                    session.end();
                    return events.outcome().await;
                }
            }
        }
    }

    /// Get configuration
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }
}

enum Piped {
    Event(Option<UploadEvent>),
    Chunk(Option<std::io::Result<bytes::Bytes>>),
}
