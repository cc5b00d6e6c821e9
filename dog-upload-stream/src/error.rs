use thiserror::Error;

/// Result type for storage client calls
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors returned by a storage client for a single remote call
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Multipart upload not found: {session_id}")]
    UploadNotFound { session_id: String },

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BlobError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create a backend error from a plain message
    pub fn backend_message<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            source: message.into().into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an upload not found error
    pub fn upload_not_found<S: Into<String>>(session_id: S) -> Self {
        Self::UploadNotFound {
            session_id: session_id.into(),
        }
    }
}

/// Terminal failure of an upload session.
///
/// A session reports exactly one of these through its `error` event. When a
/// backend session already exists the failure is compensated with an abort
/// call; if that call fails too, the original cause is kept and the abort
/// failure is attached as [`UploadError::AbortFailed`].
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to initialize multipart upload: {source}")]
    Initialization {
        #[source]
        source: BlobError,
    },

    #[error("Failed to upload part {part_number}: {source}")]
    PartUpload {
        part_number: u32,
        #[source]
        source: BlobError,
    },

    #[error("Failed to complete multipart upload: {source}")]
    Completion {
        #[source]
        source: BlobError,
    },

    #[error("Upload session dropped before end of input")]
    Abandoned,

    /// Refused before any session was opened
    #[error("Upload request rejected: {source}")]
    Invalid {
        #[source]
        source: BlobError,
    },

    #[error("Upload source failed: {source}")]
    Source {
        #[source]
        source: std::io::Error,
    },

    #[error("{cause}\n Additionally failed to abort the multipart upload: {abort}")]
    AbortFailed {
        cause: Box<UploadError>,
        #[source]
        abort: BlobError,
    },
}

impl UploadError {
    /// The failure that terminated the session, ignoring any abort failure
    pub fn root_cause(&self) -> &UploadError {
        match self {
            Self::AbortFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Whether the compensating abort call itself failed
    pub fn abort_failed(&self) -> bool {
        matches!(self, Self::AbortFailed { .. })
    }

    /// Attach a failed abort to this error
    pub(crate) fn with_abort_failure(self, abort: BlobError) -> Self {
        Self::AbortFailed {
            cause: Box::new(self),
            abort,
        }
    }
}
