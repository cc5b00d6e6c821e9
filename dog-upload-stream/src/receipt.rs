use serde::{Deserialize, Serialize};
use crate::{Destination, SessionId};

/// Backend confirmation that a multipart upload was assembled into one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub destination: Destination,
    pub session_id: SessionId,
    pub parts: u32,
    pub location: Option<String>,
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub completed_at: i64,
}

impl UploadReceipt {
    /// Create a new receipt stamped with the current time
    pub fn new(destination: Destination, session_id: SessionId, parts: u32) -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        Self {
            destination,
            session_id,
            parts,
            location: None,
            etag: None,
            version_id: None,
            completed_at: now,
        }
    }

    /// Set location
    pub fn with_location<S: Into<String>>(mut self, location: S) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set etag
    pub fn with_etag<S: Into<String>>(mut self, etag: S) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Set version id
    pub fn with_version_id<S: Into<String>>(mut self, version_id: S) -> Self {
        self.version_id = Some(version_id.into());
        self
    }
}
