use crate::{BlobError, BlobResult};

/// Environment variable overriding [`UploadConfig::min_part_size`]
pub const MIN_PART_SIZE_ENV: &str = "DOG_UPLOAD_MIN_PART_SIZE";

/// Smallest part the multipart contract accepts for every part but the last
pub const DEFAULT_MIN_PART_SIZE: u64 = 100 * 1024; // 100KB

/// Configuration for streaming upload sessions
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// A part is flushed once more than this many bytes are buffered.
    /// The final part and the first part after initialization may be smaller.
    pub min_part_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_part_size: DEFAULT_MIN_PART_SIZE,
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the config from the environment, falling back to defaults
    pub fn from_env() -> BlobResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> BlobResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(MIN_PART_SIZE_ENV) {
            config.min_part_size = raw.trim().parse().map_err(|_| {
                BlobError::invalid(format!("{} must be a byte count, got {:?}", MIN_PART_SIZE_ENV, raw))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the flush threshold
    pub fn with_min_part_size(mut self, bytes: u64) -> Self {
        self.min_part_size = bytes;
        self
    }

    /// Reject configurations no session can run with
    pub fn validate(&self) -> BlobResult<()> {
        if self.min_part_size == 0 {
            return Err(BlobError::invalid("min_part_size must be greater than zero"));
        }
        Ok(())
    }
}
