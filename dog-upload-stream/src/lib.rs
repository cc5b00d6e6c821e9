//! # dog-upload-stream: Streaming multipart uploads
//!
//! `dog-upload-stream` turns a stream of bytes of unknown length into a
//! multipart upload against S3-compatible object storage. Data is pushed in as
//! it is produced; the session decides where parts begin and end, numbers
//! them, tracks the ones in flight and finalizes or aborts the upload.
//!
//! ## Key Features
//!
//! - **Unknown sizes**: No content length needed up front
//! - **Non-blocking sink**: `write`/`end` return immediately, uploads run in the background
//! - **Concurrent parts**: Many parts may be in flight; out-of-order acknowledgments are fine
//! - **Clean failure**: Any failed call aborts the backend upload and reports exactly one error
//! - **Storage agnostic**: Works with any backend implementing [`StorageClient`] (S3, memory, custom)
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_upload_stream::prelude::*;
//! use dog_upload_stream::MemoryStorageClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStorageClient::new();
//! let adapter = UploadAdapter::new(store.clone(), UploadConfig::default());
//!
//! let (session, mut events) = adapter.upload(Destination::new("media", "videos/intro.mp4"))?;
//! session.write(vec![0u8; 150 * 1024]);
//! session.write(b"trailer".to_vec());
//! session.end();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         UploadEvent::Part(part) => println!("part {} stored", part.part_number),
//!         UploadEvent::Uploaded(receipt) => println!("assembled {} parts", receipt.parts),
//!         UploadEvent::Error(err) => return Err(err.into()),
//!     }
//! }
//!
//! let object = store.object("media", "videos/intro.mp4").unwrap();
//! assert_eq!(object.body.len(), 150 * 1024 + 7);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Your producer   │  ← write(chunk) / end()
//! ├──────────────────┤
//! │  UploadSession   │  ← buffering, part boundaries, completion/abort
//! ├──────────────────┤
//! │  StorageClient   │  ← create / upload part / complete / abort
//! └──────────────────┘
//! ```
//!
//! Each session is driven by one background task that owns all session state,
//! so acknowledgments arriving in any order are applied one at a time.

mod adapter;
mod client;
mod config;
mod error;
mod events;
mod machine;
mod memory;
mod receipt;
mod s3;
mod session;
mod types;

// Re-export main types for clean API
pub use adapter::UploadAdapter;
pub use client::{
    AbortUploadRequest, CompleteUploadRequest, CreatedUpload, StorageClient, UploadPartRequest, UploadedPart,
};
pub use config::{UploadConfig, DEFAULT_MIN_PART_SIZE, MIN_PART_SIZE_ENV};
pub use error::{BlobError, BlobResult, UploadError};
pub use events::{UploadEvent, UploadEvents};
pub use memory::{MemoryStorageClient, StorageCall, StoredObject};
pub use receipt::UploadReceipt;
pub use s3::{S3Config, S3StorageClient};
pub use session::UploadSession;
pub use types::{ByteStream, CompletedPart, Destination, SessionId, UploadStatus};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobError, BlobResult, ByteStream, Destination, StorageClient, UploadAdapter, UploadConfig,
        UploadError, UploadEvent, UploadEvents, UploadReceipt, UploadSession,
    };
}
