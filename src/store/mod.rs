//! Versioned object storage backends.
//!
//! The pipeline talks to object storage through two small traits:
//!
//! - [`ObjectStore`]: opens write streams and reads back stored generations
//! - [`ObjectStream`]: one in-flight object write
//!
//! Every successful [`ObjectStream::close`] creates a new [`Generation`] of the
//! key, even when the key already exists. Older generations stay readable.
//! There is deliberately no delete operation.
//!
//! # Backends
//!
//! | Backend | Module | Generation |
//! |---------|--------|------------|
//! | In-process map | [`memory`] | store-wide counter |
//! | Local directory tree | [`fs`] | microsecond timestamp, increasing per key |
//! | S3 with bucket versioning | `s3` (feature `s3`) | S3 version id |

use crate::models::{Generation, StorageKey};
use thiserror::Error;

pub mod fs;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

pub use fs::FsStore;
pub use memory::MemoryStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg_attr(not(test), allow(dead_code))]
    #[error("object {bucket}/{key} (generation {generation}) not found")]
    NotFound {
        bucket: String,
        key: StorageKey,
        generation: Generation,
    },
    #[error("invalid bucket name {0:?}")]
    InvalidBucket(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A blob store addressed by `(bucket, key)` with per-write generations.
pub trait ObjectStore {
    type Stream: ObjectStream;

    /// Start writing a new generation of `bucket/key`.
    async fn open(&self, bucket: &str, key: &StorageKey) -> Result<Self::Stream, StoreError>;

    // The ingest path only writes; the read half is for inspection and tests.

    /// Completed generations of `bucket/key`, oldest first.
    #[cfg_attr(not(test), allow(dead_code))]
    async fn generations(
        &self,
        bucket: &str,
        key: &StorageKey,
    ) -> Result<Vec<Generation>, StoreError>;

    /// Content of one generation.
    #[cfg_attr(not(test), allow(dead_code))]
    async fn read(
        &self,
        bucket: &str,
        key: &StorageKey,
        generation: &Generation,
    ) -> Result<Vec<u8>, StoreError>;
}

/// One in-flight object write.
///
/// A stream that is dropped without `close` leaves no new generation behind
/// and releases whatever the backend acquired for it.
pub trait ObjectStream {
    /// Append `buf` to the object. Data is handed to the backend immediately.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StoreError>;

    /// Finish the object and return its new generation.
    async fn close(self) -> Result<Generation, StoreError>;

    /// Discard everything written so far.
    async fn abort(self);
}
