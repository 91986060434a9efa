//! Object writer: copy one fetched body into the store under a deadline.

use crate::config::ConfigError;
use crate::models::{Generation, StorageKey};
use crate::store::{ObjectStore, ObjectStream, StoreError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

/// Write stage failure for one object.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no content to write for {key}; an upstream fetch failure was not filtered out")]
    EmptyContent { key: StorageKey },
    #[error("write of {bucket}/{key} exceeded its {}s budget", .budget.as_secs_f64())]
    Timeout {
        bucket: String,
        key: StorageKey,
        budget: Duration,
    },
    #[error("write of {bucket}/{key} failed: {source}")]
    Store {
        bucket: String,
        key: StorageKey,
        #[source]
        source: StoreError,
    },
}

/// Writes whole objects through an [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct ObjectWriter<S> {
    store: S,
    budget: Duration,
}

impl<S: ObjectStore> ObjectWriter<S> {
    /// `budget` bounds the whole write: stream open, copy and close.
    pub fn new(store: S, budget: Duration) -> Self {
        Self { store, budget }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Store `content` as a new generation of `bucket/key`.
    ///
    /// `None` content is refused rather than written as an empty object; an
    /// empty slice is a legitimate empty object. Existing generations of the
    /// key are left untouched.
    #[instrument(level = "info", skip_all, fields(%bucket, %key))]
    pub async fn write(
        &self,
        bucket: &str,
        key: &StorageKey,
        content: Option<&[u8]>,
    ) -> Result<Generation, WriteError> {
        if bucket.trim().is_empty() {
            return Err(ConfigError::MissingBucket.into());
        }
        let Some(content) = content else {
            error!("Refusing to write missing content");
            return Err(WriteError::EmptyContent { key: key.clone() });
        };

        let t0 = Instant::now();
        match timeout(self.budget, self.copy(bucket, key, content)).await {
            Ok(Ok(generation)) => {
                debug!(
                    %generation,
                    bytes = content.len(),
                    elapsed_ms = t0.elapsed().as_millis() as u64,
                    "Saved"
                );
                Ok(generation)
            }
            Ok(Err(source)) => {
                error!(error = %source, "Write failed");
                Err(WriteError::Store {
                    bucket: bucket.to_string(),
                    key: key.clone(),
                    source,
                })
            }
            Err(_) => {
                warn!(budget_ms = self.budget.as_millis() as u64, "Write timed out");
                Err(WriteError::Timeout {
                    bucket: bucket.to_string(),
                    key: key.clone(),
                    budget: self.budget,
                })
            }
        }
    }

    /// Open, copy in one pass, close. A failed copy aborts the stream; a
    /// timeout drops it mid-flight, which releases it as well.
    async fn copy(
        &self,
        bucket: &str,
        key: &StorageKey,
        content: &[u8],
    ) -> Result<Generation, StoreError> {
        let mut stream = self.store.open(bucket, key).await?;
        if let Err(e) = stream.write_all(content).await {
            stream.abort().await;
            return Err(e);
        }
        stream.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{FailingStore, StallingStore};

    fn key() -> StorageKey {
        StorageKey::new("api.example.com/users/x")
    }

    #[tokio::test]
    async fn test_write_creates_new_generation_each_time() {
        let writer = ObjectWriter::new(MemoryStore::new(), Duration::from_secs(5));
        let first = writer.write("fetched", &key(), Some(b"{}")).await.unwrap();
        let second = writer.write("fetched", &key(), Some(b"{}")).await.unwrap();
        assert_ne!(first, second);

        let generations = writer.store().generations("fetched", &key()).await.unwrap();
        assert_eq!(generations, vec![first, second]);
    }

    #[tokio::test]
    async fn test_write_empty_slice_is_valid() {
        let writer = ObjectWriter::new(MemoryStore::new(), Duration::from_secs(5));
        let generation = writer.write("fetched", &key(), Some(&[])).await.unwrap();
        let data = writer.store().read("fetched", &key(), &generation).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_write_missing_content_refused() {
        let writer = ObjectWriter::new(MemoryStore::new(), Duration::from_secs(5));
        let err = writer.write("fetched", &key(), None).await.unwrap_err();
        assert!(matches!(err, WriteError::EmptyContent { .. }));
        assert_eq!(writer.store().write_count(), 0);
        assert_eq!(writer.store().open_streams(), 0);
    }

    #[tokio::test]
    async fn test_write_missing_bucket() {
        let writer = ObjectWriter::new(MemoryStore::new(), Duration::from_secs(5));
        let err = writer.write("", &key(), Some(b"{}")).await.unwrap_err();
        assert!(matches!(err, WriteError::Config(ConfigError::MissingBucket)));
        assert_eq!(writer.store().open_streams(), 0);
    }

    #[tokio::test]
    async fn test_write_timeout_releases_stream() {
        let store = StallingStore::new();
        let writer = ObjectWriter::new(store.clone(), Duration::from_millis(50));
        let err = writer.write("fetched", &key(), Some(b"{}")).await.unwrap_err();
        assert!(matches!(err, WriteError::Timeout { .. }));
        assert_eq!(store.inner().open_streams(), 0);
        assert_eq!(store.inner().write_count(), 0);
    }

    #[tokio::test]
    async fn test_write_copy_failure_aborts_stream() {
        let store = FailingStore::failing_on(["api.example.com/users/x"]);
        let writer = ObjectWriter::new(store.clone(), Duration::from_secs(5));
        let err = writer.write("fetched", &key(), Some(b"{}")).await.unwrap_err();
        assert!(matches!(err, WriteError::Store { .. }));
        assert_eq!(store.aborted(), 1);
        assert_eq!(store.inner().open_streams(), 0);
        assert_eq!(store.inner().write_count(), 0);
    }
}
