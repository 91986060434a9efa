//! In-process object store.
//!
//! Used for dry runs (`--store memory`) and tests. Clones share the same
//! objects.

use super::{ObjectStore, ObjectStream, StoreError};
use crate::models::{Generation, StorageKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type ObjectId = (String, StorageKey);

#[derive(Debug, Default)]
struct Objects {
    last_generation: u64,
    versions: HashMap<ObjectId, Vec<(Generation, Vec<u8>)>>,
    open_streams: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Objects>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, Objects> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Streams opened and not yet closed, aborted or dropped.
    #[cfg(test)]
    pub fn open_streams(&self) -> usize {
        self.objects().open_streams
    }

    /// Number of completed writes across all keys.
    #[cfg(test)]
    pub fn write_count(&self) -> usize {
        self.objects().versions.values().map(Vec::len).sum()
    }
}

impl ObjectStore for MemoryStore {
    type Stream = MemoryStream;

    async fn open(&self, bucket: &str, key: &StorageKey) -> Result<MemoryStream, StoreError> {
        if bucket.is_empty() {
            return Err(StoreError::InvalidBucket(bucket.to_string()));
        }
        self.objects().open_streams += 1;
        Ok(MemoryStream {
            store: self.clone(),
            id: (bucket.to_string(), key.clone()),
            buf: Vec::new(),
        })
    }

    async fn generations(
        &self,
        bucket: &str,
        key: &StorageKey,
    ) -> Result<Vec<Generation>, StoreError> {
        let objects = self.objects();
        Ok(objects
            .versions
            .get(&(bucket.to_string(), key.clone()))
            .map(|v| v.iter().map(|(g, _)| g.clone()).collect())
            .unwrap_or_default())
    }

    async fn read(
        &self,
        bucket: &str,
        key: &StorageKey,
        generation: &Generation,
    ) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects();
        objects
            .versions
            .get(&(bucket.to_string(), key.clone()))
            .and_then(|v| v.iter().find(|(g, _)| g == generation))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.clone(),
                generation: generation.clone(),
            })
    }
}

#[derive(Debug)]
pub struct MemoryStream {
    store: MemoryStore,
    id: ObjectId,
    buf: Vec<u8>,
}

impl ObjectStream for MemoryStream {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn close(mut self) -> Result<Generation, StoreError> {
        let data = std::mem::take(&mut self.buf);
        let id = self.id.clone();
        let mut objects = self.store.objects();
        objects.last_generation += 1;
        let generation = Generation::from(objects.last_generation);
        objects
            .versions
            .entry(id)
            .or_default()
            .push((generation.clone(), data));
        // Drop takes the lock again.
        drop(objects);
        Ok(generation)
    }

    async fn abort(self) {}
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        let mut objects = self.store.objects();
        objects.open_streams = objects.open_streams.saturating_sub(1);
    }
}
