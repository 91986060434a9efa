//! Versioned object store on the local filesystem.
//!
//! # Layout
//!
//! ```text
//! root/
//! └── fetched/                      # bucket
//!     └── api.example.com/
//!         └── users/
//!             ├── x/
//!             │   ├── @generations/
//!             │   │   ├── 1735689600000000
//!             │   │   └── 1735689601000000
//!             │   └── followers/
//!             │       └── @generations/
//!             │           └── 1735689602000000
//! ```
//!
//! Every bucket and key segment is percent-encoded, so `@generations` can
//! never clash with a real segment, `..` cannot climb out of the root and a
//! key may be both an object and a prefix of other keys. Empty, `.` and `..`
//! segments get escapes that the encoder never produces.
//!
//! While a write is in flight its bytes go straight to `<generation>.part`;
//! `close` syncs and renames it into place.

use super::{ObjectStore, ObjectStream, StoreError};
use crate::models::{Generation, StorageKey};
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const GENERATIONS_DIR: &str = "@generations";
const PART_SUFFIX: &str = ".part";
/// Attempts to claim a generation number when concurrent writers collide.
const CLAIM_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

fn encode_segment(segment: &str) -> String {
    match segment {
        "" => "%".to_string(),
        "." => "%.".to_string(),
        ".." => "%..".to_string(),
        s => urlencoding::encode(s).into_owned(),
    }
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_suffix(PART_SUFFIX).unwrap_or(name).parse().ok()
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn generations_dir(&self, bucket: &str, key: &StorageKey) -> Result<PathBuf, StoreError> {
        if bucket.is_empty() || bucket.contains('/') {
            return Err(StoreError::InvalidBucket(bucket.to_string()));
        }
        let mut dir = self.root.join(encode_segment(bucket));
        for segment in key.segments() {
            dir.push(encode_segment(segment));
        }
        dir.push(GENERATIONS_DIR);
        Ok(dir)
    }

    /// Highest generation present in `dir`, finished or in flight.
    async fn last_generation(dir: &Path) -> Result<Option<u64>, StoreError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut last = None;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(n) = entry.file_name().to_str().and_then(parse_generation) {
                last = last.max(Some(n));
            }
        }
        Ok(last)
    }
}

impl ObjectStore for FsStore {
    type Stream = FsStream;

    async fn open(&self, bucket: &str, key: &StorageKey) -> Result<FsStream, StoreError> {
        let dir = self.generations_dir(bucket, key)?;
        fs::create_dir_all(&dir).await?;

        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut candidate = match Self::last_generation(&dir).await? {
            Some(last) if last >= now => last + 1,
            _ => now,
        };

        for _ in 0..CLAIM_ATTEMPTS {
            let part_path = dir.join(format!("{candidate}{PART_SUFFIX}"));
            let final_path = dir.join(candidate.to_string());
            if fs::try_exists(&final_path).await? {
                candidate += 1;
                continue;
            }
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&part_path)
                .await
            {
                Ok(file) => {
                    debug!(path = %part_path.display(), "Opened object stream");
                    return Ok(FsStream {
                        file: Some(file),
                        part_path,
                        final_path,
                        generation: candidate,
                        finished: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => candidate += 1,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Backend(format!(
            "could not claim a generation for {bucket}/{key} after {CLAIM_ATTEMPTS} attempts"
        )))
    }

    async fn generations(
        &self,
        bucket: &str,
        key: &StorageKey,
    ) -> Result<Vec<Generation>, StoreError> {
        let dir = self.generations_dir(bucket, key)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(PART_SUFFIX) {
                continue;
            }
            if let Ok(n) = name.parse::<u64>() {
                found.push(n);
            }
        }
        found.sort_unstable();
        Ok(found.into_iter().map(Generation::from).collect())
    }

    async fn read(
        &self,
        bucket: &str,
        key: &StorageKey,
        generation: &Generation,
    ) -> Result<Vec<u8>, StoreError> {
        let not_found = || StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.clone(),
            generation: generation.clone(),
        };
        let n: u64 = generation.as_str().parse().map_err(|_| not_found())?;
        let path = self.generations_dir(bucket, key)?.join(n.to_string());
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-flight write to `<generation>.part`.
#[derive(Debug)]
pub struct FsStream {
    file: Option<fs::File>,
    part_path: PathBuf,
    final_path: PathBuf,
    generation: u64,
    finished: bool,
}

impl ObjectStream for FsStream {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Backend("write after close".to_string()))?;
        file.write_all(buf).await?;
        file.flush().await?;
        Ok(())
    }

    async fn close(mut self) -> Result<Generation, StoreError> {
        let file = self
            .file
            .take()
            .ok_or_else(|| StoreError::Backend("stream already closed".to_string()))?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&self.part_path, &self.final_path).await?;
        self.finished = true;
        debug!(path = %self.final_path.display(), "Committed object");
        Ok(Generation::from(self.generation))
    }

    async fn abort(mut self) {
        drop(self.file.take());
        if let Err(e) = fs::remove_file(&self.part_path).await {
            warn!(path = %self.part_path.display(), error = %e, "Failed to remove aborted part file");
        }
        self.finished = true;
    }
}

impl Drop for FsStream {
    fn drop(&mut self) {
        if !self.finished {
            drop(self.file.take());
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}
