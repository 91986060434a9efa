//! S3 object store.
//!
//! Each stream is one multipart upload: every `write_all` uploads one part
//! straight away, `close` completes the upload and `abort` (or dropping the
//! stream) aborts it. Generations are S3 version ids, so the bucket must have
//! versioning enabled for overwrites to keep older content.

use super::{ObjectStore, ObjectStream, StoreError};
use crate::models::{Generation, StorageKey};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectVersion};
use tracing::{debug, warn};

fn backend(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{context}: {e}"))
}

/// Append the version ids of `key` from one listing page.
///
/// Listings are ordered by key and `key` sorts before every key it prefixes,
/// so once another key shows up there is nothing more to collect. Returns
/// `false` in that case.
fn collect_versions(page: &[ObjectVersion], key: &str, found: &mut Vec<Generation>) -> bool {
    for version in page {
        if version.key() != Some(key) {
            return false;
        }
        if let Some(id) = version.version_id() {
            found.push(Generation::new(id));
        }
    }
    true
}

#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the default AWS credential and region chain.
    pub async fn from_env() -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&aws_config))
    }
}

impl ObjectStore for S3Store {
    type Stream = S3Stream;

    async fn open(&self, bucket: &str, key: &StorageKey) -> Result<S3Stream, StoreError> {
        if bucket.is_empty() {
            return Err(StoreError::InvalidBucket(bucket.to_string()));
        }
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| backend("create multipart upload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Backend("multipart upload without id".to_string()))?
            .to_string();
        debug!(%bucket, %key, %upload_id, "Started multipart upload");

        Ok(S3Stream {
            client: self.client.clone(),
            bucket: bucket.to_string(),
            key: key.as_str().to_string(),
            upload_id,
            parts: Vec::new(),
            finished: false,
        })
    }

    async fn generations(
        &self,
        bucket: &str,
        key: &StorageKey,
    ) -> Result<Vec<Generation>, StoreError> {
        let mut found = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;

        loop {
            let listed = self
                .client
                .list_object_versions()
                .bucket(bucket)
                .prefix(key.as_str())
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take())
                .send()
                .await
                .map_err(|e| backend("list object versions", e))?;

            let same_key = collect_versions(listed.versions(), key.as_str(), &mut found);
            if !same_key || !listed.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = listed.next_key_marker().map(str::to_owned);
            version_marker = listed.next_version_id_marker().map(str::to_owned);
            if key_marker.is_none() {
                break;
            }
        }

        // S3 lists newest first.
        found.reverse();
        Ok(found)
    }

    async fn read(
        &self,
        bucket: &str,
        key: &StorageKey,
        generation: &Generation,
    ) -> Result<Vec<u8>, StoreError> {
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key.as_str())
            .version_id(generation.as_str())
            .send()
            .await
            .map_err(|e| backend("get object", e))?;
        let data = object
            .body
            .collect()
            .await
            .map_err(|e| backend("read object body", e))?;
        Ok(data.into_bytes().to_vec())
    }
}

#[derive(Debug)]
pub struct S3Stream {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    finished: bool,
}

impl S3Stream {
    async fn upload_part(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        let part_number = self.parts.len() as i32 + 1;
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(buf.to_vec()))
            .send()
            .await
            .map_err(|e| backend("upload part", e))?;
        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(uploaded.e_tag().map(str::to_owned))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }
}

impl ObjectStream for S3Stream {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        if buf.is_empty() {
            return Ok(());
        }
        self.upload_part(buf).await
    }

    async fn close(mut self) -> Result<Generation, StoreError> {
        // A multipart upload needs at least one part, even for an empty object.
        if self.parts.is_empty() {
            self.upload_part(&[]).await?;
        }
        let parts = std::mem::take(&mut self.parts);
        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| backend("complete multipart upload", e))?;
        self.finished = true;

        match completed.version_id() {
            Some(version) => Ok(Generation::new(version)),
            None => {
                warn!(
                    bucket = %self.bucket,
                    key = %self.key,
                    "Bucket has versioning disabled; using the ETag as generation"
                );
                Ok(Generation::new(completed.e_tag().unwrap_or("null")))
            }
        }
    }

    async fn abort(mut self) {
        self.finished = true;
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            warn!(upload_id = %self.upload_id, error = %e, "Failed to abort multipart upload");
        }
    }
}

impl Drop for S3Stream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(upload_id = %self.upload_id, "No runtime to abort dropped multipart upload");
            return;
        };
        let request = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id);
        let upload_id = self.upload_id.clone();
        handle.spawn(async move {
            if let Err(e) = request.send().await {
                warn!(%upload_id, error = %e, "Failed to abort dropped multipart upload");
            }
        });
    }
}
