//! Object-store client, constructed per upload from the credentials the
//! control plane currently hands out.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};

/// Files larger than this go through the multipart path.
pub const MULTIPART_THRESHOLD: u64 = 10 * 1024 * 1024;
/// Multipart part size: 5 MiB.
pub const PART_SIZE: u64 = 5 * 1024 * 1024;
/// Presigned GET lifetime: 7 days, the SigV4 maximum.
pub const PRESIGN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const UPLOAD_CONTENT_TYPE: &str = "video/mp4";

/// Connection settings for one object store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Endpoint, with or without an `http[s]://` scheme
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

/// Ensure the endpoint carries a scheme; bare host:port defaults to http.
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// Metadata attached to every uploaded object.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub task_id: String,
    /// Upload timestamp, milliseconds since epoch
    pub timestamp: i64,
    /// Output duration in seconds
    pub duration: f64,
    /// Video bitrate in bits/second
    pub bitrate: u64,
    /// Output size in bytes
    pub size: u64,
    pub width: u32,
    pub height: u32,
}

impl ObjectMetadata {
    fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("taskId".to_string(), self.task_id.clone()),
            ("timestamp".to_string(), self.timestamp.to_string()),
            ("duration".to_string(), format!("{:.3}", self.duration)),
            ("bitrate".to_string(), self.bitrate.to_string()),
            ("size".to_string(), self.size.to_string()),
            ("width".to_string(), self.width.to_string()),
            ("height".to_string(), self.height.to_string()),
        ])
    }
}

/// What an upload hands back to the pipeline.
#[derive(Debug, Clone)]
pub struct UploadSummary {
    /// Presigned GET URL, valid for [`PRESIGN_TTL`]
    pub target_url: String,
    /// Verified object size in bytes
    pub size: u64,
}

/// Whether a file of `size` bytes takes the multipart path.
pub fn uses_multipart(size: u64) -> bool {
    size > MULTIPART_THRESHOLD
}

/// Number of parts a multipart upload of `size` bytes produces.
pub fn part_count(size: u64) -> u64 {
    size.div_ceil(PART_SIZE)
}

/// S3-compatible object store bound to one bucket.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
}

impl ObjectStore {
    /// Build a client from explicit credentials.
    pub fn connect(config: StoreConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "control-plane",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(normalize_endpoint(&config.endpoint))
            .region(Region::new("auto"))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket,
        }
    }

    /// Upload a local file and return its presigned URL.
    ///
    /// `on_progress` receives `(uploaded_bytes, percent)`; the multipart
    /// path calls it when the integer percent advances and always for the
    /// final part. Partial objects are removed on failure.
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        key: &str,
        metadata: ObjectMetadata,
        on_progress: impl Fn(u64, u8) + Send + Sync,
    ) -> StorageResult<UploadSummary> {
        let path = path.as_ref();
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) => {
                return Err(StorageError::invalid_source(format!(
                    "{} is empty",
                    path.display()
                )))
            }
            Err(e) => {
                return Err(StorageError::invalid_source(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let result = if uses_multipart(size) {
            self.upload_multipart(path, key, size, &metadata, &on_progress)
                .await
        } else {
            self.upload_single(path, key, &metadata).await
        };

        if let Err(e) = result {
            // Best-effort cleanup of whatever landed in the bucket.
            if let Err(del) = self.delete_object(key).await {
                warn!("Cleanup of partial object {} failed: {}", key, del);
            }
            return Err(e);
        }
        on_progress(size, 100);

        let remote = self.object_size(key).await?;
        if remote != size {
            let _ = self.delete_object(key).await;
            return Err(StorageError::VerifyFailed {
                local: size,
                remote,
            });
        }

        let target_url = self.presign_get(key, PRESIGN_TTL).await?;
        info!("Uploaded {} to {} ({} bytes)", path.display(), key, size);

        Ok(UploadSummary {
            target_url,
            size,
        })
    }

    /// Single-shot PUT for small files.
    async fn upload_single(
        &self,
        path: &Path,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<()> {
        debug!("Uploading {} to {} in one request", path.display(), key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(UPLOAD_CONTENT_TYPE)
            .set_metadata(Some(metadata.to_map()))
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        Ok(())
    }

    /// Multipart upload with per-part progress.
    async fn upload_multipart(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        metadata: &ObjectMetadata,
        on_progress: &(impl Fn(u64, u8) + Send + Sync),
    ) -> StorageResult<()> {
        let total_parts = part_count(size);
        debug!(
            "Uploading {} to {} in {} parts",
            path.display(),
            key,
            total_parts
        );

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(UPLOAD_CONTENT_TYPE)
            .set_metadata(Some(metadata.to_map()))
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::upload_failed("no upload id returned"))?
            .to_string();

        match self
            .upload_parts(path, key, size, total_parts, &upload_id, on_progress)
            .await
        {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| StorageError::upload_failed(e.to_string()))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("Abort of multipart upload {} failed: {}", key, abort);
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        total_parts: u64,
        upload_id: &str,
        on_progress: &(impl Fn(u64, u8) + Send + Sync),
    ) -> StorageResult<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut parts = Vec::with_capacity(total_parts as usize);
        let mut uploaded: u64 = 0;
        let mut last_percent: u8 = 0;

        for part_number in 1..=total_parts {
            let remaining = size - uploaded;
            let this_part = remaining.min(PART_SIZE) as usize;

            let mut buffer = vec![0u8; this_part];
            file.read_exact(&mut buffer).await?;

            let uploaded_part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number as i32)
                .body(ByteStream::from(buffer))
                .send()
                .await
                .map_err(|e| {
                    StorageError::upload_failed(format!("part {}: {}", part_number, e))
                })?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded_part.e_tag().map(str::to_string))
                    .part_number(part_number as i32)
                    .build(),
            );

            uploaded += this_part as u64;
            let percent = ((uploaded * 100) / size) as u8;
            let is_last = part_number == total_parts;
            if percent > last_percent || is_last {
                last_percent = percent;
                on_progress(uploaded, percent);
            }
        }

        Ok(parts)
    }

    /// Size of the stored object.
    async fn object_size(&self, key: &str) -> StorageResult<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(format!("head {}: {}", key, e)))?;

        Ok(head.content_length().unwrap_or(0) as u64)
    }

    /// Time-limited GET URL for the object.
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let presign_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    /// Delete an object.
    pub async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::DeleteFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalization() {
        assert_eq!(
            normalize_endpoint("minio.internal:9000"),
            "http://minio.internal:9000"
        );
        assert_eq!(
            normalize_endpoint("https://store.example.com/"),
            "https://store.example.com"
        );
        assert_eq!(
            normalize_endpoint("http://10.0.0.5:9000"),
            "http://10.0.0.5:9000"
        );
    }

    #[test]
    fn test_multipart_threshold_boundary() {
        // Exactly 10 MiB stays single-shot; one more byte goes multipart.
        assert!(!uses_multipart(MULTIPART_THRESHOLD));
        assert!(uses_multipart(MULTIPART_THRESHOLD + 1));
    }

    #[test]
    fn test_part_count() {
        assert_eq!(part_count(PART_SIZE), 1);
        assert_eq!(part_count(PART_SIZE + 1), 2);
        assert_eq!(part_count(3 * PART_SIZE), 3);
        assert_eq!(part_count(MULTIPART_THRESHOLD + 1), 3);
    }

    #[test]
    fn test_metadata_keys() {
        let map = ObjectMetadata {
            task_id: "t1".into(),
            timestamp: 1_700_000_000_000,
            duration: 61.5,
            bitrate: 1_200_000,
            size: 123,
            width: 1920,
            height: 1080,
        }
        .to_map();

        for key in ["taskId", "timestamp", "duration", "bitrate", "size", "width", "height"] {
            assert!(map.contains_key(key), "missing metadata key {}", key);
        }
        assert_eq!(map["duration"], "61.500");
    }
}
