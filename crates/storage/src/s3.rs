//! S3 remote tier
//!
//! Object keys mirror the checkpoint layout under an optional prefix.
//! Shards above [`MULTIPART_THRESHOLD`] are uploaded in parts; everything
//! else is a single PUT, which S3 makes visible atomically.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use runtime_core::{Error, Result, RetryConfig};
use std::future::Future;
use tracing::{debug, instrument, warn};

use crate::StorageBackend;

/// Shards larger than this are uploaded in parts
const MULTIPART_THRESHOLD: usize = 16 * 1024 * 1024;

/// Part size for multipart uploads (S3 requires at least 5 MB)
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Connection settings for [`S3Storage`]
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub prefix: Option<String>,
    pub region: Option<String>,
    /// Custom endpoint (MinIO, LocalStack); implies path-style addressing
    pub endpoint: Option<String>,
}

/// S3-compatible remote tier
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
    retry: RetryConfig,
}

fn s3_error(operation: &str, e: impl std::fmt::Display) -> Error {
    Error::Storage {
        message: format!("S3 {} failed: {}", operation, e),
    }
}

/// Join `prefix` and `path` into an object key
fn object_key(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

impl S3Storage {
    /// Connect using the default AWS credential chain
    pub async fn connect(settings: S3Settings, retry: RetryConfig) -> Self {
        let region = settings.region.unwrap_or_else(|| "us-east-1".to_string());
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&shared);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket,
            prefix: settings.prefix.unwrap_or_default(),
            retry,
        }
    }

    fn key(&self, path: &str) -> String {
        object_key(&self.prefix, path)
    }

    fn strip_key<'a>(&self, key: &'a str) -> &'a str {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return key;
        }
        key.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(key)
    }

    /// Run `op`, retrying transient failures with backoff from `RetryConfig`
    async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying S3 operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload_in_parts(&self, key: &str, data: Bytes) -> Result<()> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error("create_multipart_upload", e))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| s3_error("create_multipart_upload", "no upload id returned"))?
            .to_string();

        let uploaded = self.upload_parts(key, &upload_id, &data).await;
        let parts = match uploaded {
            Ok(parts) => parts,
            Err(e) => {
                // Leave no half-assembled object or billed parts behind
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %abort, "Failed to abort multipart upload");
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| s3_error("complete_multipart_upload", e))?;
        Ok(())
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, data: &Bytes) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::with_capacity(data.len().div_ceil(PART_SIZE));
        for (index, start) in (0..data.len()).step_by(PART_SIZE).enumerate() {
            let part_number = index as i32 + 1;
            let chunk = data.slice(start..(start + PART_SIZE).min(data.len()));

            let output = self
                .with_retry("upload_part", || {
                    let chunk = chunk.clone();
                    async move {
                        self.client
                            .upload_part()
                            .bucket(&self.bucket)
                            .key(key)
                            .upload_id(upload_id)
                            .part_number(part_number)
                            .body(ByteStream::from(chunk))
                            .send()
                            .await
                            .map_err(|e| s3_error("upload_part", e))
                    }
                })
                .await?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(output.e_tag().map(String::from))
                    .build(),
            );
            debug!(key, part_number, "Uploaded part");
        }
        Ok(parts)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let key = self.key(path);
        let key = key.as_str();
        self.with_retry("get_object", || async move {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                        Error::StoragePathNotFound {
                            path: path.to_string(),
                        }
                    } else {
                        s3_error("get_object", e)
                    }
                })?;
            let body = output
                .body
                .collect()
                .await
                .map_err(|e| s3_error("get_object body", e))?;
            Ok(body.into_bytes())
        })
        .await
    }

    #[instrument(skip(self, data), fields(backend = "s3", bucket = %self.bucket, size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let key = self.key(path);
        let size = data.len() as u64;

        if data.len() > MULTIPART_THRESHOLD {
            self.upload_in_parts(&key, data).await?;
            return Ok(size);
        }

        self.with_retry("put_object", || {
            let data = data.clone();
            let key = key.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| s3_error("put_object", e))?;
                Ok(size)
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn delete(&self, path: &str) -> Result<()> {
        if !self.exists(path).await? {
            return Err(Error::StoragePathNotFound {
                path: path.to_string(),
            });
        }
        let key = self.key(path);
        let key = key.as_str();
        self.with_retry("delete_object", || async move {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| s3_error("delete_object", e))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.key(path);
        let key = key.as_str();
        self.with_retry("head_object", || async move {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
                Err(e) => Err(s3_error("head_object", e)),
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let key_prefix = self.key(prefix);
        let mut paths = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&key_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| s3_error("list_objects_v2", e))?;

            paths.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(|key| self.strip_key(key).to_string()),
            );

            match page.next_continuation_token() {
                Some(token) if page.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        paths.sort();
        debug!(count = paths.len(), "Listed S3 objects");
        Ok(paths)
    }
}
