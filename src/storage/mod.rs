/// Object Store Adapter
///
/// Wraps an S3-compatible object store (AWS S3, MinIO) behind a small
/// surface the rest of the pipeline depends on: put/get individual
/// objects, stream a whole output tree up, and presign a GET for the HLS
/// proxy's segment handler.
use crate::config::ObjectStoreConfig;
use crate::error::{AppError, Result};
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use std::time::Duration;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFFS_MS: [u64; 3] = [250, 1_000, 4_000];

#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
    presign_expiry: Duration,
}

/// A streaming GET result: the body plus whatever the upstream reported
/// about it, so the proxy can set `Content-Length` without a second call.
pub struct ObjectStream {
    pub body: ByteStream,
    pub content_length: Option<i64>,
}

impl ObjectStore {
    pub async fn new(config: &ObjectStoreConfig) -> Self {
        let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "transcode_pipeline",
            );
            builder = builder.credentials_provider(credentials);
        }

        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        let aws_config = builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }
        let client = Client::from_conf(s3_config_builder.build());

        Self {
            client,
            bucket: config.bucket.clone(),
            presign_expiry: Duration::from_secs(config.presign_expiry_secs),
        }
    }

    /// List the bucket with `max_keys=1` as a startup connectivity check.
    /// The service should refuse to start if this fails: every job
    /// depends on the object store being reachable.
    pub async fn health_check(&self) -> Result<()> {
        match self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
        {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, "object store connection validated");
                Ok(())
            }
            Err(e) => {
                let error_msg = e.to_string();
                let guidance = if error_msg.contains("InvalidAccessKeyId") {
                    "invalid access key id; check OBJECT_STORE_ACCESS_KEY_ID"
                } else if error_msg.contains("SignatureDoesNotMatch") {
                    "invalid secret access key; check OBJECT_STORE_SECRET_ACCESS_KEY"
                } else if error_msg.contains("NoSuchBucket") {
                    "bucket does not exist; check OBJECT_STORE_BUCKET"
                } else if error_msg.contains("AccessDenied") {
                    "access denied; ensure the credentials have list/get/put permissions"
                } else {
                    "object store health check failed; verify endpoint and credentials"
                };

                tracing::error!(
                    bucket = %self.bucket,
                    error = %error_msg,
                    guidance,
                    "object store health check failed"
                );

                Err(AppError::ObjectStoreError(format!(
                    "{error_msg}. {guidance}"
                )))
            }
        }
    }

    /// Retry transient failures (network errors, 5xx) with the standard
    /// backoff ladder; auth errors (4xx) fail immediately since a retry
    /// cannot fix them.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for (attempt, backoff_ms) in RETRY_BACKOFFS_MS.iter().enumerate().take(RETRY_ATTEMPTS as usize) {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_auth_error(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "object store operation failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                }
            }
        }
        Err(last_err.unwrap_or(AppError::ObjectStoreError("exhausted retries".to_string())))
    }

    /// Upload a single local file to `key`, inferring `Content-Type` from
    /// the extension.
    pub async fn put(&self, local_path: &Path, key: &str) -> Result<()> {
        if !local_path.exists() {
            return Err(AppError::ObjectStoreError(format!(
                "local file not found: {}",
                local_path.display()
            )));
        }
        let content_type = content_type_for(key);

        self.with_retry(|| async {
            let body = ByteStream::from_path(local_path)
                .await
                .map_err(|e| AppError::ObjectStoreError(format!("failed to read {}: {e}", local_path.display())))?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .content_type(content_type)
                .cache_control(cache_control_for(key))
                .send()
                .await
                .map_err(|e| classify_put_error(key, e))?;
            Ok(())
        })
        .await
    }

    /// Upload every file under `local_dir` to `prefix/<relative path>`,
    /// used once the encoder driver finishes writing a stage's output
    /// tree.
    pub async fn upload_tree(&self, local_dir: &Path, prefix: &str) -> Result<Vec<String>> {
        let mut uploaded = Vec::new();
        let mut stack = vec![local_dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| AppError::ObjectStoreError(format!("failed to read dir {}: {e}", dir.display())))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| AppError::ObjectStoreError(e.to_string()))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(local_dir)
                    .map_err(|e| AppError::Internal(e.to_string()))?;
                let key = format!("{prefix}/{}", relative.to_string_lossy());
                self.put(&path, &key).await?;
                uploaded.push(key);
            }
        }
        Ok(uploaded)
    }

    /// Download an object into memory, used by the HLS proxy when
    /// rewriting a (small) playlist file.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.with_retry(|| async {
            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify_get_error(key, e))?;
            let bytes = response
                .body
                .collect()
                .await
                .map_err(|e| AppError::ObjectStoreError(format!("failed to read body for {key}: {e}")))?
                .into_bytes();
            Ok(bytes.to_vec())
        })
        .await
    }

    /// Download an object to `local_path`, streaming through a temp file
    /// so the whole body is never buffered in memory, then renaming into
    /// place so a concurrent reader never observes a partial write.
    pub async fn download(&self, key: &str, local_path: &Path) -> Result<()> {
        self.with_retry(|| async {
            let stream = self.get_stream(key, None).await?;
            let tmp_name = format!(
                "{}.part",
                local_path.file_name().and_then(|n| n.to_str()).unwrap_or("download")
            );
            let tmp_path = local_path.with_file_name(tmp_name);

            let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|e| {
                AppError::ObjectStoreError(format!("failed to create {}: {e}", tmp_path.display()))
            })?;
            let mut reader = stream.body.into_async_read();
            tokio::io::copy(&mut reader, &mut file)
                .await
                .map_err(|e| AppError::ObjectStoreError(format!("failed to download {key}: {e}")))?;
            drop(file);

            tokio::fs::rename(&tmp_path, local_path).await.map_err(|e| {
                AppError::ObjectStoreError(format!("failed to finalize {}: {e}", local_path.display()))
            })?;
            Ok(())
        })
        .await
    }

    /// List object keys and sizes under `prefix`, paging through the
    /// bucket listing as needed.
    pub async fn list(&self, prefix: &str) -> Result<Vec<(String, i64)>> {
        self.with_retry(|| async {
            let mut entries = Vec::new();
            let mut continuation_token = None;
            loop {
                let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
                if let Some(token) = &continuation_token {
                    request = request.continuation_token(token);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| AppError::ObjectStoreError(format!("list failed for {prefix}: {e}")))?;

                for object in response.contents() {
                    if let Some(key) = object.key() {
                        entries.push((key.to_string(), object.size().unwrap_or(0)));
                    }
                }

                continuation_token = response.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            }
            Ok(entries)
        })
        .await
    }

    /// Open a streaming body for a (potentially large) object, used by
    /// the HLS proxy's segment handler to avoid buffering whole `.ts`
    /// segments in memory. Carries `content_length` straight off the
    /// response so the caller never needs a separate HEAD round trip.
    pub async fn get_stream(&self, key: &str, range: Option<String>) -> Result<ObjectStream> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = range {
            request = request.range(range);
        }
        let response = request.send().await.map_err(|e| classify_get_error(key, e))?;
        Ok(ObjectStream {
            body: response.body,
            content_length: response.content_length,
        })
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("404") || msg.contains("NotFound") {
                    Ok(false)
                } else {
                    Err(AppError::ObjectStoreError(msg))
                }
            }
        }
    }

    /// Presign a GET for `key`, used when the proxy chooses to redirect
    /// instead of stream (not exercised by the default route wiring but
    /// kept available for deployments fronted by a CDN that can follow a
    /// redirect).
    pub async fn presign_get(&self, key: &str) -> Result<String> {
        let presigning_config = PresigningConfig::builder()
            .expires_in(self.presign_expiry)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build presigning config: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| AppError::ObjectStoreError(format!("failed to presign {key}: {e}")))?;

        Ok(presigned.uri().to_string())
    }
}

fn is_auth_error(err: &AppError) -> bool {
    let AppError::ObjectStoreError(msg) = err else {
        return false;
    };
    msg.contains("InvalidAccessKeyId")
        || msg.contains("SignatureDoesNotMatch")
        || msg.contains("AccessDenied")
        || msg.contains("403")
        || msg.contains("Forbidden")
}

fn classify_put_error(key: &str, e: impl std::fmt::Display) -> AppError {
    let msg = e.to_string();
    if msg.contains("403") || msg.contains("Forbidden") {
        AppError::ObjectStoreError("auth failed (403): check object store credentials".to_string())
    } else if msg.contains("NoSuchBucket") {
        AppError::ObjectStoreError("bucket not found".to_string())
    } else {
        AppError::ObjectStoreError(format!("put failed for {key}: {msg}"))
    }
}

fn classify_get_error(key: &str, e: impl std::fmt::Display) -> AppError {
    let msg = e.to_string();
    if msg.contains("404") || msg.contains("NoSuchKey") {
        AppError::NotFound(format!("object not found: {key}"))
    } else {
        AppError::ObjectStoreError(format!("get failed for {key}: {msg}"))
    }
}

/// Infer `Content-Type` from an object key's extension.
pub fn content_type_for(key: &str) -> &'static str {
    if key.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if key.ends_with(".ts") {
        "video/MP2T"
    } else if key.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    }
}

fn cache_control_for(key: &str) -> &'static str {
    if key.ends_with(".m3u8") {
        "no-cache"
    } else {
        "max-age=31536000"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_inference() {
        assert_eq!(content_type_for("out/360p/index.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("out/360p/segment001.ts"), "video/MP2T");
        assert_eq!(content_type_for("raw-videos/abc.mp4"), "video/mp4");
        assert_eq!(content_type_for("raw-videos/abc.bin"), "application/octet-stream");
    }

    #[test]
    fn auth_error_detection() {
        assert!(is_auth_error(&AppError::ObjectStoreError(
            "InvalidAccessKeyId".to_string()
        )));
        assert!(is_auth_error(&AppError::ObjectStoreError(
            "403 Forbidden".to_string()
        )));
        assert!(!is_auth_error(&AppError::ObjectStoreError(
            "connection reset".to_string()
        )));
    }
}
