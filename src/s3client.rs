//! S3 capability: the abstract operations the core consumes (§4.2),
//! implemented against `aws-sdk-s3`. Every bucket config gets its own
//! lazily-constructed client, scheme-driven TLS matching the endpoint URL.

use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};

/// A decrypted, ready-to-use reference to one bucket config. Constructed
/// per request from the metadata store's row plus the decrypted
/// credentials; never persisted.
#[derive(Debug, Clone)]
pub struct BucketTarget {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl BucketTarget {
    /// Scheme-driven TLS: `https://` uses TLS, `http://` or no scheme
    /// defaults to non-TLS (§4.2).
    pub fn uses_tls(&self) -> bool {
        !self.endpoint.starts_with("http://")
    }
}

#[derive(Debug, Clone)]
pub struct HeadResult {
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct CompletedPartInput {
    pub part_number: i32,
    pub e_tag: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
}

/// One HTTP client pool per bucket config, constructed lazily and reused
/// across requests that target the same bucket (§5 shared-resource
/// policy).
pub struct S3Capability {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Capability {
    pub async fn new(target: &BucketTarget) -> Result<Self> {
        let cred = Credentials::new(&target.access_key, &target.secret_key, None, None, "datas3t-bucket-config");

        let endpoint = if target.endpoint.contains("://") {
            target.endpoint.clone()
        } else {
            format!("{}://{}", if target.uses_tls() { "https" } else { "http" }, target.endpoint)
        };

        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .endpoint_url(endpoint)
            .credentials_provider(cred)
            .region(aws_config::Region::new("auto"))
            .force_path_style(true)
            .build();

        Ok(Self { client: aws_sdk_s3::Client::from_conf(config), bucket: target.bucket.clone() })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String> {
        let cfg = PresigningConfig::expires_in(ttl).map_err(|e| Error::Fatal(e.into()))?;
        let req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(cfg)
            .await
            .map_err(|e| Error::Transient(e.into()))?;
        Ok(req.uri().to_owned())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn presign_get(&self, key: &str, range: Option<(u64, u64)>, ttl: Duration) -> Result<String> {
        let cfg = PresigningConfig::expires_in(ttl).map_err(|e| Error::Fatal(e.into()))?;
        let mut builder = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some((start, end)) = range {
            builder = builder.range(format!("bytes={start}-{end}"));
        }
        let req = builder.presigned(cfg).await.map_err(|e| Error::Transient(e.into()))?;
        Ok(req.uri().to_owned())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn presign_delete(&self, key: &str, ttl: Duration) -> Result<String> {
        let cfg = PresigningConfig::expires_in(ttl).map_err(|e| Error::Fatal(e.into()))?;
        let req = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(cfg)
            .await
            .map_err(|e| Error::Transient(e.into()))?;
        Ok(req.uri().to_owned())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn initiate_multipart(&self, key: &str) -> Result<String> {
        let res = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::Transient(e.into()))?;
        res.upload_id
            .ok_or_else(|| Error::UploadFailed("S3 did not return a multipart upload id".to_owned()))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn presign_upload_part(&self, key: &str, upload_id: &str, part_number: i32, ttl: Duration) -> Result<String> {
        let cfg = PresigningConfig::expires_in(ttl).map_err(|e| Error::Fatal(e.into()))?;
        let req = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(cfg)
            .await
            .map_err(|e| Error::Transient(e.into()))?;
        Ok(req.uri().to_owned())
    }

    /// Used by the aggregation worker, which holds real credentials and so
    /// uploads parts directly rather than through a presigned URL.
    #[tracing::instrument(level = "debug", skip(self, body))]
    pub async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Bytes) -> Result<String> {
        let res = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(body.into())
            .send()
            .await
            .map_err(|e| Error::Transient(e.into()))?;
        res.e_tag.ok_or_else(|| Error::UploadFailed("S3 did not return an etag for uploaded part".to_owned()))
    }

    #[tracing::instrument(level = "info", skip(self, parts))]
    pub async fn complete_multipart(&self, key: &str, upload_id: &str, parts: Vec<CompletedPartInput>) -> Result<String> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|p| CompletedPart::builder().part_number(p.part_number).e_tag(p.e_tag).build())
                    .collect(),
            ))
            .build();

        let res = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| Error::UploadFailed(format!("CompleteMultipartUpload failed: {e}")))?;

        res.e_tag.ok_or_else(|| Error::UploadFailed("S3 did not return an etag".to_owned()))
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| Error::Transient(e.into()))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn head_object(&self, key: &str) -> Result<Option<HeadResult>> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(res) => Ok(Some(HeadResult { size: res.content_length.unwrap_or(0) as u64 })),
            Err(err) => match err.as_service_error() {
                Some(se) if se.is_not_found() => Ok(None),
                _ => Err(Error::Transient(err.into())),
            },
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<ListResult> {
        let mut keys = Vec::new();
        let mut common_prefixes = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut builder = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(d) = delimiter {
                builder = builder.delimiter(d);
            }
            if let Some(token) = &continuation {
                builder = builder.continuation_token(token);
            }
            let res = builder.send().await.map_err(|e| Error::Transient(e.into()))?;

            for obj in res.contents() {
                if let Some(k) = obj.key() {
                    keys.push(k.to_owned());
                }
            }
            for cp in res.common_prefixes() {
                if let Some(p) = cp.prefix() {
                    common_prefixes.push(p.to_owned());
                }
            }

            if res.is_truncated().unwrap_or(false) {
                continuation = res.next_continuation_token().map(|s| s.to_owned());
            } else {
                break;
            }
        }

        Ok(ListResult { keys, common_prefixes })
    }

    /// Used only by the aggregation worker (and the import scan's index
    /// read) — the service never streams client payload bytes otherwise.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_object(&self, key: &str, range: Option<(u64, u64)>) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let mut builder = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some((start, end)) = range {
            builder = builder.range(format!("bytes={start}-{end}"));
        }
        let res = builder.send().await.map_err(|e| Error::Transient(e.into()))?;
        Ok(Box::new(res.body.into_async_read()))
    }

    /// Used only by the aggregation worker / index upload — the service
    /// never streams client payload bytes otherwise.
    #[tracing::instrument(level = "debug", skip(self, body))]
    pub async fn put_object(&self, key: &str, body: Bytes) -> Result<String> {
        let res = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.into())
            .send()
            .await
            .map_err(|e| Error::Transient(e.into()))?;
        res.e_tag.ok_or_else(|| Error::UploadFailed("S3 did not return an etag".to_owned()))
    }
}
