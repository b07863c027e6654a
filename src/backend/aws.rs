//! S3-compatible backend client built on the AWS SDK.
//!
//! One [`AwsBackend`] is bound to a single account: its static access key,
//! its endpoint (or the configured endpoint proxy), and its pre-provisioned
//! bucket.  Path-style addressing is forced because most S3-compatible
//! providers expect it behind custom endpoints.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::client::{
    quote_etag, BackendError, BackendFuture, CompletedPart, CopyResult, ListPage, ObjectBackend,
    ObjectBody, ObjectMeta, ObjectSummary, PartSummary, PartsPage, PutOptions, PutResult,
};
use crate::auth::s3_uri_encode;

/// Backend client that forwards operations to one account's S3 bucket.
pub struct AwsBackend {
    client: Client,
    bucket: String,
}

impl AwsBackend {
    /// Build a client with static credentials against `endpoint`.
    pub async fn new(
        access_key_id: &str,
        secret_access_key: &str,
        endpoint: &str,
        region: &str,
        bucket: &str,
    ) -> Self {
        let creds = aws_sdk_s3::config::Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "cloudmux-account",
        );

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(creds)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        info!("backend client initialized: endpoint={} bucket={}", endpoint, bucket);

        Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.to_string(),
        }
    }

    /// `x-amz-copy-source` value for a key in the bound bucket.
    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.bucket, s3_uri_encode(key, false))
    }
}

/// Map an SDK error to a [`BackendError`], keeping the structured code.
fn map_sdk_error<E>(context: &str, err: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.code().map(str::to_string);
    let message = match err.message() {
        Some(msg) => format!("{context}: {msg}"),
        None => format!("{context}: {}", DisplayErrorContext(&err)),
    };
    BackendError {
        code,
        status,
        message,
    }
}

fn to_chrono(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<DateTime<Utc>> {
    dt.and_then(|d| DateTime::from_timestamp(d.secs(), d.subsec_nanos()))
}

fn to_u64(n: Option<i64>) -> u64 {
    n.unwrap_or(0).max(0) as u64
}

impl ObjectBackend for AwsBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_object(&self, key: &str, data: Bytes, opts: PutOptions) -> BackendFuture<'_, PutResult> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("put_object: bucket={} key={} size={}", self.bucket, key, data.len());

            let resp = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .set_content_type(opts.content_type)
                .set_content_md5(opts.content_md5)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| map_sdk_error("put_object", e))?;

            let mut checksums = Vec::new();
            let candidates = [
                ("x-amz-checksum-crc32", resp.checksum_crc32()),
                ("x-amz-checksum-crc32c", resp.checksum_crc32_c()),
                ("x-amz-checksum-sha1", resp.checksum_sha1()),
                ("x-amz-checksum-sha256", resp.checksum_sha256()),
            ];
            for (name, value) in candidates {
                if let Some(value) = value {
                    checksums.push((name.to_string(), value.to_string()));
                }
            }

            Ok(PutResult {
                etag: resp.e_tag().map(quote_etag),
                checksums,
            })
        })
    }

    fn get_object(&self, key: &str, range: Option<String>) -> BackendFuture<'_, ObjectBody> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("get_object: bucket={} key={} range={:?}", self.bucket, key, range);

            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .set_range(range)
                .send()
                .await
                .map_err(|e| map_sdk_error("get_object", e))?;

            let meta = ObjectMeta {
                content_type: resp.content_type().map(str::to_string),
                content_length: to_u64(resp.content_length()),
                etag: resp.e_tag().map(quote_etag),
                last_modified: to_chrono(resp.last_modified()),
            };
            let content_range = resp.content_range().map(str::to_string);

            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| BackendError::other(format!("get_object body: {e}")))?
                .into_bytes();

            Ok(ObjectBody {
                data,
                meta,
                content_range,
            })
        })
    }

    fn head_object(&self, key: &str) -> BackendFuture<'_, ObjectMeta> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("head_object: bucket={} key={}", self.bucket, key);

            let resp = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| map_sdk_error("head_object", e))?;

            Ok(ObjectMeta {
                content_type: resp.content_type().map(str::to_string),
                content_length: to_u64(resp.content_length()),
                etag: resp.e_tag().map(quote_etag),
                last_modified: to_chrono(resp.last_modified()),
            })
        })
    }

    fn delete_object(&self, key: &str) -> BackendFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("delete_object: bucket={} key={}", self.bucket, key);

            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| map_sdk_error("delete_object", e))?;
            Ok(())
        })
    }

    fn copy_object(&self, src_key: &str, dst_key: &str) -> BackendFuture<'_, CopyResult> {
        let copy_source = self.copy_source(src_key);
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            debug!("copy_object: src={} dst={}/{}", copy_source, self.bucket, dst_key);

            let resp = self
                .client
                .copy_object()
                .bucket(&self.bucket)
                .key(&dst_key)
                .copy_source(&copy_source)
                .send()
                .await
                .map_err(|e| map_sdk_error("copy_object", e))?;

            let result = resp.copy_object_result();
            Ok(CopyResult {
                etag: quote_etag(result.and_then(|r| r.e_tag()).unwrap_or("")),
                last_modified: to_chrono(result.and_then(|r| r.last_modified())),
            })
        })
    }

    fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<String>,
    ) -> BackendFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("create_multipart_upload: bucket={} key={}", self.bucket, key);

            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .set_content_type(content_type)
                .send()
                .await
                .map_err(|e| map_sdk_error("create_multipart_upload", e))?;

            resp.upload_id()
                .map(str::to_string)
                .ok_or_else(|| BackendError::other("backend did not return an upload id"))
        })
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BackendFuture<'_, String> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            debug!(
                "upload_part: bucket={} key={} upload={} part={}",
                self.bucket, key, upload_id, part_number
            );

            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number as i32)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| map_sdk_error("upload_part", e))?;

            Ok(quote_etag(resp.e_tag().unwrap_or("")))
        })
    }

    fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        src_key: &str,
        range: Option<String>,
    ) -> BackendFuture<'_, CopyResult> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        let copy_source = self.copy_source(src_key);
        Box::pin(async move {
            debug!(
                "upload_part_copy: src={} dst={}/{} upload={} part={}",
                copy_source, self.bucket, key, upload_id, part_number
            );

            let resp = self
                .client
                .upload_part_copy()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number as i32)
                .copy_source(&copy_source)
                .set_copy_source_range(range)
                .send()
                .await
                .map_err(|e| map_sdk_error("upload_part_copy", e))?;

            let result = resp.copy_part_result();
            Ok(CopyResult {
                etag: quote_etag(result.and_then(|r| r.e_tag()).unwrap_or("")),
                last_modified: to_chrono(result.and_then(|r| r.last_modified())),
            })
        })
    }

    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BackendFuture<'_, String> {
        use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart};

        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            debug!(
                "complete_multipart_upload: bucket={} key={} upload={} parts={}",
                self.bucket,
                key,
                upload_id,
                parts.len()
            );

            let sdk_parts: Vec<SdkCompletedPart> = parts
                .iter()
                .map(|p| {
                    SdkCompletedPart::builder()
                        .part_number(p.part_number as i32)
                        .e_tag(&p.etag)
                        .build()
                })
                .collect();
            let upload = CompletedMultipartUpload::builder()
                .set_parts(Some(sdk_parts))
                .build();

            let resp = self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(upload)
                .send()
                .await
                .map_err(|e| map_sdk_error("complete_multipart_upload", e))?;

            Ok(quote_etag(resp.e_tag().unwrap_or("")))
        })
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendFuture<'_, ()> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            debug!(
                "abort_multipart_upload: bucket={} key={} upload={}",
                self.bucket, key, upload_id
            );

            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
                .map_err(|e| map_sdk_error("abort_multipart_upload", e))?;
            Ok(())
        })
    }

    fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
        marker: u32,
        max_parts: u32,
    ) -> BackendFuture<'_, PartsPage> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut req = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .max_parts(max_parts as i32);
            if marker > 0 {
                req = req.part_number_marker(marker.to_string());
            }

            let resp = req
                .send()
                .await
                .map_err(|e| map_sdk_error("list_parts", e))?;

            let parts = resp
                .parts()
                .iter()
                .map(|p| PartSummary {
                    part_number: p.part_number().unwrap_or(0).max(0) as u32,
                    etag: quote_etag(p.e_tag().unwrap_or("")),
                    size: to_u64(p.size()),
                    last_modified: to_chrono(p.last_modified()),
                })
                .collect();

            Ok(PartsPage {
                parts,
                is_truncated: resp.is_truncated().unwrap_or(false),
                next_part_number_marker: resp
                    .next_part_number_marker()
                    .and_then(|m| m.parse().ok()),
            })
        })
    }

    fn list_objects(&self, continuation: Option<String>) -> BackendFuture<'_, ListPage> {
        Box::pin(async move {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation)
                .send()
                .await
                .map_err(|e| map_sdk_error("list_objects_v2", e))?;

            let objects = resp
                .contents()
                .iter()
                .filter_map(|obj| {
                    Some(ObjectSummary {
                        key: obj.key()?.to_string(),
                        size: to_u64(obj.size()),
                        last_modified: to_chrono(obj.last_modified()).unwrap_or_default(),
                    })
                })
                .collect();

            let next_token = if resp.is_truncated() == Some(true) {
                resp.next_continuation_token().map(str::to_string)
            } else {
                None
            };

            Ok(ListPage {
                objects,
                next_token,
            })
        })
    }
}
