//! Abstract backend object client.
//!
//! Every backend client implements [`ObjectBackend`] and is bound to one
//! account's bucket, credentials, and endpoint.  Errors are reported as
//! [`BackendError`] so callers can classify them without string parsing
//! whenever the backend supplies a structured code.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by every backend method.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Maximum parts returned by one ListParts page.
pub const MAX_PARTS_PER_PAGE: u32 = 1000;

// ── Errors ──────────────────────────────────────────────────────────

/// A failed backend call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    /// Structured error code (e.g. `NoSuchKey`), when the backend sent one.
    pub code: Option<String>,
    /// HTTP status of the backend response, when there was one.
    pub status: Option<u16>,
    pub message: String,
}

/// Coarse classification used to pick the wire error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    NoSuchKey,
    NoSuchUpload,
    NotFound,
    InvalidPart,
    InvalidRange,
    Other,
}

impl BackendError {
    pub fn new(code: Option<&str>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            status,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(None, None, message)
    }

    /// Classify the failure.
    ///
    /// The structured code wins.  Only when the backend sent no code do we
    /// fall back to the HTTP status and then to substring matching on the
    /// message, which is fragile and depends on backend wording.
    pub fn kind(&self) -> BackendErrorKind {
        if let Some(code) = self.code.as_deref() {
            return match code {
                "NoSuchKey" => BackendErrorKind::NoSuchKey,
                "NoSuchUpload" => BackendErrorKind::NoSuchUpload,
                "NotFound" => BackendErrorKind::NotFound,
                "InvalidPart" | "InvalidPartOrder" => BackendErrorKind::InvalidPart,
                "InvalidRange" => BackendErrorKind::InvalidRange,
                _ => BackendErrorKind::Other,
            };
        }
        if self.status == Some(404) {
            return BackendErrorKind::NotFound;
        }
        let msg = self.message.as_str();
        if msg.contains("NoSuchKey") {
            BackendErrorKind::NoSuchKey
        } else if msg.contains("NoSuchUpload") {
            BackendErrorKind::NoSuchUpload
        } else if msg.contains("NotFound") {
            BackendErrorKind::NotFound
        } else if msg.contains("InvalidPart") {
            BackendErrorKind::InvalidPart
        } else {
            BackendErrorKind::Other
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind(),
            BackendErrorKind::NoSuchKey | BackendErrorKind::NotFound
        )
    }
}

// ── Request / response types ────────────────────────────────────────

/// Headers forwarded verbatim on PUT.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub content_md5: Option<String>,
}

/// Result of a PUT: the ETag plus any checksum headers to echo back.
#[derive(Debug, Clone, Default)]
pub struct PutResult {
    pub etag: Option<String>,
    /// `(header-name, value)` pairs such as `x-amz-checksum-crc32`.
    pub checksums: Vec<(String, String)>,
}

/// Object metadata returned by HEAD and GET.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    pub content_type: Option<String>,
    pub content_length: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A GET response. `content_range` is set for partial (206) responses.
#[derive(Debug, Clone)]
pub struct ObjectBody {
    pub data: Bytes,
    pub meta: ObjectMeta,
    pub content_range: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CopyResult {
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One entry of a bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// One page of a bucket listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    /// Token for the next page; `None` once the listing is exhausted.
    pub next_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PartSummary {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct PartsPage {
    pub parts: Vec<PartSummary>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// A client-supplied `{partNumber, eTag}` pair for CompleteMultipartUpload.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

// ── Trait ───────────────────────────────────────────────────────────

/// Object operations against one account's pre-provisioned bucket.
pub trait ObjectBackend: Send + Sync + 'static {
    /// The bucket this client is bound to.
    fn bucket(&self) -> &str;

    fn put_object(&self, key: &str, data: Bytes, opts: PutOptions) -> BackendFuture<'_, PutResult>;

    /// Fetch an object, optionally restricted to an HTTP `Range`.
    fn get_object(&self, key: &str, range: Option<String>) -> BackendFuture<'_, ObjectBody>;

    fn head_object(&self, key: &str) -> BackendFuture<'_, ObjectMeta>;

    fn delete_object(&self, key: &str) -> BackendFuture<'_, ()>;

    /// Server-side copy within the bound bucket.
    fn copy_object(&self, src_key: &str, dst_key: &str) -> BackendFuture<'_, CopyResult>;

    /// Start a multipart upload and return its upload id.
    fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<String>,
    ) -> BackendFuture<'_, String>;

    /// Upload one part and return its ETag.
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BackendFuture<'_, String>;

    fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        src_key: &str,
        range: Option<String>,
    ) -> BackendFuture<'_, CopyResult>;

    /// Complete an upload and return the final ETag.
    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BackendFuture<'_, String>;

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendFuture<'_, ()>;

    /// List parts with `part_number > marker`, at most `max_parts` of them.
    fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
        marker: u32,
        max_parts: u32,
    ) -> BackendFuture<'_, PartsPage>;

    /// One page of the bucket listing.
    fn list_objects(&self, continuation: Option<String>) -> BackendFuture<'_, ListPage>;
}

/// Enumerate every object in the bucket, following continuation tokens.
pub async fn list_all_objects(
    backend: &dyn ObjectBackend,
) -> Result<Vec<ObjectSummary>, BackendError> {
    let mut objects = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = backend.list_objects(token.take()).await?;
        objects.extend(page.objects);
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(objects)
}

/// Quote an ETag if the backend returned it bare.
pub fn quote_etag(etag: &str) -> String {
    if etag.starts_with('"') {
        etag.to_string()
    } else {
        format!("\"{etag}\"")
    }
}
