//! In-memory backend.
//!
//! A [`MemoryStore`] holds every bucket's objects and multipart sessions in
//! `tokio::sync::RwLock<HashMap<...>>` maps.  [`MemoryBackend`] binds the
//! shared store to one account's bucket, mirroring how a real client is
//! scoped.  Used by tests and as a dry-run backend.
//!
//! ETags are the quoted MD5 of the object; completed multipart uploads use
//! the S3 composite form `md5(concat(part md5s))-N`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::client::{
    BackendError, BackendFuture, CompletedPart, CopyResult, ListPage, ObjectBackend, ObjectBody,
    ObjectMeta, ObjectSummary, PartSummary, PartsPage, PutOptions, PutResult,
};

/// Keys returned per listing page.
const LIST_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredPart {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct Upload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    parts: BTreeMap<u32, StoredPart>,
}

/// Shared state behind every [`MemoryBackend`].
#[derive(Default)]
pub struct MemoryStore {
    /// bucket -> key -> object
    objects: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
    uploads: RwLock<HashMap<String, Upload>>,
    /// Buckets whose every call fails, to simulate an unreachable account.
    unavailable: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every call against `bucket` fail (or succeed again).
    pub async fn set_unavailable(&self, bucket: &str, unavailable: bool) {
        let mut set = self.unavailable.write().await;
        if unavailable {
            set.insert(bucket.to_string());
        } else {
            set.remove(bucket);
        }
    }

    /// Insert an object with an explicit modification time.
    pub async fn insert_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        last_modified: DateTime<Utc>,
    ) {
        let etag = compute_etag(&data);
        let mut objects = self.objects.write().await;
        objects.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: None,
                etag,
                last_modified,
            },
        );
    }

    /// Keys currently stored in `bucket`, sorted.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.read().await;
        objects
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Total bytes stored in `bucket`.
    pub async fn bucket_size(&self, bucket: &str) -> u64 {
        let objects = self.objects.read().await;
        objects
            .get(bucket)
            .map(|b| b.values().map(|o| o.data.len() as u64).sum())
            .unwrap_or(0)
    }

    async fn check_available(&self, bucket: &str) -> Result<(), BackendError> {
        if self.unavailable.read().await.contains(bucket) {
            return Err(BackendError::new(
                Some("ServiceUnavailable"),
                Some(503),
                format!("bucket {bucket} is unavailable"),
            ));
        }
        Ok(())
    }
}

fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

fn no_such_key() -> BackendError {
    BackendError::new(
        Some("NoSuchKey"),
        Some(404),
        "The specified key does not exist.",
    )
}

fn no_such_upload() -> BackendError {
    BackendError::new(
        Some("NoSuchUpload"),
        Some(404),
        "The specified upload does not exist.",
    )
}

fn invalid_range() -> BackendError {
    BackendError::new(
        Some("InvalidRange"),
        Some(416),
        "The requested range is not satisfiable",
    )
}

/// Resolve a `bytes=` range header against an object of `len` bytes.
///
/// Returns the inclusive `(start, end)` pair.
fn parse_range(header: &str, len: u64) -> Result<(u64, u64), BackendError> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(invalid_range)?;
    let (start, end) = spec.split_once('-').ok_or_else(invalid_range)?;
    if len == 0 {
        return Err(invalid_range());
    }

    let (start, end) = match (start.trim(), end.trim()) {
        ("", suffix) => {
            let n: u64 = suffix.parse().map_err(|_| invalid_range())?;
            if n == 0 {
                return Err(invalid_range());
            }
            (len.saturating_sub(n), len - 1)
        }
        (s, "") => (s.parse().map_err(|_| invalid_range())?, len - 1),
        (s, e) => {
            let s: u64 = s.parse().map_err(|_| invalid_range())?;
            let e: u64 = e.parse().map_err(|_| invalid_range())?;
            (s, e.min(len - 1))
        }
    };

    if start > end || start >= len {
        return Err(invalid_range());
    }
    Ok((start, end))
}

/// Per-bucket view of a [`MemoryStore`].
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    bucket: String,
}

impl MemoryBackend {
    pub fn new(store: Arc<MemoryStore>, bucket: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
        }
    }

    async fn find_object(&self, key: &str) -> Result<StoredObject, BackendError> {
        let objects = self.store.objects.read().await;
        objects
            .get(&self.bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(no_such_key)
    }

    fn meta(obj: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            content_type: obj.content_type.clone(),
            content_length: obj.data.len() as u64,
            etag: Some(obj.etag.clone()),
            last_modified: Some(obj.last_modified),
        }
    }
}

impl ObjectBackend for MemoryBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_object(&self, key: &str, data: Bytes, opts: PutOptions) -> BackendFuture<'_, PutResult> {
        let key = key.to_string();
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;

            if let Some(expected) = opts.content_md5.as_deref() {
                use base64::Engine;
                let digest = Md5::digest(&data);
                let actual = base64::engine::general_purpose::STANDARD.encode(digest);
                if actual != expected {
                    return Err(BackendError::new(
                        Some("BadDigest"),
                        Some(400),
                        "The Content-MD5 you specified did not match what we received.",
                    ));
                }
            }

            let etag = compute_etag(&data);
            let mut objects = self.store.objects.write().await;
            objects.entry(self.bucket.clone()).or_default().insert(
                key,
                StoredObject {
                    data,
                    content_type: opts.content_type,
                    etag: etag.clone(),
                    last_modified: Utc::now(),
                },
            );

            Ok(PutResult {
                etag: Some(etag),
                checksums: Vec::new(),
            })
        })
    }

    fn get_object(&self, key: &str, range: Option<String>) -> BackendFuture<'_, ObjectBody> {
        let key = key.to_string();
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;
            let obj = self.find_object(&key).await?;
            let total = obj.data.len() as u64;
            let mut meta = Self::meta(&obj);

            match range {
                Some(header) => {
                    let (start, end) = parse_range(&header, total)?;
                    let data = obj.data.slice(start as usize..=end as usize);
                    meta.content_length = data.len() as u64;
                    Ok(ObjectBody {
                        data,
                        meta,
                        content_range: Some(format!("bytes {start}-{end}/{total}")),
                    })
                }
                None => Ok(ObjectBody {
                    data: obj.data,
                    meta,
                    content_range: None,
                }),
            }
        })
    }

    fn head_object(&self, key: &str) -> BackendFuture<'_, ObjectMeta> {
        let key = key.to_string();
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;
            let obj = self.find_object(&key).await?;
            Ok(Self::meta(&obj))
        })
    }

    fn delete_object(&self, key: &str) -> BackendFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;
            let mut objects = self.store.objects.write().await;
            if let Some(bucket) = objects.get_mut(&self.bucket) {
                bucket.remove(&key);
            }
            Ok(())
        })
    }

    fn copy_object(&self, src_key: &str, dst_key: &str) -> BackendFuture<'_, CopyResult> {
        let src_key = src_key.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;
            let mut obj = self.find_object(&src_key).await?;
            obj.last_modified = Utc::now();
            let result = CopyResult {
                etag: obj.etag.clone(),
                last_modified: Some(obj.last_modified),
            };
            let mut objects = self.store.objects.write().await;
            objects
                .entry(self.bucket.clone())
                .or_default()
                .insert(dst_key, obj);
            Ok(result)
        })
    }

    fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<String>,
    ) -> BackendFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;
            let upload_id = uuid::Uuid::new_v4().simple().to_string();
            let mut uploads = self.store.uploads.write().await;
            uploads.insert(
                upload_id.clone(),
                Upload {
                    bucket: self.bucket.clone(),
                    key,
                    content_type,
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
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
            self.store.check_available(&self.bucket).await?;
            let etag = compute_etag(&data);
            let mut uploads = self.store.uploads.write().await;
            let upload = uploads
                .get_mut(&upload_id)
                .filter(|u| u.bucket == self.bucket && u.key == key)
                .ok_or_else(no_such_upload)?;
            upload.parts.insert(
                part_number,
                StoredPart {
                    data,
                    etag: etag.clone(),
                    last_modified: Utc::now(),
                },
            );
            Ok(etag)
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
        let src_key = src_key.to_string();
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;
            let src = self.find_object(&src_key).await?;
            let data = match range {
                Some(header) => {
                    let (start, end) = parse_range(&header, src.data.len() as u64)?;
                    src.data.slice(start as usize..=end as usize)
                }
                None => src.data,
            };
            let etag = compute_etag(&data);
            let now = Utc::now();

            let mut uploads = self.store.uploads.write().await;
            let upload = uploads
                .get_mut(&upload_id)
                .filter(|u| u.bucket == self.bucket && u.key == key)
                .ok_or_else(no_such_upload)?;
            upload.parts.insert(
                part_number,
                StoredPart {
                    data,
                    etag: etag.clone(),
                    last_modified: now,
                },
            );
            Ok(CopyResult {
                etag,
                last_modified: Some(now),
            })
        })
    }

    fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BackendFuture<'_, String> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;
            let mut uploads = self.store.uploads.write().await;
            let upload = uploads
                .get(&upload_id)
                .filter(|u| u.bucket == self.bucket && u.key == key)
                .ok_or_else(no_such_upload)?;

            if parts.is_empty() {
                return Err(BackendError::new(
                    Some("InvalidPart"),
                    Some(400),
                    "You must specify at least one part",
                ));
            }

            let mut data = Vec::new();
            let mut md5_concat = Vec::new();
            let mut previous = 0u32;
            for part in &parts {
                if part.part_number <= previous {
                    return Err(BackendError::new(
                        Some("InvalidPartOrder"),
                        Some(400),
                        "The list of parts was not in ascending order.",
                    ));
                }
                previous = part.part_number;

                let stored = upload
                    .parts
                    .get(&part.part_number)
                    .filter(|p| p.etag.trim_matches('"') == part.etag.trim_matches('"'))
                    .ok_or_else(|| {
                        BackendError::new(
                            Some("InvalidPart"),
                            Some(400),
                            format!(
                                "One or more of the specified parts could not be found: part {}",
                                part.part_number
                            ),
                        )
                    })?;
                data.extend_from_slice(&stored.data);
                if let Ok(bytes) = hex::decode(stored.etag.trim_matches('"')) {
                    md5_concat.extend_from_slice(&bytes);
                }
            }

            let etag = format!(
                "\"{}-{}\"",
                hex::encode(Md5::digest(&md5_concat)),
                parts.len()
            );

            let content_type = upload.content_type.clone();
            uploads.remove(&upload_id);
            drop(uploads);

            let mut objects = self.store.objects.write().await;
            objects.entry(self.bucket.clone()).or_default().insert(
                key,
                StoredObject {
                    data: Bytes::from(data),
                    content_type,
                    etag: etag.clone(),
                    last_modified: Utc::now(),
                },
            );
            Ok(etag)
        })
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendFuture<'_, ()> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;
            let mut uploads = self.store.uploads.write().await;
            match uploads.get(&upload_id) {
                Some(u) if u.bucket == self.bucket && u.key == key => {
                    uploads.remove(&upload_id);
                    Ok(())
                }
                _ => Err(no_such_upload()),
            }
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
            self.store.check_available(&self.bucket).await?;
            let uploads = self.store.uploads.read().await;
            let upload = uploads
                .get(&upload_id)
                .filter(|u| u.bucket == self.bucket && u.key == key)
                .ok_or_else(no_such_upload)?;

            let mut remaining = upload
                .parts
                .range(marker.saturating_add(1)..)
                .map(|(number, part)| PartSummary {
                    part_number: *number,
                    etag: part.etag.clone(),
                    size: part.data.len() as u64,
                    last_modified: Some(part.last_modified),
                })
                .peekable();

            let mut parts = Vec::new();
            while parts.len() < max_parts as usize {
                match remaining.next() {
                    Some(p) => parts.push(p),
                    None => break,
                }
            }
            let is_truncated = remaining.peek().is_some();
            let next_part_number_marker = if is_truncated {
                parts.last().map(|p| p.part_number)
            } else {
                None
            };

            Ok(PartsPage {
                parts,
                is_truncated,
                next_part_number_marker,
            })
        })
    }

    fn list_objects(&self, continuation: Option<String>) -> BackendFuture<'_, ListPage> {
        Box::pin(async move {
            self.store.check_available(&self.bucket).await?;
            let objects = self.store.objects.read().await;
            let Some(bucket) = objects.get(&self.bucket) else {
                return Ok(ListPage::default());
            };

            let iter: Box<dyn Iterator<Item = (&String, &StoredObject)>> = match continuation {
                Some(ref after) => Box::new(
                    bucket.range::<String, _>((
                        std::ops::Bound::Excluded(after.clone()),
                        std::ops::Bound::Unbounded,
                    )),
                ),
                None => Box::new(bucket.iter()),
            };
            let mut iter = iter.peekable();

            let mut page = Vec::new();
            while page.len() < LIST_PAGE_SIZE {
                match iter.next() {
                    Some((key, obj)) => page.push(ObjectSummary {
                        key: key.clone(),
                        size: obj.data.len() as u64,
                        last_modified: obj.last_modified,
                    }),
                    None => break,
                }
            }
            let next_token = if iter.peek().is_some() {
                page.last().map(|o| o.key.clone())
            } else {
                None
            };

            Ok(ListPage {
                objects: page,
                next_token,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::client::{list_all_objects, BackendErrorKind};

    fn backend() -> MemoryBackend {
        MemoryBackend::new(MemoryStore::new(), "bucket")
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let b = backend();
        let put = b
            .put_object(
                "a.txt",
                Bytes::from_static(b"hello world"),
                PutOptions {
                    content_type: Some("text/plain".to_string()),
                    content_md5: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            put.etag.as_deref(),
            Some("\"5eb63bbbe01eeed093cb22bb8f5acdc3\"")
        );

        let got = b.get_object("a.txt", None).await.unwrap();
        assert_eq!(got.data, Bytes::from_static(b"hello world"));
        assert_eq!(got.meta.content_type.as_deref(), Some("text/plain"));
        assert!(got.content_range.is_none());
    }

    #[tokio::test]
    async fn test_content_md5_mismatch() {
        let b = backend();
        let err = b
            .put_object(
                "a.txt",
                Bytes::from_static(b"data"),
                PutOptions {
                    content_type: None,
                    content_md5: Some("AAAAAAAAAAAAAAAAAAAAAA==".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("BadDigest"));
    }

    #[tokio::test]
    async fn test_get_missing_is_no_such_key() {
        let err = backend().get_object("nope", None).await.unwrap_err();
        assert_eq!(err.kind(), BackendErrorKind::NoSuchKey);
    }

    #[tokio::test]
    async fn test_range_get() {
        let b = backend();
        b.put_object("r", Bytes::from_static(b"0123456789"), PutOptions::default())
            .await
            .unwrap();

        let got = b.get_object("r", Some("bytes=2-4".to_string())).await.unwrap();
        assert_eq!(got.data, Bytes::from_static(b"234"));
        assert_eq!(got.content_range.as_deref(), Some("bytes 2-4/10"));

        let tail = b.get_object("r", Some("bytes=-3".to_string())).await.unwrap();
        assert_eq!(tail.data, Bytes::from_static(b"789"));

        let err = b
            .get_object("r", Some("bytes=20-30".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), BackendErrorKind::InvalidRange);
    }

    #[test]
    fn test_parse_range_open_ended() {
        assert_eq!(parse_range("bytes=5-", 10).unwrap(), (5, 9));
        assert_eq!(parse_range("bytes=0-100", 10).unwrap(), (0, 9));
        assert!(parse_range("items=0-1", 10).is_err());
        assert!(parse_range("bytes=4-2", 10).is_err());
    }

    #[tokio::test]
    async fn test_copy_object() {
        let b = backend();
        b.put_object("src", Bytes::from_static(b"data"), PutOptions::default())
            .await
            .unwrap();
        let copy = b.copy_object("src", "dst").await.unwrap();
        assert_eq!(copy.etag, compute_etag(b"data"));
        assert_eq!(
            b.get_object("dst", None).await.unwrap().data,
            Bytes::from_static(b"data")
        );
        assert!(b.copy_object("missing", "x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_multipart_lifecycle() {
        let b = backend();
        let id = b.create_multipart_upload("big", None).await.unwrap();
        let e1 = b
            .upload_part("big", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let e2 = b
            .upload_part("big", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();

        let etag = b
            .complete_multipart_upload(
                "big",
                &id,
                vec![
                    CompletedPart {
                        part_number: 1,
                        etag: e1,
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: e2,
                    },
                ],
            )
            .await
            .unwrap();
        assert!(etag.ends_with("-2\""));
        assert_eq!(
            b.get_object("big", None).await.unwrap().data,
            Bytes::from_static(b"hello world")
        );

        // The session is gone once completed.
        let err = b.abort_multipart_upload("big", &id).await.unwrap_err();
        assert_eq!(err.kind(), BackendErrorKind::NoSuchUpload);
    }

    #[tokio::test]
    async fn test_complete_rejects_wrong_etag() {
        let b = backend();
        let id = b.create_multipart_upload("k", None).await.unwrap();
        b.upload_part("k", &id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let err = b
            .complete_multipart_upload(
                "k",
                &id,
                vec![CompletedPart {
                    part_number: 1,
                    etag: "\"deadbeef\"".to_string(),
                }],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), BackendErrorKind::InvalidPart);
    }

    #[tokio::test]
    async fn test_list_parts_pagination() {
        let b = backend();
        let id = b.create_multipart_upload("k", None).await.unwrap();
        for n in 1..=5 {
            b.upload_part("k", &id, n, Bytes::from(vec![n as u8; 3]))
                .await
                .unwrap();
        }

        let page = b.list_parts("k", &id, 0, 2).await.unwrap();
        assert_eq!(page.parts.len(), 2);
        assert!(page.is_truncated);
        assert_eq!(page.next_part_number_marker, Some(2));

        let page = b.list_parts("k", &id, 4, 2).await.unwrap();
        assert_eq!(page.parts.len(), 1);
        assert_eq!(page.parts[0].part_number, 5);
        assert!(!page.is_truncated);
    }

    #[tokio::test]
    async fn test_list_objects_pages() {
        let store = MemoryStore::new();
        for i in 0..(LIST_PAGE_SIZE + 5) {
            store
                .insert_object("bucket", &format!("k{i:05}"), Bytes::from_static(b"ab"), Utc::now())
                .await;
        }
        let b = MemoryBackend::new(store, "bucket");

        let first = b.list_objects(None).await.unwrap();
        assert_eq!(first.objects.len(), LIST_PAGE_SIZE);
        assert!(first.next_token.is_some());

        let all = list_all_objects(&b).await.unwrap();
        assert_eq!(all.len(), LIST_PAGE_SIZE + 5);
    }

    #[tokio::test]
    async fn test_unavailable_bucket_fails() {
        let store = MemoryStore::new();
        store.set_unavailable("bucket", true).await;
        let b = MemoryBackend::new(store.clone(), "bucket");
        assert!(b
            .put_object("k", Bytes::new(), PutOptions::default())
            .await
            .is_err());
        store.set_unavailable("bucket", false).await;
        assert!(b
            .put_object("k", Bytes::new(), PutOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_buckets_are_isolated() {
        let store = MemoryStore::new();
        let a = MemoryBackend::new(store.clone(), "a");
        let b = MemoryBackend::new(store.clone(), "b");
        a.put_object("k", Bytes::from_static(b"1"), PutOptions::default())
            .await
            .unwrap();
        assert!(b.get_object("k", None).await.is_err());
        assert_eq!(store.keys("a").await, vec!["k".to_string()]);
    }
}
