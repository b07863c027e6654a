//! Multipart upload handlers.
//!
//! The gateway keeps no session table: every call is forwarded to the
//! backend that owns the upload, and an unknown upload id surfaces as
//! `NoSuchUpload` from whichever step references it.

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

use super::{header_str, iso8601, parse_copy_source, part_number, upload_id, xml_response};
use crate::backend::client::{CompletedPart, MAX_PARTS_PER_PAGE};
use crate::backend::ObjectBackend;
use crate::errors::S3Error;
use crate::xml::{self, ListPartsPage, PartEntry};

/// `POST /{bucket}/{key}?uploads` -- Initiate a multipart upload.
pub async fn create_multipart_upload(
    backend: &dyn ObjectBackend,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let content_type = header_str(headers, "content-type").map(str::to_string);
    let upload_id = backend.create_multipart_upload(key, content_type).await?;
    debug!(
        "CreateMultipartUpload {}/{} -> {}",
        backend.bucket(),
        key,
        upload_id
    );

    Ok(xml_response(xml::render_initiate_multipart_upload_result(
        backend.bucket(),
        key,
        &upload_id,
    )))
}

/// `PUT /{bucket}/{key}?partNumber={n}&uploadId={id}` -- Upload one part.
pub async fn upload_part(
    backend: &dyn ObjectBackend,
    key: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Result<Response, S3Error> {
    let part_number = part_number(query)?;
    let upload_id = upload_id(query)?;

    let etag = backend.upload_part(key, upload_id, part_number, body).await?;

    let mut response = StatusCode::OK.into_response();
    if let Ok(v) = HeaderValue::from_str(&etag) {
        response.headers_mut().insert("etag", v);
    }
    Ok(response)
}

/// `PUT /{bucket}/{key}?partNumber={n}&uploadId={id}` with
/// `x-amz-copy-source` -- Copy (a range of) an existing object into a part.
pub async fn upload_part_copy(
    backend: &dyn ObjectBackend,
    key: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let part_number = part_number(query)?;
    let upload_id = upload_id(query)?;

    let (src_bucket, src_key) = parse_copy_source(headers)?;
    if src_bucket != backend.bucket() {
        return Err(S3Error::invalid_request(
            "Cross-account copy is not supported",
        ));
    }
    let range = header_str(headers, "x-amz-copy-source-range").map(str::to_string);

    let result = backend
        .upload_part_copy(key, upload_id, part_number, &src_key, range)
        .await?;

    let last_modified = iso8601(result.last_modified.unwrap_or_else(Utc::now));
    Ok(xml_response(xml::render_copy_part_result(
        &result.etag,
        &last_modified,
    )))
}

/// Parse the `<CompleteMultipartUpload>` XML body into `(PartNumber, ETag)`
/// pairs, in document order.
fn parse_complete_multipart_upload_xml(body: &[u8]) -> Result<Vec<CompletedPart>, S3Error> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut parts = Vec::new();
    let mut current_part_number: Option<u32> = None;
    let mut current_etag: Option<String> = None;
    let mut in_part = false;
    let mut current_tag = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag_name == "Part" {
                    in_part = true;
                    current_part_number = None;
                    current_etag = None;
                } else if in_part {
                    current_tag = tag_name;
                }
            }
            Ok(Event::Text(ref e)) => {
                if in_part {
                    let text = e.unescape().map_err(|_| S3Error::MalformedXML)?.to_string();
                    match current_tag.as_str() {
                        "PartNumber" => current_part_number = text.parse::<u32>().ok(),
                        "ETag" => current_etag = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Part" {
                    in_part = false;
                    match (current_part_number, current_etag.take()) {
                        (Some(part_number), Some(etag)) => {
                            parts.push(CompletedPart { part_number, etag })
                        }
                        _ => return Err(S3Error::MalformedXML),
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    if parts.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok(parts)
}

/// `POST /{bucket}/{key}?uploadId={id}` -- Complete a multipart upload.
pub async fn complete_multipart_upload(
    backend: &dyn ObjectBackend,
    key: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<Response, S3Error> {
    let upload_id = upload_id(query)?;
    let parts = parse_complete_multipart_upload_xml(body)?;
    if parts
        .iter()
        .any(|p| !(1..=10000).contains(&p.part_number))
    {
        return Err(S3Error::InvalidPartNumber);
    }

    let count = parts.len();
    let etag = backend
        .complete_multipart_upload(key, upload_id, parts)
        .await?;
    debug!(
        "CompleteMultipartUpload {}/{} ({} parts)",
        backend.bucket(),
        key,
        count
    );

    let location = format!("/{}/{}", backend.bucket(), key);
    Ok(xml_response(xml::render_complete_multipart_upload_result(
        &location,
        backend.bucket(),
        key,
        &etag,
    )))
}

/// `DELETE /{bucket}/{key}?uploadId={id}` -- Abort a multipart upload.
pub async fn abort_multipart_upload(
    backend: &dyn ObjectBackend,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let upload_id = upload_id(query)?;
    backend.abort_multipart_upload(key, upload_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /{bucket}/{key}?uploadId={id}` -- List uploaded parts.
///
/// `max-parts` defaults to, and is capped at, 1000.  A value of 0 is
/// raised to 1 so a truncated page always carries a next marker.
pub async fn list_parts(
    backend: &dyn ObjectBackend,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let upload_id = upload_id(query)?;
    let max_parts = query
        .get("max-parts")
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(MAX_PARTS_PER_PAGE)
        .clamp(1, MAX_PARTS_PER_PAGE);
    let part_number_marker: u32 = query
        .get("part-number-marker")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut page = backend
        .list_parts(key, upload_id, part_number_marker, max_parts)
        .await?;
    if page.parts.len() > max_parts as usize {
        page.parts.truncate(max_parts as usize);
        page.is_truncated = true;
        page.next_part_number_marker = page.parts.last().map(|p| p.part_number);
    }

    let timestamps: Vec<String> = page
        .parts
        .iter()
        .map(|p| iso8601(p.last_modified.unwrap_or_else(Utc::now)))
        .collect();
    let entries: Vec<PartEntry<'_>> = page
        .parts
        .iter()
        .zip(timestamps.iter())
        .map(|(p, modified)| PartEntry {
            part_number: p.part_number,
            last_modified: modified,
            etag: &p.etag,
            size: p.size,
        })
        .collect();

    let xml = xml::render_list_parts_result(
        &ListPartsPage {
            bucket: backend.bucket(),
            key,
            upload_id,
            part_number_marker,
            next_part_number_marker: page.next_part_number_marker,
            max_parts,
            is_truncated: page.is_truncated,
        },
        &entries,
    );
    Ok(xml_response(xml))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, MemoryStore};
    use axum::body::to_bytes;
    use std::sync::Arc;

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn backend() -> (Arc<MemoryStore>, MemoryBackend) {
        let store = MemoryStore::new();
        let backend = MemoryBackend::new(store.clone(), "photos");
        (store, backend)
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn extract(xml: &str, tag: &str) -> String {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        let start = xml.find(&open).unwrap() + open.len();
        let end = xml[start..].find(&close).unwrap() + start;
        xml[start..end].to_string()
    }

    async fn initiate(backend: &MemoryBackend, key: &str) -> String {
        let resp = create_multipart_upload(backend, key, &HeaderMap::new())
            .await
            .unwrap();
        extract(&body_string(resp).await, "UploadId")
    }

    fn complete_body(parts: &[(u32, &str)]) -> Vec<u8> {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for (n, etag) in parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{n}</PartNumber><ETag>{etag}</ETag></Part>"
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");
        xml.into_bytes()
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (store, backend) = backend();
        let upload_id = initiate(&backend, "big.bin").await;

        let mut etags = Vec::new();
        for (n, chunk) in [(1u32, "hello "), (2, "world")] {
            let n = n.to_string();
            let q = query(&[("partNumber", n.as_str()), ("uploadId", upload_id.as_str())]);
            let resp = upload_part(&backend, "big.bin", &q, Bytes::from(chunk))
                .await
                .unwrap();
            etags.push(resp.headers().get("etag").unwrap().to_str().unwrap().to_string());
        }

        let body = complete_body(&[(1, etags[0].as_str()), (2, etags[1].as_str())]);
        let q = query(&[("uploadId", upload_id.as_str())]);
        let resp = complete_multipart_upload(&backend, "big.bin", &q, &body)
            .await
            .unwrap();
        let xml = body_string(resp).await;
        assert!(xml.contains("<Location>/photos/big.bin</Location>"));
        assert!(extract(&xml, "ETag").ends_with("-2&quot;"));

        assert_eq!(store.keys("photos").await, vec!["big.bin"]);
        assert_eq!(store.bucket_size("photos").await, 11);
    }

    #[tokio::test]
    async fn test_part_number_rejected_before_backend() {
        let (store, backend) = backend();
        // The backend is down, so any backend call would surface InternalError.
        store.set_unavailable("photos", true).await;
        for bad in ["0", "10001"] {
            let q = query(&[("partNumber", bad), ("uploadId", "u")]);
            let err = upload_part(&backend, "k", &q, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "InvalidPartNumber");
        }
    }

    #[tokio::test]
    async fn test_unknown_upload_is_no_such_upload() {
        let (_, backend) = backend();
        let q = query(&[("partNumber", "1"), ("uploadId", "missing")]);
        let err = upload_part(&backend, "k", &q, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchUpload");

        let q = query(&[("uploadId", "missing")]);
        let err = list_parts(&backend, "k", &q).await.unwrap_err();
        assert_eq!(err.code(), "NoSuchUpload");
        let err = abort_multipart_upload(&backend, "k", &q).await.unwrap_err();
        assert_eq!(err.code(), "NoSuchUpload");
    }

    #[tokio::test]
    async fn test_complete_after_abort() {
        let (_, backend) = backend();
        let upload_id = initiate(&backend, "k").await;
        let q = query(&[("partNumber", "1"), ("uploadId", upload_id.as_str())]);
        let resp = upload_part(&backend, "k", &q, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let etag = resp.headers().get("etag").unwrap().to_str().unwrap().to_string();

        let q = query(&[("uploadId", upload_id.as_str())]);
        let resp = abort_multipart_upload(&backend, "k", &q).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let body = complete_body(&[(1, etag.as_str())]);
        let err = complete_multipart_upload(&backend, "k", &q, &body)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NoSuchUpload");
    }

    #[tokio::test]
    async fn test_complete_wrong_etag_is_invalid_part() {
        let (_, backend) = backend();
        let upload_id = initiate(&backend, "k").await;
        let q = query(&[("partNumber", "1"), ("uploadId", upload_id.as_str())]);
        upload_part(&backend, "k", &q, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let q = query(&[("uploadId", upload_id.as_str())]);
        let body = complete_body(&[(1, "\"00000000000000000000000000000000\"")]);
        let err = complete_multipart_upload(&backend, "k", &q, &body)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidPart");
    }

    #[tokio::test]
    async fn test_upload_part_copy() {
        let (store, backend) = backend();
        store
            .insert_object("photos", "src", Bytes::from_static(b"0123456789"), Utc::now())
            .await;
        let upload_id = initiate(&backend, "dst").await;

        let mut headers = HeaderMap::new();
        headers.insert("x-amz-copy-source", HeaderValue::from_static("/photos/src"));
        headers.insert("x-amz-copy-source-range", HeaderValue::from_static("bytes=0-3"));
        let q = query(&[("partNumber", "1"), ("uploadId", upload_id.as_str())]);
        let resp = upload_part_copy(&backend, "dst", &q, &headers).await.unwrap();
        assert!(body_string(resp).await.contains("<CopyPartResult"));

        let q = query(&[("uploadId", upload_id.as_str())]);
        let xml = body_string(list_parts(&backend, "dst", &q).await.unwrap()).await;
        assert!(xml.contains("<Size>4</Size>"));

        headers.insert("x-amz-copy-source", HeaderValue::from_static("/videos/src"));
        let q = query(&[("partNumber", "2"), ("uploadId", upload_id.as_str())]);
        let err = upload_part_copy(&backend, "dst", &q, &headers).await.unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }

    #[tokio::test]
    async fn test_list_parts_capped_and_paginated() {
        let (_, backend) = backend();
        let upload_id = initiate(&backend, "k").await;
        for n in 1..=1003u32 {
            backend
                .upload_part("k", &upload_id, n, Bytes::from_static(b"p"))
                .await
                .unwrap();
        }

        let q = query(&[("uploadId", upload_id.as_str()), ("max-parts", "5000")]);
        let xml = body_string(list_parts(&backend, "k", &q).await.unwrap()).await;
        assert_eq!(xml.matches("<Part>").count(), 1000);
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
        assert!(xml.contains("<NextPartNumberMarker>1000</NextPartNumberMarker>"));

        let q = query(&[("uploadId", upload_id.as_str()), ("part-number-marker", "1000")]);
        let xml = body_string(list_parts(&backend, "k", &q).await.unwrap()).await;
        assert_eq!(xml.matches("<Part>").count(), 3);
        assert!(xml.contains("<IsTruncated>false</IsTruncated>"));
    }

    #[tokio::test]
    async fn test_list_parts_zero_max_parts_still_advances() {
        let (_, backend) = backend();
        let upload_id = initiate(&backend, "k").await;
        for n in 1..=2u32 {
            backend
                .upload_part("k", &upload_id, n, Bytes::from_static(b"p"))
                .await
                .unwrap();
        }

        let q = query(&[("uploadId", upload_id.as_str()), ("max-parts", "0")]);
        let xml = body_string(list_parts(&backend, "k", &q).await.unwrap()).await;
        assert_eq!(extract(&xml, "MaxParts"), "1");
        assert_eq!(xml.matches("<Part>").count(), 1);
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
        assert_eq!(extract(&xml, "NextPartNumberMarker"), "1");
    }

    // -- CompleteMultipartUpload XML parsing tests ----------------------------

    #[test]
    fn test_parse_complete_multipart_upload_xml_valid() {
        let xml = br#"
            <CompleteMultipartUpload>
                <Part>
                    <PartNumber>1</PartNumber>
                    <ETag>"a54357aff0632cce46d942af68356b38"</ETag>
                </Part>
                <Part>
                    <PartNumber>2</PartNumber>
                    <ETag>0c78aef83f66abc1fa1e8477f296d394</ETag>
                </Part>
            </CompleteMultipartUpload>
        "#;

        let parts = parse_complete_multipart_upload_xml(xml).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[0].etag, "\"a54357aff0632cce46d942af68356b38\"");
        assert_eq!(parts[1].part_number, 2);
        assert_eq!(parts[1].etag, "0c78aef83f66abc1fa1e8477f296d394");
    }

    #[test]
    fn test_parse_complete_multipart_upload_xml_rejects() {
        assert!(parse_complete_multipart_upload_xml(
            b"<CompleteMultipartUpload></CompleteMultipartUpload>"
        )
        .is_err());
        assert!(parse_complete_multipart_upload_xml(b"not xml at all").is_err());
        assert!(parse_complete_multipart_upload_xml(
            b"<CompleteMultipartUpload><Part><PartNumber>1</PartNumber></Part></CompleteMultipartUpload>"
        )
        .is_err());
        assert!(parse_complete_multipart_upload_xml(
            b"<CompleteMultipartUpload><Part><ETag>x</ETag></Part></CompleteMultipartUpload>"
        )
        .is_err());
    }
}
