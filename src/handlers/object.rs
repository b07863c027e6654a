//! Object-level S3 API handlers.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

use super::{header_str, iso8601, parse_copy_source, xml_response};
use crate::backend::client::{ObjectMeta, PutOptions};
use crate::backend::ObjectBackend;
use crate::errors::S3Error;
use crate::xml::{self, DeleteErrorEntry};

/// Most keys a single DeleteObjects request may name.
const MAX_DELETE_KEYS: usize = 1000;

/// Insert a header, skipping values that are not valid header text.
fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

/// Write the object metadata headers shared by GET and HEAD.
fn apply_meta_headers(headers: &mut HeaderMap, meta: &ObjectMeta) {
    set_header(
        headers,
        "content-type",
        meta.content_type
            .as_deref()
            .unwrap_or("application/octet-stream"),
    );
    set_header(headers, "content-length", &meta.content_length.to_string());
    if let Some(etag) = &meta.etag {
        set_header(headers, "etag", etag);
    }
    if let Some(modified) = meta.last_modified {
        let date = httpdate::fmt_http_date(modified.into());
        set_header(headers, "last-modified", &date);
    }
    headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
}

/// `PUT /{bucket}/{key}` -- Store an object.
///
/// Content-Type and Content-MD5 are forwarded verbatim; the backend's ETag
/// and any checksum headers are echoed back.
pub async fn put_object(
    backend: &dyn ObjectBackend,
    key: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let opts = PutOptions {
        content_type: header_str(headers, "content-type").map(str::to_string),
        content_md5: header_str(headers, "content-md5").map(str::to_string),
    };

    let size = body.len();
    let result = backend.put_object(key, body, opts).await?;
    debug!("PutObject {}/{} ({} bytes)", backend.bucket(), key, size);

    let mut response = StatusCode::OK.into_response();
    let out = response.headers_mut();
    if let Some(etag) = &result.etag {
        set_header(out, "etag", etag);
    }
    for (name, value) in &result.checksums {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.insert(name, value);
        }
    }
    Ok(response)
}

/// `GET /{bucket}/{key}` -- Retrieve an object, honouring `Range`.
pub async fn get_object(
    backend: &dyn ObjectBackend,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let range = header_str(headers, "range").map(str::to_string);
    let object = backend.get_object(key, range).await?;

    let status = if object.content_range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut response = Response::new(Body::from(object.data));
    *response.status_mut() = status;
    let out = response.headers_mut();
    apply_meta_headers(out, &object.meta);
    if let Some(content_range) = &object.content_range {
        set_header(out, "content-range", content_range);
    }
    Ok(response)
}

/// `HEAD /{bucket}/{key}` -- Object metadata without a body.
pub async fn head_object(backend: &dyn ObjectBackend, key: &str) -> Result<Response, S3Error> {
    let meta = backend.head_object(key).await?;
    let mut response = StatusCode::OK.into_response();
    apply_meta_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `DELETE /{bucket}/{key}` -- Always 204 when the backend accepts it.
pub async fn delete_object(backend: &dyn ObjectBackend, key: &str) -> Result<Response, S3Error> {
    backend.delete_object(key).await?;
    debug!("DeleteObject {}/{}", backend.bucket(), key);
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `POST /{bucket}?delete` -- Delete several objects, one backend call each.
pub async fn delete_objects(backend: &dyn ObjectBackend, body: &[u8]) -> Result<Response, S3Error> {
    let (keys, quiet) = parse_delete_xml(body)?;
    if keys.is_empty() || keys.len() > MAX_DELETE_KEYS {
        return Err(S3Error::MalformedXML);
    }

    let mut deleted: Vec<&str> = Vec::new();
    let mut failures: Vec<(&str, &'static str, String)> = Vec::new();

    for key in &keys {
        match backend.delete_object(key).await {
            Ok(()) => deleted.push(key.as_str()),
            Err(e) => {
                warn!("DeleteObjects: failed to delete {}/{}: {}", backend.bucket(), key, e);
                let code = S3Error::from(e.clone()).code();
                failures.push((key.as_str(), code, e.message));
            }
        }
    }

    let errors: Vec<DeleteErrorEntry<'_>> = failures
        .iter()
        .map(|(key, code, message)| DeleteErrorEntry {
            key,
            code,
            message,
        })
        .collect();

    Ok(xml_response(xml::render_delete_result(
        &deleted, &errors, quiet,
    )))
}

/// Parse `<Delete>` XML body for DeleteObjects.
/// Returns a list of keys to delete and the quiet flag.
fn parse_delete_xml(body: &[u8]) -> Result<(Vec<String>, bool), S3Error> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut keys = Vec::new();
    let mut quiet = false;
    let mut saw_root = false;
    let mut current_tag = String::new();
    let mut in_object = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag_name.as_str() {
                    "Delete" => saw_root = true,
                    "Object" => in_object = true,
                    _ => {}
                }
                current_tag = tag_name;
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Object" {
                    in_object = false;
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|_| S3Error::MalformedXML)?.to_string();
                if in_object && current_tag == "Key" {
                    keys.push(text);
                } else if current_tag == "Quiet" {
                    quiet = text.eq_ignore_ascii_case("true");
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(S3Error::MalformedXML);
    }
    Ok((keys, quiet))
}

/// `PUT /{bucket}/{key}` with `x-amz-copy-source` -- Server-side copy.
///
/// Source and destination must live in the same account bucket.
pub async fn copy_object(
    backend: &dyn ObjectBackend,
    dst_key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let (src_bucket, src_key) = parse_copy_source(headers)?;
    if src_bucket != backend.bucket() {
        return Err(S3Error::invalid_request(
            "Cross-account copy is not supported",
        ));
    }

    let result = backend.copy_object(&src_key, dst_key).await?;
    debug!(
        "CopyObject {}/{} -> {}",
        backend.bucket(),
        src_key,
        dst_key
    );

    let last_modified = iso8601(result.last_modified.unwrap_or_else(Utc::now));
    Ok(xml_response(xml::render_copy_object_result(
        &result.etag,
        &last_modified,
    )))
}
