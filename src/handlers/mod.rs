//! S3 operation handlers.
//!
//! Handlers operate on an already-authenticated, already-authorised
//! request: they receive the backend client bound to the resolved account
//! and translate between the S3 wire format and [`ObjectBackend`] calls.
//!
//! [`ObjectBackend`]: crate::backend::ObjectBackend

pub mod multipart;
pub mod object;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::errors::S3Error;

/// Wrap an XML document in a 200 response.
pub(crate) fn xml_response(xml: String) -> Response {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        )],
        xml,
    )
        .into_response()
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// ISO 8601 timestamp with millisecond precision, as S3 XML bodies use.
pub(crate) fn iso8601(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse `x-amz-copy-source` into `(bucket, key)`.
///
/// The header is URL-decoded first; a leading `/` and any `?versionId=`
/// suffix are ignored.
pub(crate) fn parse_copy_source(headers: &HeaderMap) -> Result<(String, String), S3Error> {
    let raw = header_str(headers, "x-amz-copy-source")
        .ok_or_else(|| S3Error::invalid_request("Missing x-amz-copy-source header"))?;
    let raw = raw.split_once('?').map(|(path, _)| path).unwrap_or(raw);

    let decoded = percent_encoding::percent_decode_str(raw).decode_utf8_lossy();
    let source = decoded.trim_start_matches('/');

    match source.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(S3Error::invalid_request(format!(
            "Invalid x-amz-copy-source: {raw}"
        ))),
    }
}

pub(crate) fn upload_id(query: &HashMap<String, String>) -> Result<&str, S3Error> {
    query
        .get("uploadId")
        .map(String::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| S3Error::invalid_request("Missing uploadId parameter"))
}

/// Parse and range-check `partNumber` (1..=10000).
pub(crate) fn part_number(query: &HashMap<String, String>) -> Result<u32, S3Error> {
    query
        .get("partNumber")
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|n| (1..=10000).contains(n))
        .ok_or(S3Error::InvalidPartNumber)
}
