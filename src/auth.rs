//! AWS Signature Version 4 authentication.
//!
//! Verifies `Authorization: AWS4-HMAC-SHA256 ...` headers against the
//! secret of a protocol credential and resolves the credential's bound
//! account.  The core algorithm follows the AWS SigV4 specification:
//! 1. Build a canonical request
//! 2. Build a string-to-sign
//! 3. Derive a signing key via HMAC chain
//! 4. Compute and compare the signature
//!
//! Credentials are looked up on every request; nothing is cached, so a
//! revoked key stops working immediately.

use axum::http::{HeaderMap, Method, Uri};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::errors::S3Error;
use crate::registry::store::{Account, AccountRegistry, Credential, CredentialStore};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Payload hash used when `x-amz-content-sha256` is absent.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

// ── Parsed types ────────────────────────────────────────────────────

/// Parsed components from an Authorization header.
#[derive(Debug, Clone)]
pub struct ParsedAuthorization {
    /// The access key ID from the Credential field.
    pub access_key_id: String,
    /// The date stamp (YYYYMMDD) from the Credential field.
    pub date_stamp: String,
    /// The region from the Credential field.
    pub region: String,
    /// The service from the Credential field.
    pub service: String,
    /// The signed headers exactly as supplied (semicolon-separated).
    pub signed_headers: String,
    /// The provided signature (hex).
    pub signature: String,
    /// `date/region/service/aws4_request`.
    pub credential_scope: String,
}

/// An authenticated caller: the credential and the account it is bound to.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub credential: Credential,
    pub account: Account,
}

// ── Authorization header parsing ────────────────────────────────────

/// Parse the `Authorization` header value into its components.
///
/// Expected format:
/// ```text
/// AWS4-HMAC-SHA256 Credential=AKID/20260222/auto/s3/aws4_request, SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature=abcdef...
/// ```
pub fn parse_authorization_header(header: &str) -> Result<ParsedAuthorization, String> {
    let rest = header
        .trim()
        .strip_prefix(ALGORITHM)
        .ok_or("Authorization header does not start with AWS4-HMAC-SHA256")?;
    if !rest.starts_with(char::is_whitespace) {
        return Err("Unsupported authorization algorithm".to_string());
    }

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;

    for part in rest.trim().split(',') {
        let part = part.trim();
        if let Some(val) = part.strip_prefix("Credential=") {
            credential = Some(val.trim().to_string());
        } else if let Some(val) = part.strip_prefix("SignedHeaders=") {
            signed_headers = Some(val.trim().to_string());
        } else if let Some(val) = part.strip_prefix("Signature=") {
            signature = Some(val.trim().to_string());
        }
    }

    let credential = credential.ok_or("Missing Credential in Authorization header")?;
    let signed_headers = signed_headers.unwrap_or_default();
    let signature = signature.unwrap_or_default();

    // AKID/YYYYMMDD/region/service/aws4_request
    let parts: Vec<&str> = credential.split('/').collect();
    if parts.len() != 5 {
        return Err("Invalid Credential format in Authorization header".to_string());
    }
    if parts[4] != "aws4_request" {
        return Err("Credential must end with aws4_request".to_string());
    }
    if parts[1].len() != 8 || !parts[1].bytes().all(|b| b.is_ascii_digit()) {
        return Err("Invalid date in Credential".to_string());
    }
    if parts[0].is_empty() || signature.is_empty() || signed_headers.is_empty() {
        return Err("Authorization header has empty fields".to_string());
    }

    Ok(ParsedAuthorization {
        access_key_id: parts[0].to_string(),
        date_stamp: parts[1].to_string(),
        region: parts[2].to_string(),
        service: parts[3].to_string(),
        credential_scope: parts[1..].join("/"),
        signed_headers,
        signature,
    })
}

// ── Canonical request ───────────────────────────────────────────────

/// Build the canonical request.
///
/// ```text
/// HTTPMethod + '\n' +
/// CanonicalURI + '\n' +
/// CanonicalQueryString + '\n' +
/// CanonicalHeaders + '\n' +
/// SignedHeaders + '\n' +
/// HashedPayload
/// ```
///
/// `headers` holds `(lowercase-name, value)` pairs; the `host` entry must
/// already carry the request host.  Signed header names keep their case
/// in the signed-header line and are lower-cased for lookup.
pub fn build_canonical_request(
    method: &str,
    raw_path: &str,
    query_string: &str,
    headers: &[(String, String)],
    signed_headers_str: &str,
    payload_hash: &str,
) -> String {
    let canonical_uri = s3_uri_encode_path(raw_path);
    let canonical_query = build_canonical_query_string(query_string);

    let mut canonical_headers = String::new();
    for name in signed_headers_str.split(';') {
        let lower = name.to_ascii_lowercase();
        let value = find_header_value(headers, &lower).unwrap_or_default();
        canonical_headers.push_str(&lower);
        canonical_headers.push(':');
        canonical_headers.push_str(&collapse_whitespace(value));
        canonical_headers.push('\n');
    }

    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers_str}\n{payload_hash}"
    )
}

/// Build the canonical query string from a raw query string.
///
/// Parameters are sorted by name then value, and each name and value is
/// URI-encoded (including `/`).  The raw query is already percent-encoded,
/// so each component is decoded first to avoid double-encoding.
/// Parameters with no value use an empty value: `uploads=`.
pub fn build_canonical_query_string(query_string: &str) -> String {
    let mut params: Vec<(String, String)> = query_string
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            (
                s3_uri_encode_bytes(&percent_decode(k), true),
                s3_uri_encode_bytes(&percent_decode(v), true),
            )
        })
        .collect();

    params.sort();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

// ── String to sign ──────────────────────────────────────────────────

/// Build the string to sign.
pub fn build_string_to_sign(
    timestamp: &str,
    credential_scope: &str,
    canonical_request: &str,
) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{timestamp}\n{credential_scope}\n{hash}")
}

// ── Signing key derivation ──────────────────────────────────────────

/// Derive the signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC-SHA256("AWS4" + secret, dateStamp)
/// kRegion  = HMAC-SHA256(kDate, region)
/// kService = HMAC-SHA256(kRegion, service)
/// kSigning = HMAC-SHA256(kService, "aws4_request")
/// ```
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute the signature: HexEncode(HMAC-SHA256(SigningKey, StringToSign)).
pub fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

/// Compare two signature strings in constant time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ── Verification ────────────────────────────────────────────────────

/// Verify a header-signed request against `secret_key`.
pub fn verify_signature(
    method: &str,
    raw_path: &str,
    query_string: &str,
    headers: &[(String, String)],
    parsed: &ParsedAuthorization,
    secret_key: &str,
) -> bool {
    let payload_hash =
        find_header_value(headers, "x-amz-content-sha256").unwrap_or(UNSIGNED_PAYLOAD);

    let canonical_request = build_canonical_request(
        method,
        raw_path,
        query_string,
        headers,
        &parsed.signed_headers,
        payload_hash,
    );

    let timestamp = find_header_value(headers, "x-amz-date")
        .or_else(|| find_header_value(headers, "date"))
        .unwrap_or_default();

    let string_to_sign =
        build_string_to_sign(timestamp, &parsed.credential_scope, &canonical_request);
    let signing_key = derive_signing_key(
        secret_key,
        &parsed.date_stamp,
        &parsed.region,
        &parsed.service,
    );

    let computed = compute_signature(&signing_key, &string_to_sign);
    constant_time_eq(&computed, &parsed.signature)
}

/// Authenticate a request and resolve the caller's account.
///
/// Failure mapping:
/// - missing or malformed header: `InvalidRequest`
/// - unknown access key: `InvalidAccessKeyId`
/// - inactive credential, missing or inactive account: `AccessDenied`
/// - bad signature: `SignatureDoesNotMatch`
pub async fn authenticate(
    credentials: &dyn CredentialStore,
    registry: &dyn AccountRegistry,
    method: &Method,
    uri: &Uri,
    header_map: &HeaderMap,
) -> Result<AuthContext, S3Error> {
    let header = header_map
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| S3Error::invalid_request("Missing Authorization header"))?;

    let parsed = parse_authorization_header(header).map_err(S3Error::invalid_request)?;

    let credential = credentials
        .get_credential_by_access_key(&parsed.access_key_id)
        .await?
        .ok_or_else(|| {
            debug!("unknown access key: {}", parsed.access_key_id);
            S3Error::InvalidAccessKeyId
        })?;
    if !credential.is_active {
        debug!("inactive access key: {}", parsed.access_key_id);
        return Err(S3Error::access_denied());
    }

    let headers = extract_headers_for_signing(header_map, &request_host(uri, header_map));
    let query = uri.query().unwrap_or("");
    if !verify_signature(
        method.as_str(),
        uri.path(),
        query,
        &headers,
        &parsed,
        &credential.secret_access_key,
    ) {
        debug!("signature mismatch for access key {}", parsed.access_key_id);
        return Err(S3Error::SignatureDoesNotMatch);
    }

    let account = registry
        .get_account_by_id(&credential.account_id)
        .await?
        .filter(|a| a.is_active)
        .ok_or_else(S3Error::access_denied)?;

    debug!(
        "auth OK for access key {} (account {})",
        parsed.access_key_id, account.id
    );
    Ok(AuthContext {
        credential,
        account,
    })
}

/// The request host: the `Host` header, else the URI authority.
pub fn request_host(uri: &Uri, headers: &HeaderMap) -> String {
    headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

// ── URI encoding ────────────────────────────────────────────────────

/// S3-compatible URI encoding (RFC 3986 with S3 exceptions).
///
/// - Characters A-Z, a-z, 0-9, -, _, ., ~ are NOT encoded.
/// - All other characters are percent-encoded with uppercase hex.
/// - If `encode_slash` is false, `/` is NOT encoded (for URI paths).
pub fn s3_uri_encode(input: &str, encode_slash: bool) -> String {
    s3_uri_encode_bytes(input.as_bytes(), encode_slash)
}

/// [`s3_uri_encode`] over raw bytes, which need not be valid UTF-8.
fn s3_uri_encode_bytes(input: &[u8], encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len() * 2);
    for &byte in input {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// URI-encode a raw request path for the canonical request.
///
/// The path may already be percent-encoded, so it is decoded first and
/// then re-encoded with `/` left intact.
pub fn s3_uri_encode_path(raw_path: &str) -> String {
    if raw_path.is_empty() {
        return "/".to_string();
    }
    let encoded = s3_uri_encode_bytes(&percent_decode(raw_path), false);
    if encoded.starts_with('/') {
        encoded
    } else {
        format!("/{encoded}")
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Collapse consecutive whitespace in a header value to a single space,
/// and trim leading/trailing whitespace.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// Decode to raw bytes; escapes that are not UTF-8 must survive re-encoding.
fn percent_decode(s: &str) -> Cow<'_, [u8]> {
    percent_encoding::percent_decode_str(s).into()
}

/// Extract headers as sorted `(lowercase-name, value)` pairs, with `host`
/// replaced by the resolved request host.
pub fn extract_headers_for_signing(header_map: &HeaderMap, host: &str) -> Vec<(String, String)> {
    let mut header_values: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in header_map.iter() {
        let val_str = value.to_str().unwrap_or("").to_string();
        header_values
            .entry(name.as_str().to_ascii_lowercase())
            .or_default()
            .push(val_str);
    }
    header_values.insert("host".to_string(), vec![host.to_string()]);

    header_values
        .into_iter()
        .map(|(name, values)| (name, values.join(",")))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use axum::http::HeaderValue;

    /// Sign a request in place the way an SDK would.
    pub fn sign(
        method: &str,
        uri: &str,
        headers: &mut HeaderMap,
        access_key: &str,
        secret: &str,
        timestamp: &str,
    ) {
        let uri: Uri = uri.parse().unwrap();
        let date_stamp = &timestamp[..8];
        headers.insert("x-amz-date", HeaderValue::from_str(timestamp).unwrap());
        if !headers.contains_key("x-amz-content-sha256") {
            headers.insert(
                "x-amz-content-sha256",
                HeaderValue::from_static(UNSIGNED_PAYLOAD),
            );
        }

        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let host = request_host(&uri, headers);
        let pairs = extract_headers_for_signing(headers, &host);
        let payload = find_header_value(&pairs, "x-amz-content-sha256")
            .unwrap()
            .to_string();
        let canonical = build_canonical_request(
            method,
            uri.path(),
            uri.query().unwrap_or(""),
            &pairs,
            signed_headers,
            &payload,
        );
        let scope = format!("{date_stamp}/auto/s3/aws4_request");
        let sts = build_string_to_sign(timestamp, &scope, &canonical);
        let key = derive_signing_key(secret, date_stamp, "auto", "s3");
        let signature = compute_signature(&key, &sts);

        let value = format!(
            "{ALGORITHM} Credential={access_key}/{scope}, SignedHeaders={signed_headers}, Signature={signature}"
        );
        headers.insert("authorization", HeaderValue::from_str(&value).unwrap());
    }
}
