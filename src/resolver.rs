//! Bucket resolution for path-style and virtual-hosted requests.
//!
//! Both addressing modes produce a [`BucketTarget`] that flows into the
//! same dispatch path; the virtual-hosted step runs before routing and
//! only computes the pair, it never rewrites the request.

use tracing::debug;

use crate::errors::S3Error;
use crate::registry::store::{Account, AccountRegistry, Credential};

/// Bucket and key addressed by a request.  `key` is empty for bucket-level
/// requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTarget {
    pub bucket: String,
    pub key: String,
}

impl BucketTarget {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

/// Extract the bucket from a virtual-hosted `Host` value.
///
/// Returns `""` when the host is not `<bucket>.<base_domain>` or the prefix
/// is not a valid bucket label.
pub fn extract_virtual_hosted_bucket(host: &str, base_domain: &str) -> String {
    let base = base_domain.trim().trim_matches('.');
    if base.is_empty() {
        return String::new();
    }

    let host = strip_port(host.trim());

    // Only the domain suffix is case-insensitive; the label is checked as sent.
    let Some(split) = host.len().checked_sub(base.len()) else {
        return String::new();
    };
    let Some(prefix) = host
        .get(split..)
        .filter(|suffix| suffix.eq_ignore_ascii_case(base))
        .and_then(|_| host.get(..split))
        .and_then(|p| p.strip_suffix('.'))
    else {
        return String::new();
    };

    if is_valid_bucket_label(prefix) {
        prefix.to_string()
    } else {
        String::new()
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// 3-63 characters of lowercase alphanumerics and hyphens, with no
/// leading or trailing hyphen.
pub fn is_valid_bucket_label(label: &str) -> bool {
    let len = label.len();
    if !(3..=63).contains(&len) {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Resolve a virtual-hosted request into a target, if the host addresses a
/// bucket under `base_domain`.  The whole path (minus the leading `/`) is
/// the key.
pub fn resolve_virtual_hosted(host: &str, base_domain: &str, path: &str) -> Option<BucketTarget> {
    let bucket = extract_virtual_hosted_bucket(host, base_domain);
    if bucket.is_empty() {
        return None;
    }
    let key = percent_encoding::percent_decode_str(path.trim_start_matches('/'))
        .decode_utf8_lossy()
        .into_owned();
    Some(BucketTarget { bucket, key })
}

/// Resolve `bucket` to its account and check that `credential` is scoped to
/// it.  Credentials never cross account boundaries, even when the bucket
/// name exists on another account.
pub async fn resolve_account(
    registry: &dyn AccountRegistry,
    bucket: &str,
    credential: &Credential,
) -> Result<Account, S3Error> {
    let account = registry
        .get_account_by_bucket_name(bucket)
        .await?
        .ok_or(S3Error::NoSuchBucket)?;

    if account.id != credential.account_id {
        debug!(
            "credential {} (account {}) denied access to bucket {} of account {}",
            credential.access_key_id, credential.account_id, bucket, account.id
        );
        return Err(S3Error::access_denied());
    }
    if !account.is_active {
        return Err(S3Error::access_denied());
    }
    Ok(account)
}
