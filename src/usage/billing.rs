//! Operation counters from the provider's GraphQL analytics API.
//!
//! Each account carries its own billing token and account tag.  Counts are
//! grouped by action type and split into Class A (writes and listings) and
//! Class B (everything else).

use chrono::{DateTime, Datelike, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use crate::config::BillingConfig;
use crate::registry::store::Account;

/// Boxed future returned by [`BillingApi`] methods.
pub type BillingFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Action types billed as Class A operations.
const CLASS_A_ACTIONS: &[&str] = &[
    "ListBuckets",
    "PutBucket",
    "ListObjects",
    "ListObjectsV2",
    "PutObject",
    "CopyObject",
    "CompleteMultipartUpload",
    "CreateMultipartUpload",
    "ListMultipartUploads",
    "UploadPart",
    "UploadPartCopy",
    "ListParts",
    "PutBucketEncryption",
    "PutBucketCors",
    "PutBucketLifecycleConfiguration",
    "LifecycleStorageTierTransition",
];

const OPERATIONS_QUERY: &str = r#"query OperationCounts($accountTag: string!, $start: Time!, $end: Time!, $bucket: string!) {
  viewer {
    accounts(filter: { accountTag: $accountTag }) {
      r2OperationsAdaptiveGroups(
        limit: 10000
        filter: { datetime_geq: $start, datetime_leq: $end, bucketName: $bucket }
      ) {
        sum { requests }
        dimensions { actionType }
      }
    }
  }
}"#;

/// Monthly operation totals for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    pub class_a: u64,
    pub class_b: u64,
}

/// Source of per-account operation counters.
pub trait BillingApi: Send + Sync + 'static {
    /// Operations against `account`'s bucket between `start` and `end`.
    fn operation_counts<'a>(
        &'a self,
        account: &'a Account,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BillingFuture<'a, OperationCounts>;
}

pub fn is_class_a(action: &str) -> bool {
    CLASS_A_ACTIONS.contains(&action)
}

/// Fold `(action, requests)` groups into class totals.
pub fn classify<'a, I>(groups: I) -> OperationCounts
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    let mut counts = OperationCounts::default();
    for (action, requests) in groups {
        if is_class_a(action) {
            counts.class_a += requests;
        } else {
            counts.class_b += requests;
        }
    }
    counts
}

/// Midnight UTC on the first day of `now`'s month.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

// -- GraphQL response types ---------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<ResponseData>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResponseData {
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    #[serde(default)]
    accounts: Vec<AccountGroups>,
}

#[derive(Debug, Deserialize)]
struct AccountGroups {
    #[serde(rename = "r2OperationsAdaptiveGroups", default)]
    groups: Vec<OperationGroup>,
}

#[derive(Debug, Deserialize)]
struct OperationGroup {
    sum: GroupSum,
    dimensions: GroupDimensions,
}

#[derive(Debug, Deserialize)]
struct GroupSum {
    requests: u64,
}

#[derive(Debug, Deserialize)]
struct GroupDimensions {
    #[serde(rename = "actionType")]
    action_type: String,
}

fn parse_response(body: &str) -> anyhow::Result<OperationCounts> {
    let response: GraphqlResponse = serde_json::from_str(body)?;
    if let Some(errors) = response.errors.filter(|e| !e.is_empty()) {
        let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
        anyhow::bail!("billing API errors: {}", messages.join("; "));
    }
    let data = response
        .data
        .ok_or_else(|| anyhow::anyhow!("billing API returned no data"))?;
    Ok(classify(data.viewer.accounts.iter().flat_map(|account| {
        account
            .groups
            .iter()
            .map(|g| (g.dimensions.action_type.as_str(), g.sum.requests))
    })))
}

// -- HTTP client --------------------------------------------------------------

/// [`BillingApi`] over HTTP+JSON with a per-account bearer token.
pub struct GraphqlBillingApi {
    client: reqwest::Client,
    api_url: String,
}

impl GraphqlBillingApi {
    pub fn new(config: &BillingConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
        })
    }
}

impl BillingApi for GraphqlBillingApi {
    fn operation_counts<'a>(
        &'a self,
        account: &'a Account,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BillingFuture<'a, OperationCounts> {
        Box::pin(async move {
            let (token, tag) = match (&account.billing_api_token, &account.billing_account_tag) {
                (Some(token), Some(tag)) if !token.is_empty() && !tag.is_empty() => (token, tag),
                _ => {
                    debug!("account {} has no billing credentials", account.id);
                    return Ok(OperationCounts::default());
                }
            };

            let mut headers = HeaderMap::new();
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))?,
            );
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

            let payload = json!({
                "query": OPERATIONS_QUERY,
                "variables": {
                    "accountTag": tag,
                    "start": start.to_rfc3339(),
                    "end": end.to_rfc3339(),
                    "bucket": account.bucket_name,
                },
            });

            let resp = self
                .client
                .post(&self.api_url)
                .headers(headers)
                .json(&payload)
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                anyhow::bail!("billing API returned {status}: {body}");
            }
            parse_response(&body)
        })
    }
}
