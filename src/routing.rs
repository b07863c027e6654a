//! Smart upload routing across backend accounts.
//!
//! [`SmartUploader`] picks the destination account for an upload that does
//! not name one: the available accounts are tried in ascending order of
//! usage percentage, and the first successful write wins.  The payload is a
//! single in-memory [`Bytes`] buffer replayed against every candidate, so
//! uploads are capped at `max_buffered_upload_size`.

use bytes::Bytes;
use chrono::{Duration, Utc};
use metrics::counter;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::client::PutOptions;
use crate::backend::{BackendError, BackendFactory};
use crate::metrics::{SMART_UPLOAD_ATTEMPTS_TOTAL, SMART_UPLOAD_FAILOVERS_TOTAL};
use crate::registry::store::{Account, AccountRegistry, ExpirationStore};

/// Outcomes of a routed upload that are not a success.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no available accounts")]
    NoAvailableAccounts,

    #[error("all accounts failed ({attempts} attempted): {last}")]
    AllAccountsFailed { attempts: usize, last: BackendError },

    #[error("account {0} is inactive")]
    AccountInactive(String),

    #[error("account {0} not found")]
    AccountNotFound(String),

    #[error("payload of {size} bytes exceeds the {limit} byte buffering limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("account registry: {0}")]
    Registry(#[from] anyhow::Error),
}

/// An upload to route.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub key: String,
    pub data: Bytes,
    pub content_type: Option<String>,
    /// Delete the object this long after upload.  `None` keeps it forever.
    pub ttl: Option<Duration>,
}

/// Where an upload landed.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub account_id: String,
    pub account_name: String,
    pub key: String,
    pub size: u64,
    /// Direct link through the account's public domain; empty if none.
    pub public_url: String,
}

pub struct SmartUploader {
    registry: Arc<dyn AccountRegistry>,
    expirations: Arc<dyn ExpirationStore>,
    backends: Arc<dyn BackendFactory>,
    max_buffered_upload_size: u64,
}

impl SmartUploader {
    pub fn new(
        registry: Arc<dyn AccountRegistry>,
        expirations: Arc<dyn ExpirationStore>,
        backends: Arc<dyn BackendFactory>,
        max_buffered_upload_size: u64,
    ) -> Self {
        Self {
            registry,
            expirations,
            backends,
            max_buffered_upload_size,
        }
    }

    /// Available accounts, least-loaded first.
    pub async fn candidates(&self) -> Result<Vec<Account>, RoutingError> {
        let mut accounts: Vec<Account> = self
            .registry
            .list_available_accounts()
            .await?
            .into_iter()
            .filter(Account::is_available)
            .collect();
        accounts.sort_by(|a, b| a.usage_percent().total_cmp(&b.usage_percent()));
        Ok(accounts)
    }

    /// Upload to the least-loaded account, failing over to the next one on
    /// error.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome, RoutingError> {
        self.check_size(&request)?;

        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            return Err(RoutingError::NoAvailableAccounts);
        }

        let mut last_error = None;
        let attempts = candidates.len();
        for (i, account) in candidates.iter().enumerate() {
            match self.put_to(account, &request).await {
                Ok(outcome) => {
                    counter!(SMART_UPLOAD_ATTEMPTS_TOTAL, "outcome" => "success").increment(1);
                    return Ok(outcome);
                }
                Err(e) => {
                    counter!(SMART_UPLOAD_ATTEMPTS_TOTAL, "outcome" => "failure").increment(1);
                    warn!(
                        "smart upload of {} to account {} failed: {}",
                        request.key, account.id, e
                    );
                    if i + 1 < attempts {
                        counter!(SMART_UPLOAD_FAILOVERS_TOTAL).increment(1);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(RoutingError::AllAccountsFailed {
            attempts,
            last: last_error.unwrap_or_else(|| BackendError::other("no attempt made")),
        })
    }

    /// Upload straight to `account_id`, bypassing selection.  The account
    /// must still be active.
    pub async fn upload_to_account(
        &self,
        account_id: &str,
        request: UploadRequest,
    ) -> Result<UploadOutcome, RoutingError> {
        self.check_size(&request)?;

        let account = self
            .registry
            .get_account_by_id(account_id)
            .await?
            .ok_or_else(|| RoutingError::AccountNotFound(account_id.to_string()))?;
        if !account.is_active {
            return Err(RoutingError::AccountInactive(account_id.to_string()));
        }

        self.put_to(&account, &request)
            .await
            .map_err(|last| RoutingError::AllAccountsFailed { attempts: 1, last })
    }

    fn check_size(&self, request: &UploadRequest) -> Result<(), RoutingError> {
        let size = request.data.len() as u64;
        if size > self.max_buffered_upload_size {
            return Err(RoutingError::PayloadTooLarge {
                size,
                limit: self.max_buffered_upload_size,
            });
        }
        Ok(())
    }

    async fn put_to(
        &self,
        account: &Account,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, BackendError> {
        let settings = self
            .registry
            .get_settings()
            .await
            .map_err(|e| BackendError::other(e.to_string()))?;
        let backend = self.backends.client_for(account, &settings).await?;

        debug!("uploading {} to account {}", request.key, account.id);
        backend
            .put_object(
                &request.key,
                request.data.clone(),
                PutOptions {
                    content_type: request.content_type.clone(),
                    content_md5: None,
                },
            )
            .await?;

        if let Some(ttl) = request.ttl {
            let expires_at = Utc::now() + ttl;
            if let Err(e) = self
                .expirations
                .create_expiration(&account.id, &request.key, expires_at)
                .await
            {
                warn!(
                    "uploaded {} to account {} but could not record its expiration: {}",
                    request.key, account.id, e
                );
            }
        }

        info!(
            "uploaded {} ({} bytes) to account {}",
            request.key,
            request.data.len(),
            account.id
        );
        Ok(UploadOutcome {
            account_id: account.id.clone(),
            account_name: account.name.clone(),
            key: request.key.clone(),
            size: request.data.len() as u64,
            public_url: account.public_url(&request.key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::factory::MemoryBackendFactory;
    use crate::backend::memory::MemoryStore;
    use crate::registry::memory::MemoryRegistry;
    use crate::registry::testing::account;

    struct Fixture {
        registry: Arc<MemoryRegistry>,
        store: Arc<MemoryStore>,
        uploader: SmartUploader,
    }

    /// A at 90%, B at 10%, C inactive at 0%.
    fn fixture() -> Fixture {
        let registry = Arc::new(MemoryRegistry::default());
        registry.put_account(account("a", "bucket-a", 90, 100)).unwrap();
        let mut b = account("b", "bucket-b", 10, 100);
        b.public_domain = "cdn-b.example.com".to_string();
        registry.put_account(b).unwrap();
        let mut c = account("c", "bucket-c", 0, 100);
        c.is_active = false;
        registry.put_account(c).unwrap();

        let store = MemoryStore::new();
        let uploader = SmartUploader::new(
            registry.clone(),
            registry.clone(),
            Arc::new(MemoryBackendFactory::new(store.clone())),
            1024,
        );
        Fixture {
            registry,
            store,
            uploader,
        }
    }

    fn request(key: &str) -> UploadRequest {
        UploadRequest {
            key: key.to_string(),
            data: Bytes::from_static(b"payload"),
            content_type: Some("text/plain".to_string()),
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_least_loaded_first() {
        let f = fixture();
        let ids: Vec<String> = f
            .uploader
            .candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        let outcome = f.uploader.upload(request("doc.txt")).await.unwrap();
        assert_eq!(outcome.account_id, "b");
        assert_eq!(outcome.size, 7);
        assert_eq!(outcome.public_url, "https://cdn-b.example.com/doc.txt");
        assert_eq!(f.store.keys("bucket-b").await, vec!["doc.txt"]);
    }

    #[tokio::test]
    async fn test_fails_over_to_next_account() {
        let f = fixture();
        f.store.set_unavailable("bucket-b", true).await;

        let outcome = f.uploader.upload(request("doc.txt")).await.unwrap();
        assert_eq!(outcome.account_id, "a");
        assert!(f.store.keys("bucket-b").await.is_empty());
        assert_eq!(f.store.keys("bucket-a").await, vec!["doc.txt"]);
    }

    #[tokio::test]
    async fn test_all_failed_surfaces_last_error() {
        let f = fixture();
        f.store.set_unavailable("bucket-a", true).await;
        f.store.set_unavailable("bucket-b", true).await;

        match f.uploader.upload(request("doc.txt")).await {
            Err(RoutingError::AllAccountsFailed { attempts, last }) => {
                assert_eq!(attempts, 2);
                // A is tried last.
                assert!(last.message.contains("bucket-a"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(f.store.keys("bucket-c").await.is_empty());
    }

    #[tokio::test]
    async fn test_no_available_accounts() {
        let registry = Arc::new(MemoryRegistry::default());
        registry.put_account(account("full", "bucket-f", 150, 100)).unwrap();
        let uploader = SmartUploader::new(
            registry.clone(),
            registry,
            Arc::new(MemoryBackendFactory::new(MemoryStore::new())),
            1024,
        );
        assert!(matches!(
            uploader.upload(request("x")).await,
            Err(RoutingError::NoAvailableAccounts)
        ));
    }

    #[tokio::test]
    async fn test_payload_too_large_rejected_before_backend() {
        let f = fixture();
        let mut req = request("big.bin");
        req.data = Bytes::from(vec![0u8; 2048]);
        assert!(matches!(
            f.uploader.upload(req).await,
            Err(RoutingError::PayloadTooLarge {
                size: 2048,
                limit: 1024
            })
        ));
        assert!(f.store.keys("bucket-b").await.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_creates_expiration() {
        let f = fixture();
        let mut req = request("tmp.txt");
        req.ttl = Some(Duration::hours(1));
        f.uploader.upload(req).await.unwrap();
        assert_eq!(f.registry.expiration_count(), 1);

        f.uploader.upload(request("keep.txt")).await.unwrap();
        assert_eq!(f.registry.expiration_count(), 1);
    }

    #[tokio::test]
    async fn test_direct_upload_enforces_active() {
        let f = fixture();
        assert!(matches!(
            f.uploader.upload_to_account("c", request("x")).await,
            Err(RoutingError::AccountInactive(_))
        ));
        assert!(matches!(
            f.uploader.upload_to_account("zz", request("x")).await,
            Err(RoutingError::AccountNotFound(_))
        ));

        // Direct uploads ignore load ordering.
        let outcome = f.uploader.upload_to_account("a", request("x")).await.unwrap();
        assert_eq!(outcome.account_id, "a");
    }
}
