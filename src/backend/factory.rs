//! Backend client factory.
//!
//! Builds an [`ObjectBackend`] scoped to one account.  Clients are
//! memoised by account id, bucket, credentials, and effective endpoint, so
//! a credential rotation, a bucket rename, or an endpoint-proxy toggle
//! yields a fresh client while steady-state requests reuse the existing one.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::aws::AwsBackend;
use super::client::{BackendError, ObjectBackend};
use super::memory::{MemoryBackend, MemoryStore};
use crate::registry::store::{Account, Settings};

/// Boxed future returned by [`BackendFactory::client_for`].
pub type ClientFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Arc<dyn ObjectBackend>, BackendError>> + Send + 'a>>;

/// Produces backend clients for accounts.
pub trait BackendFactory: Send + Sync + 'static {
    /// A client for `account`, honouring the endpoint proxy in `settings`.
    fn client_for<'a>(&'a self, account: &'a Account, settings: &'a Settings) -> ClientFuture<'a>;
}

/// Endpoint a client for `account` should talk to.
pub fn effective_endpoint(account: &Account, settings: &Settings) -> String {
    let proxy = &settings.endpoint_proxy;
    if proxy.enabled && !proxy.url.trim().is_empty() {
        proxy.url.trim().to_string()
    } else {
        account.endpoint.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    account_id: String,
    bucket_name: String,
    access_key_id: String,
    secret_access_key: String,
    endpoint: String,
}

/// Factory for S3-compatible SDK clients.
pub struct AwsBackendFactory {
    region: String,
    clients: Mutex<HashMap<ClientKey, Arc<dyn ObjectBackend>>>,
}

impl AwsBackendFactory {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl BackendFactory for AwsBackendFactory {
    fn client_for<'a>(&'a self, account: &'a Account, settings: &'a Settings) -> ClientFuture<'a> {
        Box::pin(async move {
            let key = ClientKey {
                account_id: account.id.clone(),
                bucket_name: account.bucket_name.clone(),
                access_key_id: account.access_key_id.clone(),
                secret_access_key: account.secret_access_key.clone(),
                endpoint: effective_endpoint(account, settings),
            };

            if let Some(client) = self
                .clients
                .lock()
                .expect("mutex poisoned")
                .get(&key)
                .cloned()
            {
                return Ok(client);
            }

            let client: Arc<dyn ObjectBackend> = Arc::new(
                AwsBackend::new(
                    &key.access_key_id,
                    &key.secret_access_key,
                    &key.endpoint,
                    &self.region,
                    &key.bucket_name,
                )
                .await,
            );

            let mut clients = self.clients.lock().expect("mutex poisoned");
            // Drop stale clients for the same account (rotated keys, renamed
            // bucket, proxy toggles).
            clients.retain(|k, _| k.account_id != key.account_id);
            debug!("cached backend client for account {}", key.account_id);
            clients.insert(key, client.clone());
            Ok(client)
        })
    }
}

/// Factory handing out views onto a shared [`MemoryStore`].
pub struct MemoryBackendFactory {
    store: Arc<MemoryStore>,
}

impl MemoryBackendFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl BackendFactory for MemoryBackendFactory {
    fn client_for<'a>(&'a self, account: &'a Account, _settings: &'a Settings) -> ClientFuture<'a> {
        Box::pin(async move {
            let client: Arc<dyn ObjectBackend> =
                Arc::new(MemoryBackend::new(self.store.clone(), &account.bucket_name));
            Ok(client)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::account;

    #[test]
    fn test_effective_endpoint() {
        let acc = account("a1", "b1", 0, 100);
        let mut settings = Settings::default();
        assert_eq!(effective_endpoint(&acc, &settings), acc.endpoint);

        settings.endpoint_proxy.url = "https://proxy.internal".to_string();
        assert_eq!(effective_endpoint(&acc, &settings), acc.endpoint);

        settings.endpoint_proxy.enabled = true;
        assert_eq!(effective_endpoint(&acc, &settings), "https://proxy.internal");
    }

    #[tokio::test]
    async fn test_aws_factory_memoises() {
        let factory = AwsBackendFactory::new("auto");
        let acc = account("a1", "b1", 0, 100);
        let settings = Settings::default();

        let first = factory.client_for(&acc, &settings).await.unwrap();
        let second = factory.client_for(&acc, &settings).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mut rotated = acc.clone();
        rotated.secret_access_key = "new-secret".to_string();
        let third = factory.client_for(&rotated, &settings).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(factory.clients.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_aws_factory_follows_bucket_rename() {
        let factory = AwsBackendFactory::new("auto");
        let acc = account("a1", "old-bucket", 0, 100);
        let settings = Settings::default();

        let first = factory.client_for(&acc, &settings).await.unwrap();
        assert_eq!(first.bucket(), "old-bucket");

        let mut renamed = acc.clone();
        renamed.bucket_name = "new-bucket".to_string();
        let second = factory.client_for(&renamed, &settings).await.unwrap();
        assert_eq!(second.bucket(), "new-bucket");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.clients.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_factory_binds_bucket() {
        let factory = MemoryBackendFactory::new(MemoryStore::new());
        let acc = account("a1", "b1", 0, 100);
        let client = factory
            .client_for(&acc, &Settings::default())
            .await
            .unwrap();
        assert_eq!(client.bucket(), "b1");
    }
}
