//! In-memory account registry.
//!
//! Holds accounts, credentials, expiration records, and settings in memory
//! with no persistence.  Seeded from configuration by the binary and used
//! directly by tests.  Uses `RwLock<HashMap>` for thread-safe access.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::store::{
    Account, AccountRegistry, Credential, CredentialStore, ExpirationStore, FileExpiration,
    Settings, StoreFuture, Usage,
};

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    /// Keyed by access key id.
    credentials: HashMap<String, Credential>,
    expirations: HashMap<String, FileExpiration>,
    settings: Settings,
}

pub struct MemoryRegistry {
    inner: RwLock<Inner>,
}

impl MemoryRegistry {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(Inner {
                settings,
                ..Inner::default()
            }),
        }
    }

    /// Insert or replace an account.
    ///
    /// Fails if another active account already uses the same bucket name.
    pub fn put_account(&self, account: Account) -> anyhow::Result<()> {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        if account.is_active {
            let clash = inner.accounts.values().any(|other| {
                other.id != account.id && other.is_active && other.bucket_name == account.bucket_name
            });
            if clash {
                anyhow::bail!(
                    "bucket {} is already bound to another active account",
                    account.bucket_name
                );
            }
        }
        inner.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    pub fn remove_account(&self, id: &str) -> bool {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        inner.accounts.remove(id).is_some()
    }

    /// Insert or replace a credential. Access key ids are globally unique;
    /// re-inserting an id under a new key retires the old key.
    pub fn put_credential(&self, credential: Credential) -> anyhow::Result<()> {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        if let Some(existing) = inner.credentials.get(&credential.access_key_id) {
            if existing.id != credential.id {
                anyhow::bail!("access key {} already exists", credential.access_key_id);
            }
        }
        inner.credentials.retain(|key, existing| {
            existing.id != credential.id || *key == credential.access_key_id
        });
        inner
            .credentials
            .insert(credential.access_key_id.clone(), credential);
        Ok(())
    }

    /// Revoke a credential. Takes effect on the next request.
    pub fn remove_credential(&self, access_key_id: &str) -> bool {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        inner.credentials.remove(access_key_id).is_some()
    }

    /// Number of pending expiration records.
    pub fn expiration_count(&self) -> usize {
        self.inner
            .read()
            .expect("rwlock poisoned")
            .expirations
            .len()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl AccountRegistry for MemoryRegistry {
    fn list_accounts(&self) -> StoreFuture<'_, Vec<Account>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            let mut accounts: Vec<Account> = inner.accounts.values().cloned().collect();
            accounts.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(accounts)
        })
    }

    fn list_active_accounts(&self) -> StoreFuture<'_, Vec<Account>> {
        Box::pin(async move {
            let mut accounts = self.list_accounts().await?;
            accounts.retain(|a| a.is_active);
            Ok(accounts)
        })
    }

    fn list_available_accounts(&self) -> StoreFuture<'_, Vec<Account>> {
        Box::pin(async move {
            let mut accounts = self.list_accounts().await?;
            accounts.retain(Account::is_available);
            Ok(accounts)
        })
    }

    fn get_account_by_id(&self, id: &str) -> StoreFuture<'_, Option<Account>> {
        let id = id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.accounts.get(&id).cloned())
        })
    }

    fn get_account_by_bucket_name(&self, name: &str) -> StoreFuture<'_, Option<Account>> {
        let name = name.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            // An active owner wins over inactive accounts sharing the name.
            let mut found: Option<&Account> = None;
            for account in inner.accounts.values().filter(|a| a.bucket_name == name) {
                match found {
                    Some(current) if current.is_active => {}
                    _ => found = Some(account),
                }
            }
            Ok(found.cloned())
        })
    }

    fn update_account_usage(&self, id: &str, usage: Usage) -> StoreFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            match inner.accounts.get_mut(&id) {
                Some(account) => {
                    account.usage = usage;
                    Ok(())
                }
                None => Err(anyhow::anyhow!("account not found: {id}")),
            }
        })
    }

    fn get_settings(&self) -> StoreFuture<'_, Settings> {
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.settings.clone())
        })
    }

    fn update_settings(&self, settings: Settings) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            inner.settings = settings;
            Ok(())
        })
    }
}

impl CredentialStore for MemoryRegistry {
    fn get_credential_by_access_key(
        &self,
        access_key_id: &str,
    ) -> StoreFuture<'_, Option<Credential>> {
        let key = access_key_id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.credentials.get(&key).cloned())
        })
    }

    fn update_credential_last_used(&self, id: &str) -> StoreFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            let credential = inner
                .credentials
                .values_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| anyhow::anyhow!("credential not found: {id}"))?;
            credential.last_used_at = Some(Utc::now());
            Ok(())
        })
    }
}

impl ExpirationStore for MemoryRegistry {
    fn list_expired_files(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<FileExpiration>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            let mut expired: Vec<FileExpiration> = inner
                .expirations
                .values()
                .filter(|e| e.expires_at <= now)
                .cloned()
                .collect();
            expired.sort_by_key(|e| e.expires_at);
            Ok(expired)
        })
    }

    fn delete_expiration_by_id(&self, id: &str) -> StoreFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            inner.expirations.remove(&id);
            Ok(())
        })
    }

    fn create_expiration(
        &self,
        account_id: &str,
        file_key: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, FileExpiration> {
        let record = FileExpiration {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            file_key: file_key.to_string(),
            expires_at,
        };
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            inner.expirations.insert(record.id.clone(), record.clone());
            Ok(record)
        })
    }
}
