//! Account registry, credential store, and expiration store contracts.
//!
//! The gateway never owns persistence: every store is consumed through the
//! traits below.  The traits use manually desugared async methods (pinned
//! futures) so implementations can be shared as `Arc<dyn ...>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by every store method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

// ── Accounts ───────────────────────────────────────────────────────

/// Size and operation limits for one backend account.
///
/// A zero limit means "unlimited".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    #[serde(default)]
    pub max_size_bytes: u64,
    #[serde(default)]
    pub max_class_a_ops: u64,
}

/// Usage counters, written only by the usage sync engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub class_a_ops: u64,
    #[serde(default)]
    pub class_b_ops: u64,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// A backend storage destination with its own credentials and quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Opaque stable identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Backend access key id.
    pub access_key_id: String,
    /// Backend secret access key.
    pub secret_access_key: String,
    /// Pre-provisioned backend bucket. Unique across active accounts.
    pub bucket_name: String,
    /// Backend S3 endpoint URL.
    pub endpoint: String,
    /// Domain used to build direct links to uploaded objects.
    #[serde(default)]
    pub public_domain: String,
    /// Billing account tag used to query operation counters.
    #[serde(default)]
    pub billing_account_tag: Option<String>,
    /// Bearer token for the billing API.
    #[serde(default)]
    pub billing_api_token: Option<String>,
    #[serde(default)]
    pub quota: Quota,
    #[serde(default)]
    pub usage: Usage,
}

fn default_true() -> bool {
    true
}

impl Account {
    /// Stored size as a percentage of the size quota (0.0 when unlimited).
    pub fn usage_percent(&self) -> f64 {
        if self.quota.max_size_bytes == 0 {
            return 0.0;
        }
        self.usage.size_bytes as f64 / self.quota.max_size_bytes as f64 * 100.0
    }

    pub fn is_over_quota(&self) -> bool {
        self.usage_percent() > 100.0
    }

    pub fn is_over_ops(&self) -> bool {
        self.quota.max_class_a_ops > 0 && self.usage.class_a_ops > self.quota.max_class_a_ops
    }

    /// Active, under the size quota, and under the operation quota.
    pub fn is_available(&self) -> bool {
        self.is_active && !self.is_over_quota() && !self.is_over_ops()
    }

    /// Direct link to `key` through the account's public domain.
    ///
    /// Returns an empty string when no public domain is configured.
    pub fn public_url(&self, key: &str) -> String {
        let domain = self.public_domain.trim_end_matches('/');
        if domain.is_empty() {
            return String::new();
        }
        if domain.starts_with("http://") || domain.starts_with("https://") {
            format!("{domain}/{key}")
        } else {
            format!("https://{domain}/{key}")
        }
    }
}

// ── Credentials ────────────────────────────────────────────────────

/// A single grant held by a protocol credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
}

/// A scoped key pair bound to exactly one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    /// Globally unique access key id.
    pub access_key_id: String,
    pub secret_access_key: String,
    /// The only account this credential may operate on.
    pub account_id: String,
    #[serde(default)]
    pub permissions: HashSet<Permission>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

// ── Expirations ────────────────────────────────────────────────────

/// Scheduled deletion of one object. No record means "never expires".
#[derive(Debug, Clone, PartialEq)]
pub struct FileExpiration {
    pub id: String,
    pub account_id: String,
    pub file_key: String,
    pub expires_at: DateTime<Utc>,
}

// ── Settings ───────────────────────────────────────────────────────

/// Runtime-mutable gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Usage sync + GC period in minutes (0 disables the trigger).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_minutes: u64,
    /// Expired-file sweep period in minutes (0 disables the trigger).
    #[serde(default = "default_expiration_check")]
    pub expiration_check_minutes: u64,
    #[serde(default)]
    pub endpoint_proxy: EndpointProxy,
    #[serde(default)]
    pub virtual_hosted: VirtualHosted,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync_interval_minutes: default_sync_interval(),
            expiration_check_minutes: default_expiration_check(),
            endpoint_proxy: EndpointProxy::default(),
            virtual_hosted: VirtualHosted::default(),
        }
    }
}

/// When enabled, backend clients talk to `url` instead of each account's endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointProxy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

/// Virtual-hosted-style bucket addressing (`bucket.<base_domain>`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualHosted {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_domain: String,
}

impl VirtualHosted {
    /// The base domain, if virtual-hosted addressing is usable.
    pub fn active_domain(&self) -> Option<&str> {
        let domain = self.base_domain.trim();
        (self.enabled && !domain.is_empty()).then_some(domain)
    }
}

fn default_sync_interval() -> u64 {
    5
}

fn default_expiration_check() -> u64 {
    720
}

// ── Traits ─────────────────────────────────────────────────────────

/// Account lookup and usage persistence.
pub trait AccountRegistry: Send + Sync + 'static {
    fn list_accounts(&self) -> StoreFuture<'_, Vec<Account>>;

    fn list_active_accounts(&self) -> StoreFuture<'_, Vec<Account>>;

    /// Active accounts under both quotas.
    fn list_available_accounts(&self) -> StoreFuture<'_, Vec<Account>>;

    fn get_account_by_id(&self, id: &str) -> StoreFuture<'_, Option<Account>>;

    fn get_account_by_bucket_name(&self, name: &str) -> StoreFuture<'_, Option<Account>>;

    fn update_account_usage(&self, id: &str, usage: Usage) -> StoreFuture<'_, ()>;

    fn get_settings(&self) -> StoreFuture<'_, Settings>;

    fn update_settings(&self, settings: Settings) -> StoreFuture<'_, ()>;
}

/// Protocol credential lookup.
pub trait CredentialStore: Send + Sync + 'static {
    fn get_credential_by_access_key(&self, access_key_id: &str)
        -> StoreFuture<'_, Option<Credential>>;

    /// Stamp `last_used_at`. Callers treat failures as non-fatal.
    fn update_credential_last_used(&self, id: &str) -> StoreFuture<'_, ()>;
}

/// Per-object time-to-live records.
pub trait ExpirationStore: Send + Sync + 'static {
    /// Records whose `expires_at` is at or before `now`.
    fn list_expired_files(&self, now: DateTime<Utc>) -> StoreFuture<'_, Vec<FileExpiration>>;

    fn delete_expiration_by_id(&self, id: &str) -> StoreFuture<'_, ()>;

    fn create_expiration(
        &self,
        account_id: &str,
        file_key: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, FileExpiration>;
}
