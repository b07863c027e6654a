//! Account registry layer.
//!
//! Accounts, protocol credentials, expiration records, and runtime settings
//! are owned by an external store.  [`store`] defines the traits the gateway
//! consumes; [`memory::MemoryRegistry`] implements all of them in memory.

pub mod memory;
pub mod store;

#[cfg(test)]
pub(crate) mod testing {
    use super::store::{Account, Credential, Permission, Quota, Usage};

    pub fn account(id: &str, bucket: &str, size: u64, max: u64) -> Account {
        Account {
            id: id.to_string(),
            name: format!("account {id}"),
            is_active: true,
            access_key_id: format!("BACKEND-{id}"),
            secret_access_key: format!("backend-secret-{id}"),
            bucket_name: bucket.to_string(),
            endpoint: format!("https://{id}.storage.example.com"),
            public_domain: String::new(),
            billing_account_tag: None,
            billing_api_token: None,
            quota: Quota {
                max_size_bytes: max,
                max_class_a_ops: 0,
            },
            usage: Usage {
                size_bytes: size,
                ..Usage::default()
            },
        }
    }

    pub fn credential(id: &str, key: &str, account_id: &str, perms: &[Permission]) -> Credential {
        Credential {
            id: id.to_string(),
            access_key_id: key.to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            account_id: account_id.to_string(),
            permissions: perms.iter().copied().collect(),
            is_active: true,
            last_used_at: None,
        }
    }
}
