//! Background usage accounting.
//!
//! [`sync::UsageSync`] recomputes each account's stored bytes and monthly
//! operation counts, evicts the oldest objects from accounts over quota, and
//! sweeps expired files.  [`billing`] talks to the provider's analytics API.

pub mod billing;
pub mod sync;

pub use billing::{BillingApi, GraphqlBillingApi, OperationCounts};
pub use sync::{ExpirationSweepJob, UsageSync, UsageSyncJob};
