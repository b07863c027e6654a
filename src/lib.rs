//! cloudmux -- an S3-compatible gateway over many backend storage accounts.
//!
//! Clients speak the S3 protocol to the gateway; each request is
//! authenticated with SigV4, resolved to the backend account that owns the
//! addressed bucket, and forwarded through a client scoped to that
//! account.  Background jobs keep per-account usage current, evict the
//! oldest objects from accounts over quota, and remove expired uploads.

use std::sync::Arc;

pub mod auth;
pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod last_used;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod routing;
pub mod scheduler;
pub mod server;
pub mod usage;
pub mod xml;

use crate::backend::BackendFactory;
use crate::config::Config;
use crate::last_used::LastUsedRecorder;
use crate::registry::store::{AccountRegistry, CredentialStore};

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Gateway configuration.
    pub config: Config,
    /// Accounts and runtime settings.
    pub registry: Arc<dyn AccountRegistry>,
    /// Protocol credentials.
    pub credentials: Arc<dyn CredentialStore>,
    /// Backend clients per account.
    pub backends: Arc<dyn BackendFactory>,
    /// Fire-and-forget credential `last_used_at` updates.
    pub last_used: LastUsedRecorder,
}
