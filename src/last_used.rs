//! Best-effort credential `last_used_at` updates.
//!
//! Authentication enqueues the credential id on a bounded channel and
//! returns immediately; a single worker drains the queue into the
//! credential store.  A full queue drops the update.

use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics::LAST_USED_DROPPED_TOTAL;
use crate::registry::store::CredentialStore;

/// Handle for enqueueing last-used updates.  Cheap to clone.
#[derive(Clone)]
pub struct LastUsedRecorder {
    tx: mpsc::Sender<String>,
}

impl LastUsedRecorder {
    /// Start the worker on the current tokio runtime.
    ///
    /// The worker exits once every recorder handle has been dropped.
    pub fn spawn(store: Arc<dyn CredentialStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(credential_id) = rx.recv().await {
                if let Err(e) = store.update_credential_last_used(&credential_id).await {
                    warn!("failed to update last_used for credential {}: {}", credential_id, e);
                }
            }
            debug!("last-used worker stopped");
        });
        (Self { tx }, worker)
    }

    /// Enqueue an update for `credential_id`.  Never blocks; returns
    /// `false` if the update was dropped.
    pub fn record(&self, credential_id: &str) -> bool {
        match self.tx.try_send(credential_id.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(LAST_USED_DROPPED_TOTAL).increment(1);
                warn!("last-used queue full, dropping update for {}", credential_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("last-used worker gone, dropping update for {}", credential_id);
                false
            }
        }
    }
}
