//! Usage sync, quota GC, and the expired-file sweep.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::billing::{month_start, BillingApi, OperationCounts};
use crate::backend::client::{list_all_objects, ObjectSummary};
use crate::backend::{BackendFactory, ObjectBackend};
use crate::metrics::{
    EXPIRED_OBJECTS_REMOVED_TOTAL, GC_DELETED_OBJECTS_TOTAL, GC_FREED_BYTES_TOTAL,
    USAGE_SYNC_RUNS_TOTAL,
};
use crate::registry::store::{Account, AccountRegistry, ExpirationStore, Settings, Usage};
use crate::scheduler::{ScheduledTask, TaskFuture};

/// GC shrinks an over-quota account to this share of its quota, in permille.
const GC_TARGET_PERMILLE: u128 = 995;

/// Result of syncing one account.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub account_id: String,
    /// Size persisted after GC.
    pub size_bytes: u64,
    pub class_a_ops: u64,
    pub class_b_ops: u64,
    pub gc: GcReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub deleted: usize,
    pub freed_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Objects deleted and their records removed.
    pub removed: usize,
    /// Records dropped because their account no longer exists.
    pub orphaned: usize,
    /// Records kept for the next sweep after a failed delete.
    pub failed: usize,
}

/// Size GC aims for on an over-quota account.
pub fn gc_target(max_size_bytes: u64) -> u64 {
    (max_size_bytes as u128 * GC_TARGET_PERMILLE / 1000) as u64
}

/// Keeps account usage current.  Cheap to clone.
#[derive(Clone)]
pub struct UsageSync {
    registry: Arc<dyn AccountRegistry>,
    expirations: Arc<dyn ExpirationStore>,
    backends: Arc<dyn BackendFactory>,
    billing: Arc<dyn BillingApi>,
    billing_timeout: Duration,
}

impl UsageSync {
    pub fn new(
        registry: Arc<dyn AccountRegistry>,
        expirations: Arc<dyn ExpirationStore>,
        backends: Arc<dyn BackendFactory>,
        billing: Arc<dyn BillingApi>,
        billing_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            expirations,
            backends,
            billing,
            billing_timeout,
        }
    }

    /// Sync every active account concurrently.
    ///
    /// A failing account is logged and left out of the returned reports.
    pub async fn sync_all(&self) -> anyhow::Result<Vec<SyncReport>> {
        let accounts = self.registry.list_active_accounts().await?;
        let settings = self.registry.get_settings().await?;
        info!("syncing usage for {} accounts", accounts.len());

        let mut tasks = JoinSet::new();
        for account in accounts {
            let this = self.clone();
            let settings = settings.clone();
            tasks.spawn(async move {
                let result = this.sync_account(&account, &settings).await;
                (account.id, result)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(report))) => {
                    counter!(USAGE_SYNC_RUNS_TOTAL, "outcome" => "success").increment(1);
                    reports.push(report);
                }
                Ok((account_id, Err(e))) => {
                    counter!(USAGE_SYNC_RUNS_TOTAL, "outcome" => "failure").increment(1);
                    warn!("usage sync failed for account {}: {:#}", account_id, e);
                }
                Err(e) => {
                    counter!(USAGE_SYNC_RUNS_TOTAL, "outcome" => "failure").increment(1);
                    warn!("usage sync task panicked: {}", e);
                }
            }
        }
        reports.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(reports)
    }

    /// Recompute one account's usage, persist it, then run GC.
    pub async fn sync_account(
        &self,
        account: &Account,
        settings: &Settings,
    ) -> anyhow::Result<SyncReport> {
        let backend = self.backends.client_for(account, settings).await?;
        let objects = list_all_objects(backend.as_ref()).await?;
        let size_bytes: u64 = objects.iter().map(|o| o.size).sum();

        let ops = self.operation_counts(account).await;

        let mut synced = account.clone();
        synced.usage = Usage {
            size_bytes,
            class_a_ops: ops.class_a,
            class_b_ops: ops.class_b,
            last_sync_at: Some(Utc::now()),
        };
        self.registry
            .update_account_usage(&synced.id, synced.usage.clone())
            .await?;
        debug!(
            "account {}: {} objects, {} bytes, {} class A, {} class B",
            synced.id,
            objects.len(),
            size_bytes,
            ops.class_a,
            ops.class_b
        );

        let gc = self
            .collect_garbage(backend.as_ref(), &synced, objects)
            .await?;

        Ok(SyncReport {
            account_id: synced.id,
            size_bytes: size_bytes.saturating_sub(gc.freed_bytes),
            class_a_ops: ops.class_a,
            class_b_ops: ops.class_b,
            gc,
        })
    }

    /// Billing counters for the current month, or zero if the API fails.
    async fn operation_counts(&self, account: &Account) -> OperationCounts {
        let now = Utc::now();
        let call = self
            .billing
            .operation_counts(account, month_start(now), now);
        match tokio::time::timeout(self.billing_timeout, call).await {
            Ok(Ok(counts)) => counts,
            Ok(Err(e)) => {
                warn!(
                    "billing API failed for account {}, counting zero operations: {:#}",
                    account.id, e
                );
                OperationCounts::default()
            }
            Err(_) => {
                warn!(
                    "billing API timed out for account {}, counting zero operations",
                    account.id
                );
                OperationCounts::default()
            }
        }
    }

    /// Delete the oldest objects until `account` is back under
    /// [`gc_target`].  A no-op unless the account is over quota.
    ///
    /// Delete failures are logged and skipped.  The reduced size is
    /// persisted when anything was freed.
    pub async fn collect_garbage(
        &self,
        backend: &dyn ObjectBackend,
        account: &Account,
        mut objects: Vec<ObjectSummary>,
    ) -> anyhow::Result<GcReport> {
        if !account.is_over_quota() {
            return Ok(GcReport::default());
        }

        let current = account.usage.size_bytes;
        let target = gc_target(account.quota.max_size_bytes);
        let to_free = current.saturating_sub(target);
        info!(
            "account {} is over quota ({} / {} bytes), freeing {} bytes",
            account.id, current, account.quota.max_size_bytes, to_free
        );

        objects.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));

        let mut report = GcReport::default();
        for object in &objects {
            if report.freed_bytes >= to_free {
                break;
            }
            match backend.delete_object(&object.key).await {
                Ok(()) => {
                    debug!("gc deleted {} ({} bytes) from {}", object.key, object.size, account.id);
                    report.deleted += 1;
                    report.freed_bytes += object.size;
                }
                Err(e) => {
                    warn!("gc failed to delete {} from {}: {}", object.key, account.id, e);
                }
            }
        }

        counter!(GC_DELETED_OBJECTS_TOTAL).increment(report.deleted as u64);
        counter!(GC_FREED_BYTES_TOTAL).increment(report.freed_bytes);

        if report.freed_bytes > 0 {
            let mut usage = account.usage.clone();
            usage.size_bytes = current.saturating_sub(report.freed_bytes);
            self.registry
                .update_account_usage(&account.id, usage)
                .await?;
        }
        if report.freed_bytes < to_free {
            warn!(
                "gc freed only {} of {} bytes for account {}",
                report.freed_bytes, to_free, account.id
            );
        }
        Ok(report)
    }

    /// Delete every object whose expiration has passed, then its record.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let expired = self.expirations.list_expired_files(now).await?;
        if expired.is_empty() {
            return Ok(SweepReport::default());
        }
        let settings = self.registry.get_settings().await?;
        info!("sweeping {} expired files", expired.len());

        let mut report = SweepReport::default();
        for record in expired {
            let Some(account) = self.registry.get_account_by_id(&record.account_id).await? else {
                debug!(
                    "dropping expiration {} for missing account {}",
                    record.id, record.account_id
                );
                self.expirations.delete_expiration_by_id(&record.id).await?;
                report.orphaned += 1;
                continue;
            };

            let deleted = match self.backends.client_for(&account, &settings).await {
                Ok(backend) => backend.delete_object(&record.file_key).await,
                Err(e) => Err(e),
            };
            match deleted {
                Ok(()) => {
                    self.expirations.delete_expiration_by_id(&record.id).await?;
                    counter!(EXPIRED_OBJECTS_REMOVED_TOTAL).increment(1);
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(
                        "failed to delete expired {} from account {}: {}",
                        record.file_key, account.id, e
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Scheduler adapter for [`UsageSync::sync_all`].
pub struct UsageSyncJob(pub UsageSync);

impl ScheduledTask for UsageSyncJob {
    fn name(&self) -> &'static str {
        "usage-sync"
    }

    fn run(&self) -> TaskFuture<'_> {
        Box::pin(async move {
            if let Err(e) = self.0.sync_all().await {
                warn!("usage sync run failed: {:#}", e);
            }
        })
    }
}

/// Scheduler adapter for [`UsageSync::sweep_expired`].
pub struct ExpirationSweepJob(pub UsageSync);

impl ScheduledTask for ExpirationSweepJob {
    fn name(&self) -> &'static str {
        "expiration-sweep"
    }

    fn run(&self) -> TaskFuture<'_> {
        Box::pin(async move {
            match self.0.sweep_expired(Utc::now()).await {
                Ok(report) if report != SweepReport::default() => info!(
                    "expiration sweep: {} removed, {} orphaned, {} failed",
                    report.removed, report.orphaned, report.failed
                ),
                Ok(_) => {}
                Err(e) => warn!("expiration sweep failed: {:#}", e),
            }
        })
    }
}
