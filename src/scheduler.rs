//! Periodic background triggers.
//!
//! Two triggers run on independent timers: usage sync (with GC) and the
//! expired-file sweep.  Each trigger owns an async mutex that outlives
//! reloads, so a firing that finds the previous run still in progress is
//! skipped rather than overlapping it.  Runs are detached from the trigger
//! loop, which lets [`Scheduler::stop`] return without waiting for them.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::registry::store::{AccountRegistry, Settings};

/// Boxed future returned by [`ScheduledTask::run`].
pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Work driven by a trigger.  Errors are the task's to log.
pub trait ScheduledTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn run(&self) -> TaskFuture<'_>;
}

struct Trigger {
    task: Arc<dyn ScheduledTask>,
    busy: Arc<tokio::sync::Mutex<()>>,
}

impl Trigger {
    fn new(task: Arc<dyn ScheduledTask>) -> Self {
        Self {
            task,
            busy: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Spawn the timer loop, or nothing if `minutes` is 0.
    fn spawn(&self, minutes: u64) -> Option<JoinHandle<()>> {
        let name = self.task.name();
        if minutes == 0 {
            info!("{} trigger disabled", name);
            return None;
        }
        let period = Duration::from_secs(minutes * 60);
        info!("{} trigger every {} minutes", name, minutes);

        let task = self.task.clone();
        let busy = self.busy.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Ok(guard) = busy.clone().try_lock_owned() else {
                    debug!("{} still running, skipping this firing", name);
                    continue;
                };
                let task = task.clone();
                tokio::spawn(async move {
                    debug!("{} run starting", name);
                    task.run().await;
                    drop(guard);
                });
            }
        }))
    }
}

/// Owner of the background triggers.
pub struct Scheduler {
    sync: Trigger,
    sweep: Trigger,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(sync: Arc<dyn ScheduledTask>, sweep: Arc<dyn ScheduledTask>) -> Self {
        Self {
            sync: Trigger::new(sync),
            sweep: Trigger::new(sweep),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Install triggers for `settings`, replacing any running ones.
    pub fn start(&self, settings: &Settings) {
        let mut handles = self.handles.lock().expect("mutex poisoned");
        for handle in handles.drain(..) {
            handle.abort();
        }
        handles.extend(self.sync.spawn(settings.sync_interval_minutes));
        handles.extend(self.sweep.spawn(settings.expiration_check_minutes));
    }

    /// Swap in triggers for updated settings.
    ///
    /// Old triggers are aborted under the same lock that installs the new
    /// ones, so the two never fire side by side.
    pub fn reload(&self, settings: &Settings) {
        info!("reloading scheduler");
        self.start(settings);
    }

    /// Persist new settings and re-arm the triggers from them.
    pub async fn apply_settings(
        &self,
        registry: &dyn AccountRegistry,
        settings: Settings,
    ) -> anyhow::Result<()> {
        registry.update_settings(settings.clone()).await?;
        self.reload(&settings);
        Ok(())
    }

    /// Stop all triggers.  In-flight runs are left to finish on their own.
    pub fn stop(&self) {
        let mut handles = self.handles.lock().expect("mutex poisoned");
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    /// Number of installed triggers.
    pub fn active_triggers(&self) -> usize {
        self.handles.lock().expect("mutex poisoned").len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}
