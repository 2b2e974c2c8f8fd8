use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::commands::user_line;
use crate::scheduler::Scheduler;
use crate::store::{Filter, StoreError, UserStore, FIELD_TRIAL_START};
use crate::telegram::Notifier;

/// Interval between poll cycles.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically announces users whose trial started since the last
/// successful poll.
///
/// The watermark starts at process-start time and only moves forward, and
/// only after a query succeeds; a failed cycle retries the same window on
/// the next tick. Records created while the process was down are never
/// announced retroactively.
pub struct Poller {
    store: Arc<UserStore>,
    notifier: Arc<Notifier>,
    watermark: Mutex<DateTime<Utc>>,
    in_flight: AtomicBool,
}

impl Poller {
    pub fn new(store: Arc<UserStore>, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            notifier,
            watermark: Mutex::new(Utc::now()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Schedule this poller on a fixed interval.
    pub async fn register(self: Arc<Self>, scheduler: &Scheduler) -> Result<()> {
        scheduler
            .add_interval_job(POLL_INTERVAL, "new-user poll", move || {
                let poller = Arc::clone(&self);
                Box::pin(async move { poller.run_cycle().await })
            })
            .await
    }

    /// One poll cycle. At most one cycle runs at a time; a tick that fires
    /// while the previous cycle is still in flight is skipped.
    pub async fn run_cycle(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Previous poll cycle still running, skipping this tick");
            return;
        }

        if let Err(e) = self.poll_once().await {
            error!("New-user poll failed: {e}");
        }

        self.in_flight.store(false, Ordering::SeqCst);
    }

    async fn poll_once(&self) -> Result<(), StoreError> {
        if !self.store.is_connected() {
            debug!("Store not connected, skipping new-user poll");
            return Ok(());
        }

        let cycle_start = Utc::now();
        let since = *self.watermark.lock().await;

        let records = self
            .store
            .query_users(&[Filter::at_least(FIELD_TRIAL_START, since)])
            .await?;

        for record in &records {
            let announcement = format!("New user: {}", user_line(record));
            self.notifier.notify(&announcement).await;
        }

        if !records.is_empty() {
            info!("Announced {} new user(s)", records.len());
        }

        // Advance only after a successful query so a failed cycle retries
        // the same window.
        *self.watermark.lock().await = cycle_start;
        Ok(())
    }
}
