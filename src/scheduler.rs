use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::store::ScheduleStore;

/// The single timing authority. No other component reads the wall clock to
/// decide when to act.
///
/// The loop sleeps until the earliest next occurrence across all enabled
/// entries, or until a schedule change notification interrupts the sleep so
/// a newly added near-term entry is not missed. After dispatching a
/// non-empty batch it requeries before re-sleeping, so time spent
/// dispatching never accumulates as drift.
///
/// Persistence errors are fatal: the loop halts rather than silently
/// dropping schedules. Adapter failures never reach it; the dispatcher
/// classifies those into per-role outcomes.
pub struct SchedulerLoop {
    store: Arc<ScheduleStore>,
    dispatcher: Arc<Dispatcher>,
    change: Arc<Notify>,
    shutdown: CancellationToken,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<ScheduleStore>,
        dispatcher: Arc<Dispatcher>,
        change: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatcher,
            change,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<(), EngineError> {
        info!("Scheduler loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.store.next_wake().await? {
                None => {
                    // Nothing scheduled: wait for a change or shutdown.
                    tokio::select! {
                        _ = self.change.notified() => continue,
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Some(wake_at) => {
                    let now = Utc::now();
                    if wake_at > now {
                        let dur = (wake_at - now)
                            .to_std()
                            .unwrap_or(std::time::Duration::ZERO);
                        debug!("Sleeping {:?} until next due entry", dur);
                        tokio::select! {
                            // A schedule edit re-evaluates the wake time.
                            _ = self.change.notified() => continue,
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(dur) => {}
                        }
                    }
                }
            }

            self.fire_due().await?;
        }
        info!("Scheduler loop stopped");
        Ok(())
    }

    /// Dispatch everything due right now, requerying until the batch comes
    /// back empty in case more entries became due while dispatching.
    async fn fire_due(&self) -> Result<(), EngineError> {
        loop {
            let batch = self.store.due_before(Utc::now()).await?;
            if batch.is_empty() {
                return Ok(());
            }
            debug!("Dispatching batch of {} due entr(ies)", batch.len());
            for entry in &batch {
                if self.shutdown.is_cancelled() {
                    return Ok(());
                }
                match self.dispatcher.dispatch(entry).await {
                    Ok(result) if result.all_succeeded() => {}
                    Ok(result) => {
                        error!(
                            "Entry {} fired with failures: {:?}",
                            entry.id, result.outcomes
                        );
                    }
                    // Only persistence errors escape the dispatcher; those
                    // halt the loop.
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
