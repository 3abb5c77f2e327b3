use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use deferq_queue::WorkQueue;

use super::WorkerHandle;
use crate::config::WorkerSchedule;
use crate::delay_queue::{DelayQueue, DelayQueueError};
use crate::store::ItemStore;

/// Periodic dispatch loop.
///
/// - Runs `run_once` on every tick of `schedule.interval` (first tick at once)
/// - Ticks missed while a pass is running are skipped, not replayed
/// - Optionally sweeps stale claims after each pass
/// - Stops when `cancel` fires or the handle is shut down
#[derive(Debug)]
pub struct DispatchWorker;

impl DispatchWorker {
    pub fn spawn<S, Q>(
        name: &'static str,
        delay_queue: Arc<DelayQueue<S, Q>>,
        schedule: WorkerSchedule,
        cancel: CancellationToken,
    ) -> WorkerHandle
    where
        S: ItemStore + 'static,
        Q: WorkQueue + 'static,
    {
        let token = cancel.child_token();
        let join = tokio::spawn(worker_loop(name, delay_queue, schedule, token.clone()));
        WorkerHandle::new(token, join)
    }
}

async fn worker_loop<S, Q>(
    name: &'static str,
    delay_queue: Arc<DelayQueue<S, Q>>,
    schedule: WorkerSchedule,
    cancel: CancellationToken,
) where
    S: ItemStore,
    Q: WorkQueue,
{
    let mut ticker = tokio::time::interval(schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(worker = name, interval_secs = schedule.interval.as_secs(), "dispatch worker started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match delay_queue.run_once(&cancel).await {
            Ok(report) => {
                if report.examined() > 0 || !report.is_clean() {
                    info!(
                        worker = name,
                        dispatched = report.dispatched.len(),
                        contended = report.contended.len(),
                        claim_errors = report.claim_errors.len(),
                        push_failures = report.push_failures.len(),
                        "dispatch pass finished"
                    );
                }
            }
            Err(DelayQueueError::Cancelled) => break,
            Err(err) => warn!(worker = name, error = %err, "dispatch pass failed"),
        }

        if let Some(older_than) = schedule.stale_claim_after {
            match delay_queue
                .sweep_stale_claims(older_than, schedule.sweep_limit, &cancel)
                .await
            {
                Ok(swept) if !swept.is_empty() => {
                    warn!(worker = name, swept = swept.len(), "stale claims removed");
                }
                Ok(_) => {}
                Err(DelayQueueError::Cancelled) => break,
                Err(err) => warn!(worker = name, error = %err, "stale claim sweep failed"),
            }
        }
    }

    info!(worker = name, "dispatch worker stopped");
}
