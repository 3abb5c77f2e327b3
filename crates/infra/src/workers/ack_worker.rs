use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use deferq_queue::{JobEnvelope, Subscription, WorkQueue};

use super::WorkerHandle;
use crate::delay_queue::{DelayQueue, DelayQueueError};
use crate::store::ItemStore;

/// In-process consumer for an in-memory work queue subscription.
///
/// - Drains the subscription every `poll` interval
/// - Runs `handler` for each job
/// - Acknowledges the job (deletes its origin item) only when the handler succeeded
/// - A failed job keeps its claimed item, which the stale-claim sweep removes later
#[derive(Debug)]
pub struct AckWorker;

impl AckWorker {
    pub fn spawn<S, Q, H, E>(
        name: &'static str,
        delay_queue: Arc<DelayQueue<S, Q>>,
        sub: Subscription<JobEnvelope>,
        poll: Duration,
        handler: H,
        cancel: CancellationToken,
    ) -> WorkerHandle
    where
        S: ItemStore + 'static,
        Q: WorkQueue + 'static,
        H: FnMut(&JobEnvelope) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let token = cancel.child_token();
        let join = tokio::spawn(worker_loop(name, delay_queue, sub, poll, handler, token.clone()));
        WorkerHandle::new(token, join)
    }
}

async fn worker_loop<S, Q, H, E>(
    name: &'static str,
    delay_queue: Arc<DelayQueue<S, Q>>,
    sub: Subscription<JobEnvelope>,
    poll: Duration,
    mut handler: H,
    cancel: CancellationToken,
) where
    S: ItemStore,
    Q: WorkQueue,
    H: FnMut(&JobEnvelope) -> Result<(), E>,
    E: core::fmt::Debug,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }

        for job in sub.drain() {
            if let Err(err) = handler(&job) {
                warn!(worker = name, job_type = job.job_type(), error = ?err, "job handler failed");
                continue;
            }

            match delay_queue.acknowledge(&job, &cancel).await {
                Ok(removed) => debug!(worker = name, job_type = job.job_type(), removed, "job acknowledged"),
                Err(DelayQueueError::Cancelled) => return,
                Err(err) => warn!(worker = name, error = %err, "acknowledge failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use deferq_core::now_unix;

    use crate::delay_queue::test_support::test_queue;

    #[tokio::test]
    async fn handled_jobs_are_acknowledged() {
        let (dq, store, queue) = test_queue();
        let sub = queue.subscribe();
        let cancel = CancellationToken::new();
        dq.schedule("email", Some(now_unix() - 1), serde_json::json!({}), &cancel)
            .await
            .unwrap();
        dq.run_once(&cancel).await.unwrap();

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handle = AckWorker::spawn(
            "ack-test",
            Arc::new(dq),
            sub,
            Duration::from_millis(10),
            move |_job: &JobEnvelope| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            },
            cancel,
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failed_jobs_keep_their_item() {
        let (dq, store, queue) = test_queue();
        let sub = queue.subscribe();
        let cancel = CancellationToken::new();
        dq.schedule("email", Some(now_unix() - 1), serde_json::json!({}), &cancel)
            .await
            .unwrap();
        dq.run_once(&cancel).await.unwrap();

        let handle = AckWorker::spawn(
            "ack-test",
            Arc::new(dq),
            sub,
            Duration::from_millis(10),
            |_job: &JobEnvelope| Err::<(), _>("handler exploded"),
            cancel,
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(store.len(), 1);
    }
}
