use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use deferq_core::{DelayQueueItem, ItemId, now_unix};
use deferq_queue::{JobEnvelope, WorkQueue};

use super::{DelayQueue, DelayQueueError, until_cancelled};
use crate::store::ItemStore;

/// Per-item failure recorded during a dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item_id: ItemId,
    pub reason: String,
}

/// Outcome of one `run_once` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Claimed and pushed.
    pub dispatched: Vec<ItemId>,
    /// Claimed by another dispatcher first.
    pub contended: Vec<ItemId>,
    /// Claim attempt failed (throttled or store error); not pushed.
    pub claim_errors: Vec<ItemFailure>,
    /// Claim won, push rejected. These items stay claimed.
    pub push_failures: Vec<ItemFailure>,
}

impl DispatchReport {
    pub fn examined(&self) -> usize {
        self.dispatched.len() + self.contended.len() + self.claim_errors.len() + self.push_failures.len()
    }

    /// No claim errors and no push failures.
    pub fn is_clean(&self) -> bool {
        self.claim_errors.is_empty() && self.push_failures.is_empty()
    }
}

impl<S, Q> DelayQueue<S, Q>
where
    S: ItemStore,
    Q: WorkQueue,
{
    /// Ready items (due and unclaimed), oldest first, at most `limit`.
    ///
    /// Nothing is claimed here; every returned item may still be lost to
    /// another dispatcher.
    #[instrument(skip(self, cancel), fields(ready = tracing::field::Empty), err)]
    pub async fn pop_ready(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<DelayQueueItem>, DelayQueueError> {
        let now = now_unix();
        let query = self.store.query_ready(self.config.partition, now, limit);
        let items = until_cancelled(cancel, query).await??;

        tracing::Span::current().record("ready", items.len());
        Ok(items)
    }

    /// Claim `item` and, on a win, push its job.
    ///
    /// Returns `Ok(false)` when the claim was lost. A push failure after a
    /// won claim is `DelayQueueError::Push`; the claim stays in place.
    #[instrument(skip(self, item, cancel), fields(item_id = %item.id(), job_type = item.job_type()), err)]
    pub async fn dispatch(
        &self,
        item: &DelayQueueItem,
        cancel: &CancellationToken,
    ) -> Result<bool, DelayQueueError> {
        if !self.check_lock(item, cancel).await? {
            tracing::debug!("claim lost to another dispatcher");
            return Ok(false);
        }

        let envelope = JobEnvelope::from_item(item);
        match until_cancelled(cancel, self.queue.push(envelope)).await? {
            Ok(()) => Ok(true),
            Err(err) => Err(DelayQueueError::Push {
                item_id: item.id().clone(),
                reason: format!("{err:?}"),
            }),
        }
    }

    /// One dispatch pass over at most `batch_limit` ready items.
    ///
    /// Fails only if the ready query fails or `cancel` fires; every per-item
    /// outcome lands in the report.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<DispatchReport, DelayQueueError> {
        let items = self.pop_ready(self.config.batch_limit, cancel).await?;
        let mut report = DispatchReport::default();

        for item in &items {
            if cancel.is_cancelled() {
                return Err(DelayQueueError::Cancelled);
            }

            match self.dispatch(item, cancel).await {
                Ok(true) => report.dispatched.push(item.id().clone()),
                Ok(false) => report.contended.push(item.id().clone()),
                Err(DelayQueueError::Cancelled) => return Err(DelayQueueError::Cancelled),
                Err(DelayQueueError::Push { item_id, reason }) => {
                    tracing::error!(item_id = %item_id, reason = %reason, "claimed item not pushed");
                    report.push_failures.push(ItemFailure { item_id, reason });
                }
                Err(err) => {
                    tracing::warn!(item_id = %item.id(), error = %err, "claim failed");
                    report.claim_errors.push(ItemFailure {
                        item_id: item.id().clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Push a job straight to the work queue, bypassing the store.
    #[instrument(skip(self, job_type, payload, cancel), fields(job_type = tracing::field::Empty), err)]
    pub async fn enqueue_immediate(
        &self,
        job_type: impl Into<String>,
        payload: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<(), DelayQueueError> {
        let envelope = JobEnvelope::immediate(job_type, payload);
        let job_type = envelope.job_type().to_string();
        tracing::Span::current().record("job_type", job_type.as_str());

        until_cancelled(cancel, self.queue.push(envelope))
            .await?
            .map_err(|err| DelayQueueError::Enqueue {
                job_type,
                reason: format!("{err:?}"),
            })
    }
}
