use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use deferq_core::{DelayQueueItem, now_unix};
use deferq_queue::{JobEnvelope, WorkQueue};

use super::{DelayQueue, DelayQueueError, until_cancelled};
use crate::store::ItemStore;

impl<S, Q> DelayQueue<S, Q>
where
    S: ItemStore,
    Q: WorkQueue,
{
    /// Consumer side: the job is finished, drop its origin item.
    ///
    /// Envelopes without an origin (immediate jobs) return `false`.
    pub async fn acknowledge(
        &self,
        envelope: &JobEnvelope,
        cancel: &CancellationToken,
    ) -> Result<bool, DelayQueueError> {
        match envelope.origin_id() {
            Some(id) => self.delete(id, cancel).await,
            None => Ok(false),
        }
    }

    /// Forget items whose claim is more than `older_than` old.
    ///
    /// Age counts from the `claimed_at` stamp, so an overdue item that was
    /// claimed just now is not stale.
    ///
    /// Such items were claimed but never acknowledged, usually because the
    /// push failed or the consumer died. Each one is logged at `warn` and
    /// deleted. Nothing is re-dispatched.
    #[instrument(skip(self, cancel), fields(swept = tracing::field::Empty), err)]
    pub async fn sweep_stale_claims(
        &self,
        older_than: Duration,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<DelayQueueItem>, DelayQueueError> {
        let age = i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now_unix().saturating_sub(age);

        let query = self.store.query_claimed(self.config.partition, cutoff, limit);
        let stale = until_cancelled(cancel, query).await??;

        let mut swept = Vec::with_capacity(stale.len());
        for item in stale {
            tracing::warn!(
                item_id = %item.id(),
                job_type = item.job_type(),
                scheduled_at = item.scheduled_at(),
                claimed_at = item.claimed_at(),
                "dropping stale claimed item that was never acknowledged"
            );
            if self.delete(item.id(), cancel).await? {
                swept.push(item);
            }
        }

        tracing::Span::current().record("swept", swept.len());
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use deferq_queue::JobEnvelope;

    #[tokio::test]
    async fn acknowledge_deletes_origin_item() {
        let (dq, store, queue) = test_queue();
        let sub = queue.subscribe();
        let cancel = CancellationToken::new();
        let item = dq
            .schedule("email", Some(now_unix() - 1), serde_json::json!({}), &cancel)
            .await
            .unwrap();

        dq.run_once(&cancel).await.unwrap();
        let job = sub.drain().pop().unwrap();

        assert!(dq.acknowledge(&job, &cancel).await.unwrap());
        assert!(store.get(item.id()).await.unwrap().is_none());
        assert!(!dq.acknowledge(&job, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn acknowledging_an_immediate_job_is_a_no_op() {
        let (dq, store, _) = test_queue();
        let cancel = CancellationToken::new();
        dq.schedule("email", Some(1), serde_json::json!({}), &cancel).await.unwrap();

        let job = JobEnvelope::immediate("email", serde_json::json!({}));
        assert!(!dq.acknowledge(&job, &cancel).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_old_claims() {
        let (dq, store, _) = test_queue();
        let cancel = CancellationToken::new();
        let now = now_unix();

        let old_claim = dq.schedule("a", Some(now - 10), serde_json::json!({}), &cancel).await.unwrap();
        let recent_claim = dq.schedule("b", Some(now - 7_200), serde_json::json!({}), &cancel).await.unwrap();
        let unclaimed = dq.schedule("c", Some(now - 7_200), serde_json::json!({}), &cancel).await.unwrap();
        assert!(dq.check_lock(&old_claim, &cancel).await.unwrap());
        assert!(dq.check_lock(&recent_claim, &cancel).await.unwrap());
        assert!(store.backdate_claim(old_claim.id(), now - 7_200));

        let swept = dq
            .sweep_stale_claims(Duration::from_secs(3_600), 100, &cancel)
            .await
            .unwrap();

        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id(), old_claim.id());
        assert!(store.get(old_claim.id()).await.unwrap().is_none());
        assert!(store.get(recent_claim.id()).await.unwrap().is_some());
        assert!(store.get(unclaimed.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn overdue_item_claimed_just_now_is_not_stale() {
        let (dq, store, queue) = test_queue();
        let sub = queue.subscribe();
        let cancel = CancellationToken::new();
        let item = dq
            .schedule("email", Some(now_unix() - 7_200), serde_json::json!({}), &cancel)
            .await
            .unwrap();

        let report = dq.run_once(&cancel).await.unwrap();
        assert_eq!(report.dispatched, vec![item.id().clone()]);

        let swept = dq
            .sweep_stale_claims(Duration::from_secs(3_600), 100, &cancel)
            .await
            .unwrap();
        assert!(swept.is_empty());
        assert!(store.get(item.id()).await.unwrap().is_some());

        let job = sub.drain().pop().unwrap();
        assert!(dq.acknowledge(&job, &cancel).await.unwrap());
    }
}
