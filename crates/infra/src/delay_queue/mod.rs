//! Delayed job dispatch.
//!
//! `DelayQueue` owns the whole life of a delayed job on the producer side:
//!
//! 1. `save()` persists a `DelayQueueItem` (throttled puts retried with backoff)
//! 2. `run_once()` finds ready items, claims each one, and pushes the claimed
//!    ones to the work queue
//! 3. `acknowledge()` deletes the item once the consumer is done with it
//!
//! ## Claim Semantics
//!
//! The only coordination between dispatch processes is the per-item claim:
//! a conditional increment of the claim marker from 0 to 1. At most one
//! caller ever wins it, and a claimed item is never dispatched again.
//!
//! The push that follows a won claim is **not** atomic with it. A crash or
//! push failure in between leaves the item claimed and undelivered; the
//! stale-claim sweep is what eventually surfaces and removes such items.
//! Claim age is measured from the `claimed_at` stamp written with the claim.

mod dispatch;
mod sweep;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use deferq_core::{CLAIMED, DelayQueueItem, ItemId, UNCLAIMED};
use deferq_queue::WorkQueue;

use crate::backoff::{WriteError, write_with_backoff};
use crate::config::DelayQueueConfig;
use crate::store::{CounterField, ItemStore, StoreError};

pub use dispatch::{DispatchReport, ItemFailure};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DelayQueueError {
    /// Every put attempt was throttled. `item` is the JSON form of the record
    /// that was not saved.
    #[error("item {item_id} not saved: still throttled after {attempts} attempts ({item})")]
    RetriesExhausted {
        item_id: ItemId,
        attempts: u32,
        item: String,
    },

    #[error("claim on item {item_id} throttled")]
    ClaimThrottled { item_id: ItemId },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The claim was won but the work queue rejected the job.
    #[error("push of item {item_id} failed: {reason}")]
    Push { item_id: ItemId, reason: String },

    /// A job without a delay could not be handed to the work queue.
    #[error("enqueue of {job_type} job failed: {reason}")]
    Enqueue { job_type: String, reason: String },
}

/// Producer/dispatcher facade over an item store and a work queue.
#[derive(Debug)]
pub struct DelayQueue<S, Q> {
    store: S,
    queue: Q,
    config: DelayQueueConfig,
}

impl<S, Q> DelayQueue<S, Q> {
    pub fn new(store: S, queue: Q, config: DelayQueueConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn config(&self) -> &DelayQueueConfig {
        &self.config
    }
}

impl<S, Q> DelayQueue<S, Q>
where
    S: ItemStore,
    Q: WorkQueue,
{
    /// Persist `item`, retrying throttled puts with backoff.
    ///
    /// Saving an id that is already stored leaves the stored record as is.
    #[instrument(
        skip(self, item, cancel),
        fields(item_id = %item.id(), job_type = item.job_type(), scheduled_at = item.scheduled_at()),
        err
    )]
    pub async fn save(
        &self,
        item: &DelayQueueItem,
        cancel: &CancellationToken,
    ) -> Result<(), DelayQueueError> {
        let result = write_with_backoff(&self.config.backoff, cancel, || self.store.put(item)).await;

        match result {
            Ok(attempts) => {
                if attempts > 1 {
                    tracing::info!(attempts, "item saved after throttling");
                }
                Ok(())
            }
            Err(WriteError::Exhausted { attempts }) => {
                let rendered = serde_json::to_string(item).unwrap_or_else(|e| format!("<unrenderable: {e}>"));
                tracing::error!(attempts, item = %rendered, "giving up on throttled item save");
                Err(DelayQueueError::RetriesExhausted {
                    item_id: item.id().clone(),
                    attempts,
                    item: rendered,
                })
            }
            Err(WriteError::Cancelled) => Err(DelayQueueError::Cancelled),
            Err(WriteError::Failed(err)) => Err(DelayQueueError::Store(err)),
        }
    }

    /// Create and save a new item.
    pub async fn schedule(
        &self,
        job_type: impl Into<String>,
        scheduled_at: Option<i64>,
        payload: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<DelayQueueItem, DelayQueueError> {
        let item = DelayQueueItem::create(job_type, scheduled_at, payload);
        self.save(&item, cancel).await?;
        Ok(item)
    }

    /// Remove an item. Returns `false` when it was already gone.
    #[instrument(skip(self, id, cancel), fields(item_id = %id), err)]
    pub async fn delete(
        &self,
        id: &ItemId,
        cancel: &CancellationToken,
    ) -> Result<bool, DelayQueueError> {
        let removed = until_cancelled(cancel, self.store.delete(id)).await??;
        if !removed {
            tracing::debug!("delete of absent item");
        }
        Ok(removed)
    }

    pub async fn get(
        &self,
        id: &ItemId,
        cancel: &CancellationToken,
    ) -> Result<Option<DelayQueueItem>, DelayQueueError> {
        Ok(until_cancelled(cancel, self.store.get(id)).await??)
    }

    /// Try to claim `item`. `Ok(true)` for exactly one caller per item.
    ///
    /// Store throttling surfaces as `ClaimThrottled` and is never retried.
    #[instrument(skip(self, item, cancel), fields(item_id = %item.id()), err)]
    pub async fn check_lock(
        &self,
        item: &DelayQueueItem,
        cancel: &CancellationToken,
    ) -> Result<bool, DelayQueueError> {
        let claim = self
            .store
            .conditional_increment(item.id(), CounterField::ClaimMarker, UNCLAIMED, CLAIMED);

        match until_cancelled(cancel, claim).await? {
            Ok(won) => Ok(won),
            Err(err) if err.is_throttled() => Err(DelayQueueError::ClaimThrottled {
                item_id: item.id().clone(),
            }),
            Err(err) => Err(DelayQueueError::Store(err)),
        }
    }

    /// Create the store's table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), DelayQueueError> {
        Ok(self.store.ensure_schema().await?)
    }
}

/// Race `fut` against `cancel`.
pub(crate) async fn until_cancelled<F, T>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, DelayQueueError>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DelayQueueError::Cancelled),
        out = fut => Ok(out),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn save_and_get_roundtrip() {
        let (dq, _, _) = test_queue();
        let cancel = CancellationToken::new();

        let item = dq
            .schedule("email", Some(1_000), serde_json::json!({"to": "x"}), &cancel)
            .await
            .unwrap();

        let loaded = dq.get(item.id(), &cancel).await.unwrap().unwrap();
        assert_eq!(loaded, item);
        assert_eq!(dq.get(&ItemId::new(), &cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_survives_transient_throttling() {
        let (dq, store, _) = test_queue();
        let cancel = CancellationToken::new();
        store.throttle_next_puts(3);

        let item = DelayQueueItem::create("email", Some(1), serde_json::json!({}));
        dq.save(&item, &cancel).await.unwrap();

        assert_eq!(store.put_attempts(), 4);
        assert!(dq.get(item.id(), &cancel).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_gives_up_after_five_throttled_puts() {
        let (dq, store, _) = test_queue();
        let cancel = CancellationToken::new();
        store.throttle_all_puts();

        let item = DelayQueueItem::create("email", Some(1), serde_json::json!({"k": 1}));
        let err = dq.save(&item, &cancel).await.unwrap_err();

        match err {
            DelayQueueError::RetriesExhausted {
                item_id,
                attempts,
                item: rendered,
            } => {
                assert_eq!(&item_id, item.id());
                assert_eq!(attempts, 5);
                assert!(rendered.contains(item.id().as_str()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.put_attempts(), 5);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cancelled_save_returns_promptly() {
        let store = Arc::new(crate::store::InMemoryItemStore::new());
        let queue = Arc::new(deferq_queue::InMemoryWorkQueue::new());
        let config = DelayQueueConfig {
            backoff: crate::backoff::BackoffPolicy::exponential(
                5,
                std::time::Duration::from_secs(30),
                std::time::Duration::from_secs(30),
            ),
            ..DelayQueueConfig::default()
        };
        let dq = DelayQueue::new(store.clone(), queue, config);
        store.throttle_all_puts();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let item = DelayQueueItem::create("email", Some(1), serde_json::json!({}));
        let err = dq.save(&item, &cancel).await.unwrap_err();

        assert_eq!(err, DelayQueueError::Cancelled);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(store.put_attempts(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (dq, _, _) = test_queue();
        let cancel = CancellationToken::new();
        let item = dq
            .schedule("email", Some(deferq_core::now_unix() - 5), serde_json::json!({}), &cancel)
            .await
            .unwrap();
        let kept = dq
            .schedule("email", Some(deferq_core::now_unix() - 5), serde_json::json!({}), &cancel)
            .await
            .unwrap();
        assert_eq!(dq.pop_ready(10, &cancel).await.unwrap().len(), 2);

        assert!(dq.delete(item.id(), &cancel).await.unwrap());
        assert!(!dq.delete(item.id(), &cancel).await.unwrap());
        assert_eq!(dq.get(item.id(), &cancel).await.unwrap(), None);

        let ready = dq.pop_ready(10, &cancel).await.unwrap();
        let ids: Vec<&ItemId> = ready.iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec![kept.id()]);
    }

    #[tokio::test]
    async fn claim_is_won_once() {
        let (dq, _, _) = test_queue();
        let cancel = CancellationToken::new();
        let item = dq
            .schedule("email", Some(1), serde_json::json!({}), &cancel)
            .await
            .unwrap();

        assert!(dq.check_lock(&item, &cancel).await.unwrap());
        assert!(!dq.check_lock(&item, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn claim_does_not_depend_on_readiness() {
        let (dq, _, _) = test_queue();
        let cancel = CancellationToken::new();
        let future = dq
            .schedule("email", Some(i64::MAX / 2), serde_json::json!({}), &cancel)
            .await
            .unwrap();

        assert!(dq.check_lock(&future, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn throttled_claim_is_an_error() {
        let (dq, store, _) = test_queue();
        let cancel = CancellationToken::new();
        let item = dq
            .schedule("email", Some(1), serde_json::json!({}), &cancel)
            .await
            .unwrap();
        store.set_claims_throttled(true);

        let err = dq.check_lock(&item, &cancel).await.unwrap_err();
        assert_eq!(err, DelayQueueError::ClaimThrottled { item_id: item.id().clone() });

        store.set_claims_throttled(false);
        assert!(dq.check_lock(&item, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn resaving_a_claimed_item_keeps_the_claim() {
        let (dq, _, _) = test_queue();
        let cancel = CancellationToken::new();
        let item = dq
            .schedule("email", Some(1), serde_json::json!({}), &cancel)
            .await
            .unwrap();
        assert!(dq.check_lock(&item, &cancel).await.unwrap());

        dq.save(&item, &cancel).await.unwrap();

        let stored = dq.get(item.id(), &cancel).await.unwrap().unwrap();
        assert_eq!(stored.claim_marker(), CLAIMED);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let (dq, _, _) = test_queue();
        let dq = Arc::new(dq);
        let cancel = CancellationToken::new();
        let item = dq
            .schedule("email", Some(1), serde_json::json!({}), &cancel)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let dq = dq.clone();
            let item = item.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { dq.check_lock(&item, &cancel).await.unwrap() }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
