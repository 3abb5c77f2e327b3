use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;

use deferq_core::{DelayQueueItem, ItemId, UNCLAIMED, now_unix};

use super::r#trait::{CounterField, ItemStore, StoreError};

/// Sentinel for "throttle every put from now on".
const THROTTLE_FOREVER: u64 = u64::MAX;

/// In-memory item store.
///
/// Intended for tests/dev. The ready query is a full scan.
///
/// Throttling can be injected to exercise the retry and claim error paths:
/// - `throttle_next_puts(n)` rejects the next `n` puts
/// - `throttle_all_puts()` rejects every put
/// - `set_claims_throttled(true)` rejects every conditional increment
///
/// `backdate_claim` rewrites a claim stamp so claim ages can be simulated.
#[derive(Debug, Default)]
pub struct InMemoryItemStore {
    items: RwLock<HashMap<ItemId, DelayQueueItem>>,
    throttled_puts: AtomicU64,
    claims_throttled: AtomicBool,
    put_attempts: AtomicU64,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttle_next_puts(&self, n: u64) {
        self.throttled_puts.store(n, Ordering::SeqCst);
    }

    pub fn throttle_all_puts(&self) {
        self.throttled_puts.store(THROTTLE_FOREVER, Ordering::SeqCst);
    }

    pub fn set_claims_throttled(&self, throttled: bool) {
        self.claims_throttled.store(throttled, Ordering::SeqCst);
    }

    /// Number of `put` calls received, throttled ones included.
    pub fn put_attempts(&self) -> u64 {
        self.put_attempts.load(Ordering::SeqCst)
    }

    /// Overwrite the `claimed_at` stamp of a claimed item.
    ///
    /// Returns `false` when the id is absent or unclaimed.
    pub fn backdate_claim(&self, id: &ItemId, claimed_at: i64) -> bool {
        let Ok(mut items) = self.items.write() else {
            return false;
        };
        match items.get_mut(id) {
            Some(item) if item.is_claimed() => {
                *item = item.clone().with_claimed_at(Some(claimed_at));
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_put_throttle(&self) -> bool {
        self.throttled_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                THROTTLE_FOREVER => Some(THROTTLE_FOREVER),
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn scan(
        &self,
        operation: &'static str,
        partition: i32,
        before: i64,
        limit: usize,
        claimed: bool,
    ) -> Result<Vec<DelayQueueItem>, StoreError> {
        let items = self.items.read().map_err(|_| poisoned(operation))?;

        // Ready items order by schedule, claimed items by claim time.
        let order_key = |item: &DelayQueueItem| {
            if claimed {
                item.claimed_at()
            } else {
                Some(item.scheduled_at())
            }
        };

        let mut matching: Vec<DelayQueueItem> = items
            .values()
            .filter(|item| {
                item.partition_key() == partition
                    && item.is_claimed() == claimed
                    && order_key(*item).is_some_and(|at| at < before)
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            order_key(a)
                .cmp(&order_key(b))
                .then_with(|| a.id().as_str().cmp(b.id().as_str()))
        });
        matching.truncate(limit);

        Ok(matching)
    }
}

fn poisoned(operation: &'static str) -> StoreError {
    StoreError::backend(operation, "lock poisoned")
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn put(&self, item: &DelayQueueItem) -> Result<(), StoreError> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);

        if self.take_put_throttle() {
            return Err(StoreError::Throttled { operation: "put" });
        }

        let mut items = self.items.write().map_err(|_| poisoned("put"))?;
        items
            .entry(item.id().clone())
            .or_insert_with(|| item.clone());
        Ok(())
    }

    async fn get(&self, id: &ItemId) -> Result<Option<DelayQueueItem>, StoreError> {
        let items = self.items.read().map_err(|_| poisoned("get"))?;
        Ok(items.get(id).cloned())
    }

    async fn delete(&self, id: &ItemId) -> Result<bool, StoreError> {
        let mut items = self.items.write().map_err(|_| poisoned("delete"))?;
        Ok(items.remove(id).is_some())
    }

    async fn query_ready(
        &self,
        partition: i32,
        before: i64,
        limit: usize,
    ) -> Result<Vec<DelayQueueItem>, StoreError> {
        self.scan("query_ready", partition, before, limit, false)
    }

    async fn query_claimed(
        &self,
        partition: i32,
        before: i64,
        limit: usize,
    ) -> Result<Vec<DelayQueueItem>, StoreError> {
        self.scan("query_claimed", partition, before, limit, true)
    }

    async fn conditional_increment(
        &self,
        id: &ItemId,
        field: CounterField,
        expected: i64,
        new: i64,
    ) -> Result<bool, StoreError> {
        if self.claims_throttled.load(Ordering::SeqCst) {
            return Err(StoreError::Throttled {
                operation: "conditional_increment",
            });
        }

        // Compare and set under the write lock.
        let mut items = self
            .items
            .write()
            .map_err(|_| poisoned("conditional_increment"))?;

        let Some(current) = items.get_mut(id) else {
            return Ok(false);
        };

        let value = match field {
            CounterField::ClaimMarker => current.claim_marker(),
        };
        if value != expected {
            return Ok(false);
        }

        let stamp = (new != UNCLAIMED).then(now_unix);
        *current = DelayQueueItem::from_parts(
            current.id().clone(),
            current.scheduled_at(),
            current.job_type().to_string(),
            current.payload().clone(),
            new,
            current.partition_key(),
        )
        .with_claimed_at(stamp);
        Ok(true)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
