use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use deferq_core::{DelayQueueItem, ItemId};

/// Item store operation error.
///
/// ## Error Categories
///
/// - **Throttled**: transient store-side rejection under load. The write
///   paths of the delay queue retry these with backoff; reads and claims
///   surface them to the caller.
/// - **Backend**: any other store failure (connection, SQL, IO). Never retried.
/// - **InvalidRecord**: a stored row could not be turned back into an item.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store throttled during {operation}")]
    Throttled { operation: &'static str },

    #[error("store error during {operation}: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}

impl StoreError {
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, StoreError::Throttled { .. })
    }
}

/// Numeric item fields that support a conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterField {
    ClaimMarker,
}

impl CounterField {
    /// Column/attribute name used by store adapters.
    pub fn column(&self) -> &'static str {
        match self {
            CounterField::ClaimMarker => "claim_marker",
        }
    }

    /// Timestamp column written in the same conditional update.
    ///
    /// Set to the store's current unix time when the new value is non-zero,
    /// cleared otherwise.
    pub fn stamp_column(&self) -> &'static str {
        match self {
            CounterField::ClaimMarker => "claimed_at",
        }
    }
}

/// Durable keyed storage for delay queue items.
///
/// Implementations are external collaborators exposing a narrow contract:
///
/// - point `put` / `get` / `delete` by primary key (`ItemId`)
/// - an ordered range query over `(partition, claim_marker, scheduled_at)`
/// - an atomic conditional increment on a single numeric field
/// - idempotent schema bootstrap
///
/// ## Implementation Requirements
///
/// - `put` of an id that already exists must leave the stored record as is
///   (a put retried after an unseen success must not reset a claim)
/// - `get` returns `Ok(None)` for absent ids; only real failures are errors
/// - `delete` returns whether a record was removed; absent ids are not errors
/// - `query_ready` returns unclaimed items with `scheduled_at < before`,
///   ascending by `scheduled_at`, at most `limit`
/// - `conditional_increment` is atomic: among racing callers with the same
///   `expected` value at most one observes `Ok(true)`
/// - transient overload is reported as `StoreError::Throttled`
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn put(&self, item: &DelayQueueItem) -> Result<(), StoreError>;

    async fn get(&self, id: &ItemId) -> Result<Option<DelayQueueItem>, StoreError>;

    async fn delete(&self, id: &ItemId) -> Result<bool, StoreError>;

    async fn query_ready(
        &self,
        partition: i32,
        before: i64,
        limit: usize,
    ) -> Result<Vec<DelayQueueItem>, StoreError>;

    /// Claimed items with `claimed_at < before`, oldest claim first, at most
    /// `limit`. Claimed records without a stamp are never returned.
    async fn query_claimed(
        &self,
        partition: i32,
        before: i64,
        limit: usize,
    ) -> Result<Vec<DelayQueueItem>, StoreError>;

    /// Set `field` to `new` only if it currently equals `expected`, stamping
    /// `field.stamp_column()` in the same write.
    ///
    /// Returns `Ok(false)` when the current value differs or the id is absent.
    async fn conditional_increment(
        &self,
        id: &ItemId,
        field: CounterField,
        expected: i64,
        new: i64,
    ) -> Result<bool, StoreError>;

    /// Create the backing table/index if missing. Safe on every start.
    async fn ensure_schema(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> ItemStore for Arc<S>
where
    S: ItemStore + ?Sized,
{
    async fn put(&self, item: &DelayQueueItem) -> Result<(), StoreError> {
        (**self).put(item).await
    }

    async fn get(&self, id: &ItemId) -> Result<Option<DelayQueueItem>, StoreError> {
        (**self).get(id).await
    }

    async fn delete(&self, id: &ItemId) -> Result<bool, StoreError> {
        (**self).delete(id).await
    }

    async fn query_ready(
        &self,
        partition: i32,
        before: i64,
        limit: usize,
    ) -> Result<Vec<DelayQueueItem>, StoreError> {
        (**self).query_ready(partition, before, limit).await
    }

    async fn query_claimed(
        &self,
        partition: i32,
        before: i64,
        limit: usize,
    ) -> Result<Vec<DelayQueueItem>, StoreError> {
        (**self).query_claimed(partition, before, limit).await
    }

    async fn conditional_increment(
        &self,
        id: &ItemId,
        field: CounterField,
        expected: i64,
        new: i64,
    ) -> Result<bool, StoreError> {
        (**self).conditional_increment(id, field, expected, new).await
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        (**self).ensure_schema().await
    }
}
