//! The delay queue scheduling record.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::ItemId;

/// Partition shared by every item.
///
/// Only needed by stores that require a non-empty hash component for a
/// global ordered range scan. Relational stores may ignore it.
pub const DEFAULT_PARTITION: i32 = 0;

/// Claim marker value of an item nobody has claimed yet.
pub const UNCLAIMED: i64 = 0;

/// Claim marker value after the single successful claim.
pub const CLAIMED: i64 = 1;

/// A one-shot job scheduled for dispatch at or after `scheduled_at`.
///
/// ## Immutability
///
/// `id` and `scheduled_at` are fixed at creation and have no setters.
/// `claim_marker` is only ever changed by the store's conditional increment,
/// which also stamps `claimed_at`. The copy held here is a snapshot of both
/// at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayQueueItem {
    id: ItemId,
    /// Unix seconds.
    scheduled_at: i64,
    #[serde(rename = "type")]
    job_type: String,
    payload: JsonValue,
    claim_marker: i64,
    partition_key: i32,
    /// Unix seconds of the successful claim, `None` while unclaimed.
    #[serde(default)]
    claimed_at: Option<i64>,
}

impl DelayQueueItem {
    /// Build a new unclaimed item with a fresh id.
    ///
    /// `scheduled_at = None` schedules the item for "now".
    pub fn create(
        job_type: impl Into<String>,
        scheduled_at: Option<i64>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: ItemId::new(),
            scheduled_at: scheduled_at.unwrap_or_else(now_unix),
            job_type: job_type.into(),
            payload,
            claim_marker: UNCLAIMED,
            partition_key: DEFAULT_PARTITION,
            claimed_at: None,
        }
    }

    /// Build a new item due `delay` from now (rounded down to whole seconds).
    pub fn delayed(job_type: impl Into<String>, delay: Duration, payload: JsonValue) -> Self {
        let secs = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
        Self::create(job_type, Some(now_unix().saturating_add(secs)), payload)
    }

    /// Convenience constructor from a typed payload.
    pub fn from_typed<T>(
        job_type: impl Into<String>,
        scheduled_at: Option<i64>,
        payload: &T,
    ) -> DomainResult<Self>
    where
        T: Serialize,
    {
        let payload = serde_json::to_value(payload)
            .map_err(|e| DomainError::validation(format!("payload serialization failed: {e}")))?;
        Ok(Self::create(job_type, scheduled_at, payload))
    }

    /// Rebuild an item from its stored representation (store adapters only).
    pub fn from_parts(
        id: ItemId,
        scheduled_at: i64,
        job_type: String,
        payload: JsonValue,
        claim_marker: i64,
        partition_key: i32,
    ) -> Self {
        Self {
            id,
            scheduled_at,
            job_type,
            payload,
            claim_marker,
            partition_key,
            claimed_at: None,
        }
    }

    /// Attach the stored claim time (store adapters only).
    pub fn with_claimed_at(mut self, claimed_at: Option<i64>) -> Self {
        self.claimed_at = claimed_at;
        self
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn scheduled_at(&self) -> i64 {
        self.scheduled_at
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn claim_marker(&self) -> i64 {
        self.claim_marker
    }

    pub fn partition_key(&self) -> i32 {
        self.partition_key
    }

    pub fn claimed_at(&self) -> Option<i64> {
        self.claimed_at
    }

    pub fn is_claimed(&self) -> bool {
        self.claim_marker != UNCLAIMED
    }

    /// Eligible for dispatch at `now` (strictly after the scheduled second).
    pub fn is_ready_at(&self, now: i64) -> bool {
        !self.is_claimed() && self.scheduled_at < now
    }
}

/// Current wall-clock time in unix seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}
