use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use deferq_core::{DelayQueueItem, ItemId};

/// Message pushed to the work queue.
///
/// Carries the job type and payload unmodified, plus provenance when the job
/// came out of the delay queue:
/// - `origin_id`: the `DelayQueueItem` that was claimed for this job
/// - `origin_scheduled_at`: that item's scheduled time (unix seconds)
///
/// Jobs enqueued directly (without a delay) carry no origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "type")]
    job_type: String,
    payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_scheduled_at: Option<i64>,
}

impl JobEnvelope {
    /// Envelope for a claimed delay queue item.
    pub fn from_item(item: &DelayQueueItem) -> Self {
        Self {
            job_type: item.job_type().to_string(),
            payload: item.payload().clone(),
            origin_id: Some(item.id().clone()),
            origin_scheduled_at: Some(item.scheduled_at()),
        }
    }

    /// Envelope for a job pushed straight to the work queue.
    pub fn immediate(job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            origin_id: None,
            origin_scheduled_at: None,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn origin_id(&self) -> Option<&ItemId> {
        self.origin_id.as_ref()
    }

    pub fn origin_scheduled_at(&self) -> Option<i64> {
        self.origin_scheduled_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_item_copies_provenance() {
        let item = DelayQueueItem::create("email", Some(1_700_000_000), serde_json::json!({"to": "a"}));
        let env = JobEnvelope::from_item(&item);

        assert_eq!(env.job_type(), "email");
        assert_eq!(env.payload(), item.payload());
        assert_eq!(env.origin_id(), Some(item.id()));
        assert_eq!(env.origin_scheduled_at(), Some(1_700_000_000));
    }

    #[test]
    fn immediate_envelope_omits_origin_on_the_wire() {
        let env = JobEnvelope::immediate("dynamo_throttle_retry", serde_json::json!({}));
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(json["type"], "dynamo_throttle_retry");
        assert!(json.get("origin_id").is_none());

        let back: JobEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }
}
