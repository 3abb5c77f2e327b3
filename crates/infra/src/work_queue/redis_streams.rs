//! Redis Streams-backed work queue (push side).
//!
//! Each job becomes one stream entry:
//!
//! ```text
//! XADD <stream_key> * job_type <type> origin_id <item id or ""> payload <envelope json>
//! ```
//!
//! Consumers read the stream through a consumer group (`XREADGROUP`) and
//! acknowledge entries themselves; `ensure_consumer_group` creates the group
//! and the stream if missing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::instrument;

use deferq_queue::{JobEnvelope, WorkQueue};

use crate::config::DEFAULT_STREAM_KEY;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone)]
pub struct RedisStreamsWorkQueue {
    client: Arc<redis::Client>,
    conn: Arc<OnceCell<redis::aio::MultiplexedConnection>>,
    stream_key: String,
}

impl RedisStreamsWorkQueue {
    /// Create a work queue on `stream_key` (default `deferq:jobs`).
    ///
    /// No connection is made until the first command.
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            conn: Arc::new(OnceCell::new()),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, RedisStreamsError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(|e| RedisStreamsError::Connection(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }

    /// Create `group_name` on the stream (and the stream itself) if missing.
    pub async fn ensure_consumer_group(&self, group_name: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection().await?;

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Number of entries currently in the stream.
    pub async fn len(&self) -> Result<u64, RedisStreamsError> {
        let mut conn = self.connection().await?;
        redis::cmd("XLEN")
            .arg(&self.stream_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XLEN failed: {e}")))
    }
}

/// Field/value pairs written for one job.
fn stream_fields(envelope: &JobEnvelope) -> Result<[(&'static str, String); 3], RedisStreamsError> {
    let payload = serde_json::to_string(envelope)
        .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
    let origin_id = envelope
        .origin_id()
        .map(|id| id.to_string())
        .unwrap_or_default();

    Ok([
        ("job_type", envelope.job_type().to_string()),
        ("origin_id", origin_id),
        ("payload", payload),
    ])
}

#[async_trait]
impl WorkQueue for RedisStreamsWorkQueue {
    type Error = RedisStreamsError;

    #[instrument(
        skip(self, envelope),
        fields(stream_key = %self.stream_key, job_type = envelope.job_type()),
        err
    )]
    async fn push(&self, envelope: JobEnvelope) -> Result<(), Self::Error> {
        let fields = stream_fields(&envelope)?;
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key).arg("*");
        for (field, value) in &fields {
            cmd.arg(*field).arg(value);
        }

        let _: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deferq_core::DelayQueueItem;

    #[test]
    fn fields_carry_type_origin_and_envelope() {
        let item = DelayQueueItem::create("email", Some(5), serde_json::json!({"to": "a"}));
        let envelope = JobEnvelope::from_item(&item);

        let fields = stream_fields(&envelope).unwrap();

        assert_eq!(fields[0], ("job_type", "email".to_string()));
        assert_eq!(fields[1], ("origin_id", item.id().to_string()));
        let decoded: JobEnvelope = serde_json::from_str(&fields[2].1).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn immediate_jobs_have_empty_origin() {
        let envelope = JobEnvelope::immediate("dynamo_throttle_retry", serde_json::json!({}));
        let fields = stream_fields(&envelope).unwrap();
        assert_eq!(fields[1], ("origin_id", String::new()));
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let err = RedisStreamsWorkQueue::new("not a url", None).unwrap_err();
        assert!(matches!(err, RedisStreamsError::Connection(_)));
    }

    #[test]
    fn default_stream_key() {
        let queue = RedisStreamsWorkQueue::new("redis://localhost:6379", None).unwrap();
        assert_eq!(queue.stream_key(), "deferq:jobs");
    }
}
