//! In-memory work queue for tests/dev.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, mpsc};

use async_trait::async_trait;

use crate::envelope::JobEnvelope;
use crate::work_queue::{Subscription, WorkQueue};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryQueueError {
    /// Push failed due to internal lock poisoning.
    #[error("work queue lock poisoned")]
    Poisoned,
}

/// In-memory fan-out queue.
///
/// - No IO
/// - Every subscriber receives every pushed envelope
/// - Envelopes pushed with no subscriber are counted and dropped
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    subscribers: Mutex<Vec<mpsc::Sender<JobEnvelope>>>,
    pushed: AtomicU64,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<JobEnvelope> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }

    /// Total envelopes accepted since creation.
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    type Error = InMemoryQueueError;

    async fn push(&self, envelope: JobEnvelope) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryQueueError::Poisoned)?;

        // Drop any dead subscribers while pushing.
        subs.retain(|tx| tx.send(envelope.clone()).is_ok());
        self.pushed.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn every_subscriber_receives_pushes() {
        let queue = InMemoryWorkQueue::new();
        let a = queue.subscribe();
        let b = queue.subscribe();

        queue
            .push(JobEnvelope::immediate("test", serde_json::json!({"n": 1})))
            .await
            .unwrap();

        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
        assert_eq!(queue.pushed_count(), 1);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        drop(queue.subscribe());

        queue
            .push(JobEnvelope::immediate("test", serde_json::json!({})))
            .await
            .unwrap();

        assert!(queue.subscribers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscription_yields_in_push_order() {
        let queue = InMemoryWorkQueue::new();
        let sub = queue.subscribe();
        assert!(sub.try_recv().is_none());

        for job_type in ["first", "second", "third"] {
            queue
                .push(JobEnvelope::immediate(job_type, serde_json::json!({})))
                .await
                .unwrap();
        }

        assert_eq!(sub.try_recv().unwrap().job_type(), "first");
        let rest: Vec<String> = sub.drain().iter().map(|j| j.job_type().to_string()).collect();
        assert_eq!(rest, vec!["second", "third"]);
        assert!(sub.try_recv().is_none());
    }
}
