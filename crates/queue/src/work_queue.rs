//! Work queue abstraction (push side only).
//!
//! The delay queue is a producer: once an item is claimed, its job is pushed
//! and the delay queue forgets about delivery. Consumption, acknowledgement
//! and redelivery are the queue implementation's business.
//!
//! ## Delivery Guarantees
//!
//! `push()` is **not** coordinated with the item store. A push that fails
//! after a won claim leaves the item claimed but undelivered; the caller is
//! told, nothing is rolled back.

use std::sync::Arc;
use std::sync::mpsc::Receiver;

use async_trait::async_trait;

use crate::envelope::JobEnvelope;

/// Push-only downstream work queue.
///
/// The trait requires `Send + Sync`: several dispatch tasks may push
/// concurrently.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    async fn push(&self, envelope: JobEnvelope) -> Result<(), Self::Error>;
}

#[async_trait]
impl<Q> WorkQueue for Arc<Q>
where
    Q: WorkQueue + ?Sized,
{
    type Error = Q::Error;

    async fn push(&self, envelope: JobEnvelope) -> Result<(), Self::Error> {
        (**self).push(envelope).await
    }
}

/// Receiving end of an in-process queue.
///
/// Never blocks; consumers poll it from their own loop:
///
/// ```ignore
/// let sub = queue.subscribe();
/// for job in sub.drain() {
///     handle(&job)?;
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Next buffered message, if any.
    pub fn try_recv(&self) -> Option<M> {
        self.receiver.try_recv().ok()
    }

    /// Take everything currently buffered, in push order.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}
