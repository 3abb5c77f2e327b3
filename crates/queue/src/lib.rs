//! Downstream work queue mechanics.
//!
//! The delay queue hands claimed items to a push-only work queue as
//! [`JobEnvelope`]s. This crate holds the envelope, the [`WorkQueue`]
//! contract and an in-memory implementation; infrastructure-backed queues
//! (e.g. Redis Streams) live in `deferq-infra`.

pub mod envelope;
pub mod in_memory;
pub mod work_queue;

pub use envelope::JobEnvelope;
pub use in_memory::{InMemoryQueueError, InMemoryWorkQueue};
pub use work_queue::{Subscription, WorkQueue};
