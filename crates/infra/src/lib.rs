//! Infrastructure layer: item stores, backoff, dispatch, workers, Redis, config.

pub mod backoff;
pub mod config;
pub mod delay_queue;
pub mod store;
pub mod work_queue;
pub mod workers;

pub use backoff::{BackoffPolicy, WriteError, write_with_backoff};
pub use config::{ConfigError, DelayQueueConfig, TaskmasterConfig, WorkerSchedule};
pub use delay_queue::{DelayQueue, DelayQueueError, DispatchReport, ItemFailure};
pub use store::{CounterField, InMemoryItemStore, ItemStore, PostgresItemStore, StoreError};
pub use workers::{AckWorker, DispatchWorker, WorkerHandle};
