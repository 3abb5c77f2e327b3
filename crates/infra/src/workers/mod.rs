//! Background tasks driving a `DelayQueue`.

pub mod ack_worker;
pub mod dispatch_worker;

pub use ack_worker::AckWorker;
pub use dispatch_worker::DispatchWorker;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(cancel: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            cancel,
            join: Some(join),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                tracing::warn!(error = %err, "worker task ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }
}
