use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use deferq_infra::work_queue::RedisStreamsWorkQueue;
use deferq_infra::{
    AckWorker, DelayQueue, DispatchWorker, InMemoryItemStore, ItemStore, PostgresItemStore,
    TaskmasterConfig,
};
use deferq_queue::{InMemoryWorkQueue, JobEnvelope, WorkQueue};

const DISPATCH_WORKER: &str = "delay-queue.dispatch";
const DEV_CONSUMER: &str = "delay-queue.dev-consumer";

/// Run the taskmaster until `cancel` fires.
pub async fn run(config: TaskmasterConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    if config.use_persistent_stores {
        run_persistent(config, cancel).await
    } else {
        run_in_memory(config, cancel).await
    }
}

/// In-memory store and queue, plus a consumer that logs and acknowledges jobs.
async fn run_in_memory(config: TaskmasterConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    tracing::warn!("USE_PERSISTENT_STORES not set; using in-memory store and queue");

    let queue = Arc::new(InMemoryWorkQueue::new());
    let sub = queue.subscribe();
    let delay_queue = Arc::new(DelayQueue::new(
        Arc::new(InMemoryItemStore::new()),
        queue,
        config.delay_queue.clone(),
    ));
    prepare(&*delay_queue).await?;

    let consumer = AckWorker::spawn(
        DEV_CONSUMER,
        delay_queue.clone(),
        sub,
        Duration::from_millis(250),
        log_job,
        cancel.clone(),
    );

    drive(delay_queue, &config, cancel).await;
    consumer.shutdown().await;
    Ok(())
}

/// Postgres item store, Redis Streams work queue.
async fn run_persistent(config: TaskmasterConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let store = PostgresItemStore::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    let queue = RedisStreamsWorkQueue::new(&config.redis_url, Some(config.stream_key.clone()))
        .context("failed to create Redis Streams work queue")?;

    let delay_queue = Arc::new(DelayQueue::new(store, queue, config.delay_queue.clone()));
    prepare(&*delay_queue).await?;

    if config.claimed_rows_unbounded() {
        tracing::warn!(
            "DELAY_QUEUE_STALE_CLAIM_SECS not set; claimed items stay in delay_queue_items \
             until the consumer acknowledges them"
        );
    }

    drive(delay_queue, &config, cancel).await;
    Ok(())
}

async fn prepare<S, Q>(delay_queue: &DelayQueue<S, Q>) -> anyhow::Result<()>
where
    S: ItemStore,
    Q: WorkQueue,
{
    delay_queue
        .ensure_schema()
        .await
        .context("failed to prepare delay queue storage")
}

/// Spawn the dispatch worker and keep it running until cancellation.
async fn drive<S, Q>(delay_queue: Arc<DelayQueue<S, Q>>, config: &TaskmasterConfig, cancel: CancellationToken)
where
    S: ItemStore + 'static,
    Q: WorkQueue + 'static,
{
    let dispatcher = DispatchWorker::spawn(DISPATCH_WORKER, delay_queue, config.schedule.clone(), cancel.clone());

    tracing::info!(
        batch_limit = config.delay_queue.batch_limit,
        interval_secs = config.schedule.interval.as_secs(),
        sweep = config.schedule.stale_claim_after.is_some(),
        "taskmaster running"
    );

    cancel.cancelled().await;
    tracing::info!("shutting down");
    dispatcher.shutdown().await;
}

fn log_job(job: &JobEnvelope) -> Result<(), Infallible> {
    tracing::info!(
        job_type = job.job_type(),
        origin_id = job.origin_id().map(|id| id.as_str()).unwrap_or(""),
        "job received"
    );
    Ok(())
}
