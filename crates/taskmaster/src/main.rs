use anyhow::Context;
use tokio_util::sync::CancellationToken;

use deferq_infra::TaskmasterConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deferq_observability::init();

    let config = TaskmasterConfig::from_env().context("invalid taskmaster configuration")?;

    let cancel = CancellationToken::new();
    tokio::spawn(deferq_taskmaster::signal::cancel_on_shutdown_signal(cancel.clone()));

    deferq_taskmaster::app::run(config, cancel).await
}
