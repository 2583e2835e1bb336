//! Long-running process that keeps the job broker in step with the
//! system-data status table.

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use esprr_infra::queue::RedisQueue;
use esprr_infra::storage::MySqlComputeManagement;
use esprr_infra::{Reconciler, SyncConfig, SyncLoop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    esprr_observability::init();

    let config = SyncConfig::from_env().context("invalid sync configuration")?;
    tracing::info!(
        queue = %config.queue_name,
        period = ?config.sync_period,
        mysql = ?config.mysql,
        redis = ?config.redis,
        "starting esprr sync"
    );

    let store = MySqlComputeManagement::connect(config.mysql.connect_options())
        .await
        .context("failed to connect to MySQL")?;
    let queue = RedisQueue::connect(config.redis.connection_url(), config.queue_name.clone())
        .await
        .context("failed to connect to Redis")?;
    queue.ping().await.context("Redis did not answer PING")?;

    let reconciler = Reconciler::new(queue, store).with_job_options(config.job_options);
    let mut sync =
        SyncLoop::new(reconciler, config.sync_period).with_error_policy(config.error_policy);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let summary = sync.run(cancel).await.context("sync loop aborted")?;
    tracing::info!(cycles = summary.cycles, failed = summary.failed_cycles, "esprr sync exited");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM. The running cycle finishes first.
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = terminate => tracing::info!("received SIGTERM"),
        _ = interrupt => tracing::info!("received SIGINT"),
    }
    token.cancel();
}
