//! The core's single long-running process: the Listener, Email Worker, and
//! Webhook Dispatcher all share one connection pool and run as sibling
//! tasks until shutdown.

use std::sync::Arc;
use std::time::Duration;

use sendlane::smtp::RelayTransport;
use sendlane::{Config, Core, init_tracing, shutdown_signal};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How long in-flight sends and dispatches get to finish after shutdown is
/// requested before they're abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(config.debug);

    let pool = PgPoolOptions::new()
        .max_connections(config.worker_concurrency as u32 + 5)
        .connect(&config.database_url)
        .await?;

    let smtp = Arc::new(RelayTransport::new(
        config.smtp.clone(),
        config.system_domain.clone(),
        config.worker_concurrency,
    ));

    let shutdown = CancellationToken::new();
    let core = Core::new(pool, config);
    let tasks = core.spawn(smtp.clone(), shutdown.clone());

    info!("worker started");
    shutdown_signal(shutdown.clone()).await;
    shutdown.cancel();
    info!(grace = ?SHUTDOWN_GRACE, "shutdown requested, draining in-flight work");

    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("shutdown grace period elapsed, abandoning remaining tasks");
    }

    smtp.close().await;
    info!("worker stopped");
    Ok(())
}
