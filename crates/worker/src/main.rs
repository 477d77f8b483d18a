//! Subsync Background Worker
//!
//! Runs:
//! - The sync worker pool replaying accepted skips and switches against the ledger
//! - The notification dispatcher
//! - Stale job recovery (every minute)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;

use subsync_billing::{
    BillingContext, HttpLedgerClient, LogNotificationSink, NotificationDispatcher,
    NotificationSink, RemoteSyncWorker, SubscriptionService, SwitchPolicy, SystemClock,
    WebhookNotificationSink, WorkerFailure, WorkerPool,
};
use subsync_shared::{create_pool, init_tracing, run_migrations, Config};
use tokio::sync::{mpsc, watch};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Log every remote exception, timeout or unprocessable job
async fn drain_failures(mut failures: mpsc::UnboundedReceiver<WorkerFailure>) {
    while let Some(failure) = failures.recv().await {
        error!(
            job_id = %failure.job_id,
            subscription_id = ?failure.subscription_id,
            action = failure.action.map(|a| a.as_str()).unwrap_or("unknown"),
            error = %failure.error,
            "Sync worker failure"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    init_tracing(config.log_format, "info,subsync_billing=debug");
    info!("Starting Subsync Worker");

    // Pool workers plus the dispatcher and scheduled jobs
    let max_connections = u32::try_from(config.worker.pool_size)
        .unwrap_or(u32::MAX)
        .saturating_add(2);
    let pool = create_pool(&config.database_url, max_connections).await?;
    run_migrations(&pool).await?;

    let clock = Arc::new(SystemClock::new(config.ledger.utc_offset_hours));
    let ctx = BillingContext::postgres(pool.clone(), clock);
    let ledger = Arc::new(HttpLedgerClient::new(&config.ledger)?);

    // Default switches resolve through ALT_PRODUCTS; flag alternates the catalog cannot sell
    let service = SubscriptionService::new(
        ctx.clone(),
        Arc::new(SwitchPolicy::from_config(&config)),
    );
    match service.unresolvable_alternates().await {
        Ok(missing) => {
            for (product_id, alternate) in missing {
                warn!(
                    product_id = product_id,
                    alternate = alternate,
                    "ALT_PRODUCTS alternate has no known variant, default switches will be refused"
                );
            }
        }
        Err(e) => error!(error = %e, "Failed to check ALT_PRODUCTS against the catalog"),
    }

    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    let failure_drain = tokio::spawn(drain_failures(failure_rx));

    let worker = RemoteSyncWorker::new(ctx.clone(), ledger)
        .with_remote_timeout(config.ledger.timeout)
        .with_failure_channel(failure_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = WorkerPool::new(
        Arc::new(worker),
        ctx.queue.clone(),
        config.worker.pool_size,
        config.worker.poll_interval,
    )
    .spawn(shutdown_rx.clone());
    info!(workers = workers.len(), "Sync worker pool started");

    let sink: Arc<dyn NotificationSink> = match &config.worker.notification_webhook_url {
        Some(url) => Arc::new(WebhookNotificationSink::new(
            url.clone(),
            config.ledger.timeout,
        )?),
        None => {
            warn!("NOTIFICATION_WEBHOOK_URL not set - notifications are logged only");
            Arc::new(LogNotificationSink)
        }
    };
    let dispatcher = NotificationDispatcher::new(
        ctx.queue.clone(),
        sink,
        config.worker.notification_max_attempts,
        config.worker.poll_interval,
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx));

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Return jobs whose worker died mid-flight (every minute)
    let stale_queue = ctx.queue.clone();
    let lease = config.worker.lease;
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let queue = stale_queue.clone();
            Box::pin(async move {
                match queue.requeue_stale(lease).await {
                    Ok(0) => {}
                    Ok(count) => warn!(count = count, "Requeued stale sync jobs"),
                    Err(e) => error!(error = %e, "Failed to requeue stale jobs"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale job recovery (every minute)");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Subsync Worker started successfully with 2 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, finishing in-flight jobs");

    // Workers observe shutdown between jobs, so in-flight jobs complete
    shutdown_tx.send(true)?;
    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "Sync worker task panicked");
        }
    }
    if let Err(e) = dispatcher_handle.await {
        error!(error = %e, "Notification dispatcher task panicked");
    }
    scheduler.shutdown().await?;

    // Every sender is gone once the pool has stopped
    if let Err(e) = failure_drain.await {
        error!(error = %e, "Failure drain task panicked");
    }
    pool.close().await;

    info!("Subsync Worker stopped");
    Ok(())
}
