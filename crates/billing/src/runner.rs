//! Pool of sync workers pulling from the `sync` queue
//!
//! Same-subscription ordering comes from the queue's partitioning: while
//! one worker holds a subscription's job, no other worker can claim a later
//! job for that subscription. A dequeued job always runs to completion;
//! shutdown is only observed between jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::BillingResult;
use crate::queue::{self, Delivery, JobQueue, SYNC_QUEUE};
use crate::worker::{JobOutcome, RemoteSyncWorker};

pub struct WorkerPool {
    worker: Arc<RemoteSyncWorker>,
    queue: Arc<dyn JobQueue>,
    size: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        worker: Arc<RemoteSyncWorker>,
        queue: Arc<dyn JobQueue>,
        size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            worker,
            queue,
            size: size.max(1),
            poll_interval,
        }
    }

    /// Claim and settle a single job. Returns `false` when nothing was ready.
    pub async fn run_once(&self) -> BillingResult<bool> {
        match self.queue.try_dequeue(SYNC_QUEUE).await? {
            Some(delivery) => {
                settle(&self.worker, self.queue.as_ref(), delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start `size` worker loops; they exit once `shutdown` turns true
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.size)
            .map(|index| {
                let worker = self.worker.clone();
                let queue = self.queue.clone();
                let poll_interval = self.poll_interval;
                let shutdown = shutdown.clone();
                tokio::spawn(worker_loop(index, worker, queue, poll_interval, shutdown))
            })
            .collect()
    }
}

async fn worker_loop(
    index: usize,
    worker: Arc<RemoteSyncWorker>,
    queue: Arc<dyn JobQueue>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(worker = index, "Sync worker started");
    loop {
        match queue::dequeue_blocking(queue.as_ref(), SYNC_QUEUE, poll_interval, &mut shutdown)
            .await
        {
            Ok(Some(delivery)) => {
                let job_id = delivery.id;
                if let Err(e) = settle(&worker, queue.as_ref(), delivery).await {
                    tracing::error!(worker = index, job_id = %job_id, error = %e, "Failed to settle sync job");
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(worker = index, error = %e, "Failed to poll sync queue");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    tracing::info!(worker = index, "Sync worker stopped");
}

/// Process a claimed job and ack, bury or release it
async fn settle(
    worker: &RemoteSyncWorker,
    queue: &dyn JobQueue,
    delivery: Delivery,
) -> BillingResult<()> {
    match worker.process(&delivery).await {
        Ok(JobOutcome::Completed { .. }) => queue.ack(delivery.id).await,
        Ok(JobOutcome::Malformed(error)) => queue.bury(delivery.id, &error).await,
        Err(e) => {
            let retry_in = queue::retry_delay(delivery.attempts);
            tracing::warn!(
                job_id = %delivery.id,
                attempts = delivery.attempts,
                retry_in_ms = retry_in.as_millis() as u64,
                error = %e,
                "Sync job interrupted, will be redelivered"
            );
            queue.release(delivery.id, retry_in, &e.to_string()).await
        }
    }
}
