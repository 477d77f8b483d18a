//! Outcome notifications
//!
//! The sync worker only enqueues [`NotificationJob`]s; this module delivers
//! them. Successes are meant for the customer, failures for support.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio::sync::watch;

use crate::error::{BillingError, BillingResult};
use crate::queue::{self, JobQueue, NotificationJob, NOTIFICATION_QUEUE};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, job: &NotificationJob) -> BillingResult<()>;
}

/// Posts each notification as JSON to a configured endpoint
pub struct WebhookNotificationSink {
    http: Client,
    url: String,
}

impl WebhookNotificationSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> BillingResult<Self> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn notify(&self, job: &NotificationJob) -> BillingResult<()> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({
                "kind": job.kind.as_str(),
                "subscription_id": job.subscription_id,
                "action": job.action.as_str(),
                "details": job.detail,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BillingError::Notification(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Writes notifications to the log only
#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, job: &NotificationJob) -> BillingResult<()> {
        tracing::info!(
            kind = job.kind.as_str(),
            subscription_id = job.subscription_id,
            action = job.action.as_str(),
            detail = %job.detail,
            "Notification"
        );
        Ok(())
    }
}

/// Drains the notification queue into a sink
pub struct NotificationDispatcher {
    queue: Arc<dyn JobQueue>,
    sink: Arc<dyn NotificationSink>,
    max_attempts: u32,
    poll_interval: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        sink: Arc<dyn NotificationSink>,
        max_attempts: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            sink,
            max_attempts: max_attempts.max(1),
            poll_interval,
        }
    }

    /// Deliver one pending notification. Returns `false` when the queue was empty.
    pub async fn process_next(&self) -> BillingResult<bool> {
        let Some(delivery) = self.queue.try_dequeue(NOTIFICATION_QUEUE).await? else {
            return Ok(false);
        };

        let job: NotificationJob = match delivery.decode() {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %delivery.id, error = %e, "Malformed notification job");
                self.queue.bury(delivery.id, &e.to_string()).await?;
                return Ok(true);
            }
        };

        match self.sink.notify(&job).await {
            Ok(()) => {
                self.queue.ack(delivery.id).await?;
                tracing::debug!(
                    subscription_id = job.subscription_id,
                    kind = job.kind.as_str(),
                    "Notification delivered"
                );
            }
            Err(e) if delivery.attempts >= self.max_attempts => {
                tracing::error!(
                    subscription_id = job.subscription_id,
                    attempts = delivery.attempts,
                    error = %e,
                    "Notification undeliverable, giving up"
                );
                self.queue.bury(delivery.id, &e.to_string()).await?;
            }
            Err(e) => {
                let retry_in = queue::retry_delay(delivery.attempts);
                tracing::warn!(
                    subscription_id = job.subscription_id,
                    attempts = delivery.attempts,
                    retry_in_ms = retry_in.as_millis() as u64,
                    error = %e,
                    "Notification delivery failed, will retry"
                );
                self.queue
                    .release(delivery.id, retry_in, &e.to_string())
                    .await?;
            }
        }
        Ok(true)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Notification dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "Notification dispatch failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Notification dispatcher stopped");
    }
}
