//! Durable job queue
//!
//! Jobs are JSON envelopes in named queues (`sync` for remote mutations,
//! `notifications` for outcome messages). Delivery is at-least-once: a job
//! stays recorded until acknowledged, and a claimed job that is never
//! acknowledged comes back once its lease expires.
//!
//! Jobs sharing a partition key (the subscription id) are delivered strictly
//! in enqueue order: a job is claimable only when no earlier job of the same
//! partition is still queued or in flight.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use time::PrimitiveDateTime;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use uuid::Uuid;

use crate::error::BillingResult;

pub const SYNC_QUEUE: &str = "sync";
pub const NOTIFICATION_QUEUE: &str = "notifications";

/// Upper bound for redelivery backoff
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// A typed job that knows which queue and partition it belongs to
pub trait QueuePayload: Serialize + DeserializeOwned {
    const QUEUE: &'static str;

    fn partition_key(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Skip,
    Switch,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Skip => "skipping",
            SyncAction::Switch => "switching_product",
        }
    }
}

/// Remote mutation to replay against the ledger.
///
/// Carries the values decided when the request was accepted, so replay
/// never re-reads them from a replica row that later jobs may have moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncJob {
    Skip {
        subscription_id: i64,
        customer_ref: String,
        reason: Option<String>,
        /// Charge instant the skip moved the subscription to
        next_charge_at: PrimitiveDateTime,
        requested_at: PrimitiveDateTime,
    },
    Switch {
        subscription_id: i64,
        target_product_id: i64,
        /// Product the subscription carried when the switch was accepted
        #[serde(default)]
        previous_product_id: Option<i64>,
        requested_at: PrimitiveDateTime,
    },
}

impl SyncJob {
    pub fn subscription_id(&self) -> i64 {
        match self {
            SyncJob::Skip { subscription_id, .. } | SyncJob::Switch { subscription_id, .. } => {
                *subscription_id
            }
        }
    }

    pub fn action(&self) -> SyncAction {
        match self {
            SyncJob::Skip { .. } => SyncAction::Skip,
            SyncJob::Switch { .. } => SyncAction::Switch,
        }
    }

    /// When the request behind this job was accepted
    pub fn requested_at(&self) -> PrimitiveDateTime {
        match self {
            SyncJob::Skip { requested_at, .. } | SyncJob::Switch { requested_at, .. } => {
                *requested_at
            }
        }
    }
}

impl QueuePayload for SyncJob {
    const QUEUE: &'static str = SYNC_QUEUE;

    fn partition_key(&self) -> String {
        self.subscription_id().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Addressed to the customer
    Success,
    /// Addressed to customer support
    Failure,
}

impl NotificationKind {
    pub fn from_outcome(success: bool) -> Self {
        if success {
            NotificationKind::Success
        } else {
            NotificationKind::Failure
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Success => "success",
            NotificationKind::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub kind: NotificationKind,
    pub subscription_id: i64,
    pub action: SyncAction,
    pub detail: Value,
}

impl QueuePayload for NotificationJob {
    const QUEUE: &'static str = NOTIFICATION_QUEUE;

    fn partition_key(&self) -> String {
        self.subscription_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobEnvelope {
    pub queue: String,
    pub partition_key: String,
    pub payload: Value,
}

impl JobEnvelope {
    pub fn for_payload<P: QueuePayload>(payload: &P) -> BillingResult<Self> {
        Ok(Self {
            queue: P::QUEUE.to_string(),
            partition_key: payload.partition_key(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// A claimed job. Must be acked, released or buried.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub queue: String,
    pub partition_key: String,
    /// Deliveries so far, including this one
    pub attempts: u32,
    pub payload: Value,
}

impl Delivery {
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// `true` once the job is durably recorded
    async fn enqueue(&self, envelope: JobEnvelope) -> BillingResult<bool>;

    /// Claim the oldest deliverable job of a queue, if any
    async fn try_dequeue(&self, queue: &str) -> BillingResult<Option<Delivery>>;

    async fn ack(&self, id: Uuid) -> BillingResult<()>;

    /// Return a claimed job for redelivery after `retry_in`
    async fn release(&self, id: Uuid, retry_in: Duration, error: &str) -> BillingResult<()>;

    /// Park a job permanently
    async fn bury(&self, id: Uuid, error: &str) -> BillingResult<()>;

    /// Return jobs claimed longer than `lease` ago to the queue
    async fn requeue_stale(&self, lease: Duration) -> BillingResult<u64>;
}

pub async fn enqueue_payload<P: QueuePayload>(
    queue: &dyn JobQueue,
    payload: &P,
) -> BillingResult<bool> {
    queue.enqueue(JobEnvelope::for_payload(payload)?).await
}

/// Poll until a job is claimed or shutdown is signalled (`None`)
pub async fn dequeue_blocking(
    queue: &dyn JobQueue,
    name: &str,
    poll_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> BillingResult<Option<Delivery>> {
    loop {
        if *shutdown.borrow() {
            return Ok(None);
        }
        if let Some(delivery) = queue.try_dequeue(name).await? {
            return Ok(Some(delivery));
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Ok(None);
                }
            }
        }
    }
}

/// Redelivery delay after the given number of attempts: 1s, 2s, 4s, ... capped
pub fn retry_delay(attempts: u32) -> Duration {
    ExponentialBackoff::from_millis(2)
        .factor(500)
        .max_delay(MAX_RETRY_DELAY)
        .nth(attempts.saturating_sub(1) as usize)
        .unwrap_or(MAX_RETRY_DELAY)
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    queue: String,
    partition_key: String,
    attempts: i32,
    payload: Value,
}

impl From<DeliveryRow> for Delivery {
    fn from(row: DeliveryRow) -> Self {
        Delivery {
            id: row.id,
            queue: row.queue,
            partition_key: row.partition_key,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            payload: row.payload,
        }
    }
}

pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> BillingResult<bool> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO job_queue (id, queue, partition_key, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(&envelope.queue)
        .bind(&envelope.partition_key)
        .bind(&envelope.payload)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            job_id = %id,
            queue = %envelope.queue,
            partition_key = %envelope.partition_key,
            "Enqueued job"
        );
        Ok(result.rows_affected() == 1)
    }

    async fn try_dequeue(&self, queue: &str) -> BillingResult<Option<Delivery>> {
        let row: Option<DeliveryRow> = sqlx::query_as(
            r#"
            UPDATE job_queue
            SET status = 'processing', attempts = attempts + 1, locked_at = NOW()
            WHERE id = (
                SELECT j.id FROM job_queue j
                WHERE j.queue = $1
                  AND j.status = 'queued'
                  AND j.available_at <= NOW()
                  AND NOT EXISTS (
                      SELECT 1 FROM job_queue earlier
                      WHERE earlier.queue = j.queue
                        AND earlier.partition_key = j.partition_key
                        AND earlier.seq < j.seq
                        AND earlier.status IN ('queued', 'processing')
                  )
                ORDER BY j.seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue, partition_key, attempts, payload
            "#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Delivery::from))
    }

    async fn ack(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM job_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, id: Uuid, retry_in: Duration, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'queued',
                locked_at = NULL,
                available_at = NOW() + make_interval(secs => $2),
                last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_in.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bury(&self, id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'failed', locked_at = NULL, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        tracing::warn!(job_id = %id, error = %error, "Buried job");
        Ok(())
    }

    async fn requeue_stale(&self, lease: Duration) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'queued', locked_at = NULL
            WHERE status = 'processing'
              AND locked_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    Processing,
    Failed,
}

#[derive(Debug, Clone)]
struct StoredJob {
    id: Uuid,
    envelope: JobEnvelope,
    state: JobState,
    attempts: u32,
    available_at: Instant,
    locked_at: Option<Instant>,
    last_error: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    // Enqueue order
    jobs: VecDeque<StoredJob>,
    rejecting: bool,
}

/// Process-local queue with the same delivery rules as the Postgres one
#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse further enqueues, as a queue whose store is unavailable would
    pub async fn set_rejecting(&self, rejecting: bool) {
        self.state.lock().await.rejecting = rejecting;
    }

    /// Payloads not yet acknowledged, buried ones included
    pub async fn pending(&self, queue: &str) -> Vec<Value> {
        self.state
            .lock()
            .await
            .jobs
            .iter()
            .filter(|job| job.envelope.queue == queue)
            .map(|job| job.envelope.payload.clone())
            .collect()
    }

    pub async fn buried(&self, queue: &str) -> Vec<(Value, Option<String>)> {
        self.state
            .lock()
            .await
            .jobs
            .iter()
            .filter(|job| job.envelope.queue == queue && job.state == JobState::Failed)
            .map(|job| (job.envelope.payload.clone(), job.last_error.clone()))
            .collect()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if state.rejecting {
            return Ok(false);
        }
        state.jobs.push_back(StoredJob {
            id: Uuid::new_v4(),
            envelope,
            state: JobState::Queued,
            attempts: 0,
            available_at: Instant::now(),
            locked_at: None,
            last_error: None,
        });
        Ok(true)
    }

    async fn try_dequeue(&self, queue: &str) -> BillingResult<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let mut blocked: Vec<&str> = Vec::new();
        let mut claim = None;
        for (index, job) in state.jobs.iter().enumerate() {
            if job.envelope.queue != queue || job.state == JobState::Failed {
                continue;
            }
            let partition = job.envelope.partition_key.as_str();
            if blocked.contains(&partition) {
                continue;
            }
            if job.state == JobState::Queued && job.available_at <= now {
                claim = Some(index);
                break;
            }
            blocked.push(partition);
        }

        let Some(index) = claim else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(index) else {
            return Ok(None);
        };
        job.state = JobState::Processing;
        job.attempts += 1;
        job.locked_at = Some(now);

        Ok(Some(Delivery {
            id: job.id,
            queue: job.envelope.queue.clone(),
            partition_key: job.envelope.partition_key.clone(),
            attempts: job.attempts,
            payload: job.envelope.payload.clone(),
        }))
    }

    async fn ack(&self, id: Uuid) -> BillingResult<()> {
        self.state.lock().await.jobs.retain(|job| job.id != id);
        Ok(())
    }

    async fn release(&self, id: Uuid, retry_in: Duration, error: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.iter_mut().find(|job| job.id == id) {
            job.state = JobState::Queued;
            job.locked_at = None;
            job.available_at = Instant::now() + retry_in;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn bury(&self, id: Uuid, error: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.iter_mut().find(|job| job.id == id) {
            job.state = JobState::Failed;
            job.locked_at = None;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn requeue_stale(&self, lease: Duration) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut requeued = 0;
        for job in state.jobs.iter_mut() {
            let stale = job
                .locked_at
                .is_some_and(|locked| now.duration_since(locked) > lease);
            if job.state == JobState::Processing && stale {
                job.state = JobState::Queued;
                job.locked_at = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}
