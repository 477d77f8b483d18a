//! Replays accepted skips and switches against the remote ledger
//!
//! One dequeue means one attempt: the worker never retries a remote call
//! itself. Every job with a usable payload ends in exactly one audit entry
//! and exactly one notification job, whatever the remote outcome. Errors
//! returned from [`RemoteSyncWorker::process`] are local infrastructure
//! failures (audit or queue writes) and leave redelivery to the queue.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use time::PrimitiveDateTime;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::audit::{SkipAuditEntry, SwitchAuditEntry};
use crate::calendar;
use crate::catalog::ProductVariant;
use crate::context::BillingContext;
use crate::eligibility;
use crate::error::{BillingError, BillingResult};
use crate::mapping;
use crate::models::{OrderStatus, QueuedOrder, SubscriptionSnapshot, PRODUCT_ID_PROPERTY};
use crate::orders::order_from_remote;
use crate::queue::{
    enqueue_payload, Delivery, NotificationJob, NotificationKind, SyncAction, SyncJob,
};
use crate::remote::{self, RemoteLedgerClient, RemoteResponse};

pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(80);

/// Remote keys a successful skip folds back into the replica
const SKIP_FIELDS: &[&str] = &["next_charge_scheduled_at"];

/// Remote keys a successful standard switch folds back into the replica
const SWITCH_FIELDS: &[&str] = &[
    "shopify_product_id",
    "shopify_variant_id",
    "sku",
    "product_title",
];

/// Raised for operational visibility whenever a remote call errors or times
/// out, or a job cannot be processed at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub job_id: Uuid,
    pub subscription_id: Option<i64>,
    pub action: Option<SyncAction>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Audited and notified; `success` is the aggregate remote outcome
    Completed { success: bool },
    /// Unusable payload; nothing could be audited
    Malformed(String),
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Get,
    Post,
    Put,
}

impl Verb {
    fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
        }
    }
}

#[derive(Debug, Serialize)]
struct CallRecord {
    method: &'static str,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Running record of one job's remote calls
struct Attempt {
    job_id: Uuid,
    subscription_id: i64,
    action: SyncAction,
    success: bool,
    already_applied: bool,
    error: Option<String>,
    calls: Vec<CallRecord>,
}

impl Attempt {
    fn new(job_id: Uuid, subscription_id: i64, action: SyncAction) -> Self {
        Self {
            job_id,
            subscription_id,
            action,
            success: false,
            already_applied: false,
            error: None,
            calls: Vec::new(),
        }
    }

    /// Stop before any mutating call
    fn abandon(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
    }

    fn summary(&self) -> Option<String> {
        if self.success {
            return None;
        }
        self.error.clone().or_else(|| {
            self.calls.last().map(|call| match (&call.error, call.status) {
                (Some(error), _) => format!("{} {} failed: {}", call.method, call.path, error),
                (None, Some(status)) => {
                    format!("{} {} returned status {}", call.method, call.path, status)
                }
                (None, None) => format!("{} {} failed", call.method, call.path),
            })
        })
    }

    fn audit_detail(&self) -> Value {
        let mut detail = json!({
            "calls": self.calls,
            "already_applied": self.already_applied,
        });
        if let Some(error) = self.summary() {
            detail["error"] = Value::from(error);
        }
        detail
    }
}

pub struct RemoteSyncWorker {
    ctx: BillingContext,
    remote: std::sync::Arc<dyn RemoteLedgerClient>,
    remote_timeout: Duration,
    failures: Option<UnboundedSender<WorkerFailure>>,
}

impl RemoteSyncWorker {
    pub fn new(ctx: BillingContext, remote: std::sync::Arc<dyn RemoteLedgerClient>) -> Self {
        Self {
            ctx,
            remote,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            failures: None,
        }
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_failure_channel(mut self, failures: UnboundedSender<WorkerFailure>) -> Self {
        self.failures = Some(failures);
        self
    }

    pub async fn process(&self, delivery: &Delivery) -> BillingResult<JobOutcome> {
        let job: SyncJob = match delivery.decode() {
            Ok(job) => job,
            Err(e) => {
                return self
                    .malformed(
                        delivery,
                        subscription_id_hint(&delivery.payload),
                        action_hint(&delivery.payload),
                        BillingError::MalformedJob(format!("undecodable sync job: {e}")),
                    )
                    .await;
            }
        };

        let subscription_id = job.subscription_id();
        if let SyncJob::Skip { customer_ref, .. } = &job {
            if customer_ref.trim().is_empty() {
                return self
                    .malformed(
                        delivery,
                        Some(subscription_id),
                        Some(SyncAction::Skip),
                        BillingError::MissingCustomerRef(subscription_id),
                    )
                    .await;
            }
        }

        let Some(sub) = self.ctx.subscriptions.get(subscription_id).await? else {
            return self
                .malformed(
                    delivery,
                    Some(subscription_id),
                    Some(job.action()),
                    BillingError::SubscriptionNotFound(subscription_id),
                )
                .await;
        };

        // Prepaid rules and "this month" follow the request, not the replay
        let now = self.ctx.clock.now();
        let requested_at = job.requested_at();
        let classifier = self.ctx.tags.classifier().await?;
        let prepaid = eligibility::is_prepaid(&classifier, &sub, requested_at);

        match job {
            SyncJob::Skip {
                customer_ref,
                reason,
                next_charge_at,
                ..
            } => {
                self.run_skip(
                    delivery,
                    &sub,
                    prepaid,
                    next_charge_at,
                    customer_ref,
                    reason,
                    requested_at,
                    now,
                )
                .await
            }
            SyncJob::Switch {
                target_product_id,
                previous_product_id,
                ..
            } => {
                self.run_switch(
                    delivery,
                    &sub,
                    prepaid,
                    target_product_id,
                    previous_product_id,
                    requested_at,
                    now,
                )
                .await
            }
        }
    }

    async fn run_skip(
        &self,
        delivery: &Delivery,
        sub: &SubscriptionSnapshot,
        prepaid: bool,
        target: PrimitiveDateTime,
        customer_ref: String,
        reason: Option<String>,
        requested_at: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> BillingResult<JobOutcome> {
        let mut attempt = Attempt::new(delivery.id, sub.subscription_id, SyncAction::Skip);

        self.push_next_charge_date(sub, target, &mut attempt).await;
        if prepaid {
            self.redate_prepaid_orders(sub, requested_at, &mut attempt)
                .await;
        }

        let mut entry = SkipAuditEntry::new(sub.customer_id, sub.subscription_id, attempt.success, now)
            .with_detail(attempt.audit_detail());
        entry.customer_ref = Some(customer_ref);
        entry.reason = reason;
        entry.skipped_to = Some(target);
        self.ctx.audit.record_skip(&entry).await?;

        let mut detail = json!({ "date": calendar::format_date(target) });
        if let Some(error) = attempt.summary() {
            detail["error"] = Value::from(error);
        }
        self.notify(sub.subscription_id, SyncAction::Skip, attempt.success, detail)
            .await?;

        self.log_outcome(&attempt);
        Ok(JobOutcome::Completed {
            success: attempt.success,
        })
    }

    /// `set_next_charge_date`, unless the remote already charges on the target day
    async fn push_next_charge_date(
        &self,
        sub: &SubscriptionSnapshot,
        target: PrimitiveDateTime,
        attempt: &mut Attempt,
    ) {
        let path = format!("/subscriptions/{}", sub.subscription_id);
        if let Some(current) = self.call(Verb::Get, &path, &Value::Null, attempt).await {
            let remote_next = current
                .is_success()
                .then(|| remote_next_charge(&current.body))
                .flatten();
            if remote_next.map(|at| at.date()) == Some(target.date()) {
                tracing::info!(
                    subscription_id = sub.subscription_id,
                    date = %calendar::format_date(target),
                    "Remote charge date already advanced, not posting again"
                );
                attempt.already_applied = true;
                attempt.success = true;
                return;
            }
        }

        let path = format!("/subscriptions/{}/set_next_charge_date", sub.subscription_id);
        let body = json!({ "date": calendar::format_date(target) });
        let response = self.call(Verb::Post, &path, &body, attempt).await;
        attempt.success = response.as_ref().is_some_and(RemoteResponse::is_success);

        if let Some(response) = response.filter(RemoteResponse::is_success) {
            self.reconcile(sub.subscription_id, &response.body, SKIP_FIELDS)
                .await;
        }
    }

    /// Move the queued prepaid orders of the request's month one month later.
    ///
    /// The aggregate outcome is that of the last call made; each call is in
    /// the audit detail.
    async fn redate_prepaid_orders(
        &self,
        sub: &SubscriptionSnapshot,
        requested_at: PrimitiveDateTime,
        attempt: &mut Attempt,
    ) {
        let Some(orders) = self.fetch_queued_orders(sub, attempt).await else {
            return;
        };

        for (order, _) in orders
            .into_iter()
            .filter(|(order, _)| calendar::is_within_month(order.scheduled_at, requested_at))
        {
            let Some(new_at) = calendar::add_one_month(order.scheduled_at) else {
                continue;
            };
            let path = format!("/orders/{}/change_date", order.order_id);
            let body = json!({ "scheduled_at": calendar::format_wire(new_at) });
            let response = self.call(Verb::Post, &path, &body, attempt).await;
            attempt.success = response.as_ref().is_some_and(RemoteResponse::is_success);

            if attempt.success {
                self.cache_order(QueuedOrder {
                    scheduled_at: new_at,
                    ..order
                })
                .await;
            }
        }
    }

    async fn run_switch(
        &self,
        delivery: &Delivery,
        sub: &SubscriptionSnapshot,
        prepaid: bool,
        target_product_id: i64,
        previous_product_id: Option<i64>,
        requested_at: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> BillingResult<JobOutcome> {
        let mut attempt = Attempt::new(delivery.id, sub.subscription_id, SyncAction::Switch);
        let variant = self.ctx.catalog.variant_for_product(target_product_id).await?;

        match &variant {
            Some(variant) if prepaid => {
                self.switch_prepaid_orders(sub, variant, requested_at, &mut attempt)
                    .await
            }
            Some(variant) => self.switch_subscription(sub, variant, &mut attempt).await,
            None => attempt.abandon(format!(
                "product {target_product_id} has no known variant"
            )),
        }

        let entry = SwitchAuditEntry::new(
            sub.customer_id,
            sub.subscription_id,
            previous_product_id.unwrap_or(sub.product_id),
            Some(target_product_id),
            attempt.success,
            now,
        )
        .with_detail(attempt.audit_detail());
        self.ctx.audit.record_switch(&entry).await?;

        let mut detail = json!({
            "shopify_product_id": target_product_id,
            "shopify_variant_id": variant.as_ref().map(|v| v.variant_id),
            "sku": variant.as_ref().and_then(|v| v.sku.clone()),
            "product_title": variant.as_ref().map(|v| v.product_title.clone()),
        });
        if let Some(error) = attempt.summary() {
            detail["error"] = Value::from(error);
        }
        self.notify(sub.subscription_id, SyncAction::Switch, attempt.success, detail)
            .await?;

        self.log_outcome(&attempt);
        Ok(JobOutcome::Completed {
            success: attempt.success,
        })
    }

    async fn switch_subscription(
        &self,
        sub: &SubscriptionSnapshot,
        variant: &ProductVariant,
        attempt: &mut Attempt,
    ) {
        let path = format!("/subscriptions/{}", sub.subscription_id);
        let body = json!({
            "shopify_product_id": variant.product_id,
            "shopify_variant_id": variant.variant_id,
            "sku": variant.sku,
            "product_title": variant.product_title,
        });
        let response = self.call(Verb::Put, &path, &body, attempt).await;
        attempt.success = response.as_ref().is_some_and(|r| r.status == 200);

        if let Some(response) = response.filter(|r| r.status == 200) {
            self.reconcile(sub.subscription_id, &response.body, SWITCH_FIELDS)
                .await;
        }
    }

    /// Rewrite the subscription's line items on the queued prepaid orders
    /// still due in the request's month.
    ///
    /// The ledger replaces `line_items` wholesale, so every other line item
    /// and field is sent back unchanged.
    async fn switch_prepaid_orders(
        &self,
        sub: &SubscriptionSnapshot,
        variant: &ProductVariant,
        requested_at: PrimitiveDateTime,
        attempt: &mut Attempt,
    ) {
        let Some(orders) = self.fetch_queued_orders(sub, attempt).await else {
            return;
        };

        let mut targets = orders
            .into_iter()
            .filter(|(order, _)| {
                eligibility::is_upcoming_prepaid_order(order, sub.subscription_id, requested_at)
            })
            .peekable();
        if targets.peek().is_none() {
            attempt.abandon("no queued order to switch this month");
            return;
        }

        for (_, raw) in targets {
            let Some(order_id) = raw.get("id").cloned() else {
                continue;
            };
            let line_items = raw
                .get("line_items")
                .and_then(Value::as_array)
                .map(|items| rewrite_line_items(items, sub.subscription_id, variant))
                .unwrap_or_default();

            let path = format!("/orders/{}", id_text(&order_id));
            let body = json!({ "line_items": line_items });
            let response = self.call(Verb::Put, &path, &body, attempt).await;
            attempt.success = response.as_ref().is_some_and(|r| r.status == 200);

            if attempt.success {
                let mut updated = raw.clone();
                updated["line_items"] = body["line_items"].clone();
                if let Ok(order) = order_from_remote(&updated) {
                    self.cache_order(order).await;
                }
            }
        }
    }

    /// Remote QUEUED orders for the subscription, parsed and raw
    async fn fetch_queued_orders(
        &self,
        sub: &SubscriptionSnapshot,
        attempt: &mut Attempt,
    ) -> Option<Vec<(QueuedOrder, Value)>> {
        let path = format!(
            "/orders?subscription_id={}&status=QUEUED",
            sub.subscription_id
        );
        let response = self.call(Verb::Get, &path, &Value::Null, attempt).await;
        let Some(response) = response.filter(RemoteResponse::is_success) else {
            attempt.success = false;
            return None;
        };

        let raw_orders = response
            .body
            .get("orders")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Some(
            raw_orders
                .into_iter()
                .filter_map(|raw| match order_from_remote(&raw) {
                    Ok(order) if order.status == OrderStatus::Queued => Some((order, raw)),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(
                            subscription_id = sub.subscription_id,
                            error = %e,
                            "Ignoring unreadable remote order"
                        );
                        None
                    }
                })
                .collect(),
        )
    }

    async fn call(
        &self,
        verb: Verb,
        path: &str,
        body: &Value,
        attempt: &mut Attempt,
    ) -> Option<RemoteResponse> {
        let request = async {
            match verb {
                Verb::Get => self.remote.get(path).await,
                Verb::Post => self.remote.post(path, body).await,
                Verb::Put => self.remote.put(path, body).await,
            }
        };

        match remote::with_timeout(self.remote_timeout, request).await {
            Ok(response) => {
                tracing::debug!(
                    subscription_id = attempt.subscription_id,
                    method = verb.as_str(),
                    path = %path,
                    status = response.status,
                    "Remote call completed"
                );
                attempt.calls.push(CallRecord {
                    method: verb.as_str(),
                    path: path.to_string(),
                    status: Some(response.status),
                    error: None,
                });
                Some(response)
            }
            Err(e) => {
                tracing::warn!(
                    subscription_id = attempt.subscription_id,
                    method = verb.as_str(),
                    path = %path,
                    error = %e,
                    "Remote call failed"
                );
                attempt.calls.push(CallRecord {
                    method: verb.as_str(),
                    path: path.to_string(),
                    status: None,
                    error: Some(e.to_string()),
                });
                self.report_failure(WorkerFailure {
                    job_id: attempt.job_id,
                    subscription_id: Some(attempt.subscription_id),
                    action: Some(attempt.action),
                    error: e.to_string(),
                });
                None
            }
        }
    }

    /// Fold the pushed fields of a confirmed remote subscription back into
    /// the replica.
    ///
    /// The row is re-read and only `pushed` keys are written: later requests
    /// may already have changed other fields locally while their jobs wait
    /// in the queue.
    async fn reconcile(&self, subscription_id: i64, body: &Value, pushed: &[&str]) {
        let Some(remote) = body.get("subscription").and_then(Value::as_object) else {
            return;
        };
        if let Err(e) = self.fold_pushed_fields(subscription_id, remote, pushed).await {
            tracing::warn!(
                subscription_id = subscription_id,
                error = %e,
                "Could not reconcile replica with remote subscription"
            );
        }
    }

    async fn fold_pushed_fields(
        &self,
        subscription_id: i64,
        remote: &Map<String, Value>,
        pushed: &[&str],
    ) -> BillingResult<()> {
        let Some(mut current) = self.ctx.subscriptions.get(subscription_id).await? else {
            return Ok(());
        };
        let before = current.clone();
        for key in pushed {
            let field = mapping::field_for_remote_key(key);
            let (Some(field), Some(value)) = (field, remote.get(*key)) else {
                continue;
            };
            field.apply_inbound(&mut current, value)?;
        }
        if current != before {
            self.ctx.subscriptions.save(&current).await?;
        }
        Ok(())
    }

    async fn cache_order(&self, order: QueuedOrder) {
        if let Err(e) = self.ctx.orders.upsert(&order).await {
            tracing::warn!(order_id = order.order_id, error = %e, "Could not refresh cached order");
        }
    }

    async fn notify(
        &self,
        subscription_id: i64,
        action: SyncAction,
        success: bool,
        detail: Value,
    ) -> BillingResult<()> {
        let job = NotificationJob {
            kind: NotificationKind::from_outcome(success),
            subscription_id,
            action,
            detail,
        };
        if !enqueue_payload(self.ctx.queue.as_ref(), &job).await? {
            return Err(BillingError::QueueRejected(format!(
                "notification for subscription {subscription_id}"
            )));
        }
        Ok(())
    }

    async fn malformed(
        &self,
        delivery: &Delivery,
        subscription_id: Option<i64>,
        action: Option<SyncAction>,
        error: BillingError,
    ) -> BillingResult<JobOutcome> {
        let error = error.to_string();
        tracing::error!(
            job_id = %delivery.id,
            subscription_id = ?subscription_id,
            error = %error,
            "Malformed sync job"
        );
        self.report_failure(WorkerFailure {
            job_id: delivery.id,
            subscription_id,
            action,
            error: error.clone(),
        });

        if let (Some(subscription_id), Some(action)) = (subscription_id, action) {
            let notified = self
                .notify(subscription_id, action, false, json!({ "error": error }))
                .await;
            if let Err(e) = notified {
                tracing::warn!(
                    subscription_id = subscription_id,
                    error = %e,
                    "Could not enqueue notification for malformed job"
                );
            }
        }
        Ok(JobOutcome::Malformed(error))
    }

    fn report_failure(&self, failure: WorkerFailure) {
        if let Some(failures) = &self.failures {
            // Receiver gone means nobody is watching; the log line already exists
            let _ = failures.send(failure);
        }
    }

    fn log_outcome(&self, attempt: &Attempt) {
        if attempt.success {
            tracing::info!(
                subscription_id = attempt.subscription_id,
                action = attempt.action.as_str(),
                already_applied = attempt.already_applied,
                calls = attempt.calls.len(),
                "Sync job applied"
            );
        } else {
            tracing::warn!(
                subscription_id = attempt.subscription_id,
                action = attempt.action.as_str(),
                calls = attempt.calls.len(),
                error = %attempt.summary().unwrap_or_default(),
                "Sync job failed"
            );
        }
    }
}

fn remote_next_charge(body: &Value) -> Option<PrimitiveDateTime> {
    let sub = body.get("subscription").unwrap_or(body);
    sub.get("next_charge_scheduled_at")?
        .as_str()
        .and_then(|raw| calendar::parse_wire(raw).ok())
}

fn subscription_id_hint(payload: &Value) -> Option<i64> {
    match payload.get("subscription_id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn action_hint(payload: &Value) -> Option<SyncAction> {
    match payload.get("type")?.as_str()? {
        "skip" => Some(SyncAction::Skip),
        "switch" => Some(SyncAction::Switch),
        _ => None,
    }
}

fn id_text(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn line_item_subscription(item: &Value) -> Option<i64> {
    subscription_id_hint(item)
}

/// Point the subscription's line items at the variant, keeping everything else
pub(crate) fn rewrite_line_items(
    items: &[Value],
    subscription_id: i64,
    variant: &ProductVariant,
) -> Vec<Value> {
    items
        .iter()
        .map(|item| {
            let mut item = item.clone();
            if line_item_subscription(&item) != Some(subscription_id) {
                return item;
            }
            if let Some(fields) = item.as_object_mut() {
                rewrite_line_item(fields, variant);
            }
            item
        })
        .collect()
}

fn rewrite_line_item(fields: &mut Map<String, Value>, variant: &ProductVariant) {
    fields.insert("title".into(), Value::from(variant.product_title.clone()));
    fields.insert("sku".into(), json!(variant.sku));
    fields.insert("variant_title".into(), json!(variant.variant_title));
    fields.insert("product_id".into(), Value::from(variant.product_id));
    fields.insert("variant_id".into(), Value::from(variant.variant_id));
    if fields.contains_key("shopify_product_id") {
        fields.insert(
            "shopify_product_id".into(),
            Value::from(variant.product_id.to_string()),
        );
    }
    if fields.contains_key("shopify_variant_id") {
        fields.insert(
            "shopify_variant_id".into(),
            Value::from(variant.variant_id.to_string()),
        );
    }

    let product_id = Value::from(variant.product_id.to_string());
    let properties = fields
        .entry("properties")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(properties) = properties {
        let mut found = false;
        for property in properties.iter_mut() {
            if property.get("name").and_then(Value::as_str) == Some(PRODUCT_ID_PROPERTY) {
                property["value"] = product_id.clone();
                found = true;
            }
        }
        if !found {
            properties.push(json!({ "name": PRODUCT_ID_PROPERTY, "value": product_id }));
        }
    }
}
