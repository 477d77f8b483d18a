//! Request-path orchestration for customer skip and switch requests
//!
//! Eligibility is decided here, synchronously, against the local replica.
//! Accepted requests change the replica and enqueue a [`SyncJob`]; the
//! remote ledger is only touched by the sync worker. Refused requests are
//! audited with a failed status so every attempt leaves a record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::PrimitiveDateTime;

use crate::audit::{SkipAuditEntry, SwitchAuditEntry};
use crate::calendar;
use crate::context::BillingContext;
use crate::eligibility::{EligibilityEngine, Refusal, SwitchPolicy};
use crate::error::{BillingError, BillingResult};
use crate::mapping::{self, MappingError};
use crate::models::{QueuedOrder, SubscriptionSnapshot};
use crate::orders::order_from_remote;
use crate::queue::{enqueue_payload, SyncJob};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRequest {
    /// Storefront customer the skip is recorded against
    pub customer_ref: String,
    pub reason: Option<String>,
}

impl SkipRequest {
    pub fn new(customer_ref: impl Into<String>) -> Self {
        Self {
            customer_ref: customer_ref.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SkipOutcome {
    Accepted { next_charge_at: PrimitiveDateTime },
    Refused { refusal: Refusal },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SwitchOutcome {
    Accepted { product_id: i64 },
    Refused { refusal: Refusal },
}

/// Eligibility summary for one subscription; `None` means allowed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionEligibility {
    pub subscription_id: i64,
    pub product_id: i64,
    pub next_charge_at: Option<PrimitiveDateTime>,
    pub prepaid: bool,
    pub skip_refusal: Option<Refusal>,
    pub switch_refusal: Option<Refusal>,
}

impl SubscriptionEligibility {
    pub fn can_skip(&self) -> bool {
        self.skip_refusal.is_none()
    }

    pub fn can_switch(&self) -> bool {
        self.switch_refusal.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialUpdate {
    /// Remote keys that were recognised and applied
    pub applied: Vec<&'static str>,
    /// Outbound representation after the update
    pub subscription: Map<String, Value>,
}

pub struct SubscriptionService {
    ctx: BillingContext,
    policy: Arc<SwitchPolicy>,
}

impl SubscriptionService {
    pub fn new(ctx: BillingContext, policy: Arc<SwitchPolicy>) -> Self {
        Self { ctx, policy }
    }

    async fn engine(&self) -> BillingResult<EligibilityEngine> {
        Ok(EligibilityEngine::new(
            self.ctx.tags.classifier().await?,
            self.policy.clone(),
        ))
    }

    async fn load(&self, subscription_id: i64) -> BillingResult<SubscriptionSnapshot> {
        self.ctx
            .subscriptions
            .get(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))
    }

    async fn prepaid_orders(
        &self,
        sub: &SubscriptionSnapshot,
        now: PrimitiveDateTime,
    ) -> BillingResult<Vec<QueuedOrder>> {
        self.ctx
            .orders
            .queued_orders_for_subscription_this_month(sub.subscription_id, true, now)
            .await
    }

    /// Save the changed replica row and enqueue its sync job, restoring the
    /// previous row if the queue does not take the job
    async fn commit(
        &self,
        original: &SubscriptionSnapshot,
        updated: &SubscriptionSnapshot,
        job: &SyncJob,
    ) -> BillingResult<()> {
        if original != updated {
            self.ctx.subscriptions.save(updated).await?;
        }

        let accepted = match enqueue_payload(self.ctx.queue.as_ref(), job).await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.ctx.subscriptions.save(original).await?;
                return Err(e);
            }
        };
        if !accepted {
            self.ctx.subscriptions.save(original).await?;
            return Err(BillingError::QueueRejected(format!(
                "sync job for subscription {}",
                original.subscription_id
            )));
        }
        Ok(())
    }

    pub async fn request_skip(
        &self,
        subscription_id: i64,
        request: SkipRequest,
        now: PrimitiveDateTime,
    ) -> BillingResult<SkipOutcome> {
        if request.customer_ref.trim().is_empty() {
            return Err(BillingError::MissingCustomerRef(subscription_id));
        }
        let original = self.load(subscription_id).await?;
        let engine = self.engine().await?;
        let mut sub = original.clone();

        let result = if engine.is_prepaid(&sub, now) {
            let orders = self.prepaid_orders(&sub, now).await?;
            engine.try_skip_prepaid(&mut sub, &orders, now)
        } else {
            engine.try_skip(&mut sub, now)
        };

        let next_charge_at = match result {
            Ok(next_charge_at) => next_charge_at,
            Err(refusal) => {
                let mut entry =
                    SkipAuditEntry::new(sub.customer_id, subscription_id, false, now)
                        .with_detail(json!({ "refusal": refusal }));
                entry.customer_ref = Some(request.customer_ref);
                entry.reason = request.reason;
                self.ctx.audit.record_skip(&entry).await?;

                tracing::info!(
                    subscription_id = subscription_id,
                    refusal = %refusal,
                    "Skip refused"
                );
                return Ok(SkipOutcome::Refused { refusal });
            }
        };

        let job = SyncJob::Skip {
            subscription_id,
            customer_ref: request.customer_ref,
            reason: request.reason,
            next_charge_at,
            requested_at: now,
        };
        self.commit(&original, &sub, &job).await?;

        tracing::info!(
            subscription_id = subscription_id,
            next_charge_at = %calendar::format_wire(next_charge_at),
            "Skip accepted"
        );
        Ok(SkipOutcome::Accepted { next_charge_at })
    }

    pub async fn request_switch(
        &self,
        subscription_id: i64,
        target_product_id: Option<i64>,
        now: PrimitiveDateTime,
    ) -> BillingResult<SwitchOutcome> {
        let original = self.load(subscription_id).await?;
        let engine = self.engine().await?;
        let mut sub = original.clone();

        let (from_product_id, result) = if engine.is_prepaid(&sub, now) {
            // Prepaid subscriptions keep their wrapper product; only the
            // pre-generated orders change
            let orders = self.prepaid_orders(&sub, now).await?;
            let current = engine
                .current_order_product(&sub, &orders, now)
                .unwrap_or(sub.product_id);
            let result = engine
                .check_switch_prepaid(&sub, &orders, now)
                .and_then(|()| engine.resolve_switch_target(current, target_product_id));
            (current, result)
        } else {
            let from = sub.product_id;
            (from, engine.try_switch_product(&mut sub, target_product_id, now))
        };

        let result = match result {
            Ok(target) => match self.ctx.catalog.variant_for_product(target).await? {
                Some(variant) => {
                    if !engine.is_prepaid(&original, now) {
                        sub.variant_id = Some(variant.variant_id);
                        sub.sku = variant.sku;
                        sub.product_title = Some(variant.product_title);
                    }
                    Ok(target)
                }
                None => Err(Refusal::UnknownProduct),
            },
            Err(refusal) => Err(refusal),
        };

        let target = match result {
            Ok(target) => target,
            Err(refusal) => {
                let entry = SwitchAuditEntry::new(
                    sub.customer_id,
                    subscription_id,
                    from_product_id,
                    target_product_id,
                    false,
                    now,
                )
                .with_detail(json!({ "refusal": refusal }));
                self.ctx.audit.record_switch(&entry).await?;

                tracing::info!(
                    subscription_id = subscription_id,
                    refusal = %refusal,
                    "Switch refused"
                );
                return Ok(SwitchOutcome::Refused { refusal });
            }
        };

        let job = SyncJob::Switch {
            subscription_id,
            target_product_id: target,
            previous_product_id: Some(from_product_id),
            requested_at: now,
        };
        self.commit(&original, &sub, &job).await?;

        tracing::info!(
            subscription_id = subscription_id,
            from_product_id = from_product_id,
            to_product_id = target,
            "Switch accepted"
        );
        Ok(SwitchOutcome::Accepted { product_id: target })
    }

    /// Configured `(product, alternate)` pairs whose alternate has no known
    /// variant; default switches from those products are refused
    pub async fn unresolvable_alternates(&self) -> BillingResult<Vec<(i64, i64)>> {
        let mut missing = Vec::new();
        for (product_id, alternate) in self.policy.alternates() {
            if self.ctx.catalog.variant_for_product(alternate).await?.is_none() {
                missing.push((product_id, alternate));
            }
        }
        Ok(missing)
    }

    /// Active subscriptions of a customer that bill this month, with what
    /// each one currently allows
    pub async fn skippable_subscriptions(
        &self,
        customer_id: i64,
        now: PrimitiveDateTime,
    ) -> BillingResult<Vec<SubscriptionEligibility>> {
        let engine = self.engine().await?;
        let mut report = Vec::new();

        for sub in self.ctx.subscriptions.for_customer(customer_id).await? {
            if !sub.is_active() {
                continue;
            }
            let prepaid = engine.is_prepaid(&sub, now);
            let (skip, switch) = if prepaid {
                let orders = self.prepaid_orders(&sub, now).await?;
                if !engine.has_queued_prepaid_order_this_month(&sub, &orders, now) {
                    continue;
                }
                (
                    engine.check_skip_prepaid(&sub, &orders, now),
                    engine.check_switch_prepaid(&sub, &orders, now),
                )
            } else {
                let bills_this_month = sub
                    .next_charge_at
                    .is_some_and(|at| calendar::is_later_this_month(at, now));
                if !bills_this_month {
                    continue;
                }
                (engine.check_skip(&sub, now), engine.check_switch(&sub, now))
            };

            report.push(SubscriptionEligibility {
                subscription_id: sub.subscription_id,
                product_id: sub.product_id,
                next_charge_at: sub.next_charge_at,
                prepaid,
                skip_refusal: skip.err(),
                switch_refusal: switch.err(),
            });
        }
        Ok(report)
    }

    /// Replace the replica row from a remote subscription object
    pub async fn sync_down(&self, remote: &Value) -> BillingResult<SubscriptionSnapshot> {
        let mut sub = mapping::from_remote(remote)?;
        // The prepaid flag is local metadata the ledger's subscription object lacks
        if let Some(existing) = self.ctx.subscriptions.get(sub.subscription_id).await? {
            sub.is_prepaid = existing.is_prepaid;
        }
        self.ctx.subscriptions.save(&sub).await?;

        tracing::debug!(subscription_id = sub.subscription_id, "Synced subscription from ledger");
        Ok(sub)
    }

    /// Refresh the cached copy of a remote order
    pub async fn sync_down_order(&self, remote: &Value) -> BillingResult<QueuedOrder> {
        let order = order_from_remote(remote)?;
        self.ctx.orders.upsert(&order).await?;
        Ok(order)
    }

    /// Apply the recognised keys of an incoming partial update locally
    pub async fn apply_partial_update(
        &self,
        subscription_id: i64,
        update: &Value,
    ) -> BillingResult<PartialUpdate> {
        let object = update.as_object().ok_or(MappingError::NotAnObject)?;
        let mut sub = self.load(subscription_id).await?;
        let applied = mapping::apply_partial(&mut sub, object)?;
        if !applied.is_empty() {
            self.ctx.subscriptions.save(&sub).await?;
        }

        tracing::debug!(
            subscription_id = subscription_id,
            applied = ?applied,
            "Applied partial subscription update"
        );
        Ok(PartialUpdate {
            applied,
            subscription: mapping::to_remote(&sub),
        })
    }
}
