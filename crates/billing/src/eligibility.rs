//! Skip and switch eligibility rules
//!
//! Every decision is evaluated fresh from a subscription snapshot, an explicit
//! `now`, the product classifier and (for prepaid subscriptions) this month's
//! pre-generated orders. Nothing here performs I/O: callers fetch the inputs
//! and persist the outcome.
//!
//! Refusals are ordinary business outcomes and are returned as [`Refusal`]
//! values, never as errors.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use subsync_shared::Config;
use time::PrimitiveDateTime;

use crate::calendar;
use crate::models::{OrderStatus, QueuedOrder, SubscriptionSnapshot};
use crate::tags::{ProductClassifier, ProductTag};

/// Why an action was not allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Refusal {
    /// Prepaid subscriptions must use the prepaid rules
    Prepaid,
    /// Prepaid rules requested for a regular subscription
    NotPrepaid,
    NotActive,
    /// Skips are only accepted during the first days of the month
    SkipWindowClosed,
    ProductNotSkippable,
    ProductNotSwitchable,
    /// No charge scheduled later this month
    NoChargeThisMonth,
    NoQueuedPrepaidOrder,
    /// This month's order no longer ships a current, skippable product
    OrderNotSkippable,
    AlreadySwitchedThisMonth,
    NoAlternateProduct,
    /// Switch target missing from the product catalog
    UnknownProduct,
    /// The advanced charge date is not representable
    ChargeDateOverflow,
}

impl Refusal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Refusal::Prepaid => "prepaid",
            Refusal::NotPrepaid => "not_prepaid",
            Refusal::NotActive => "not_active",
            Refusal::SkipWindowClosed => "skip_window_closed",
            Refusal::ProductNotSkippable => "product_not_skippable",
            Refusal::ProductNotSwitchable => "product_not_switchable",
            Refusal::NoChargeThisMonth => "no_charge_this_month",
            Refusal::NoQueuedPrepaidOrder => "no_queued_prepaid_order",
            Refusal::OrderNotSkippable => "order_not_skippable",
            Refusal::AlreadySwitchedThisMonth => "already_switched_this_month",
            Refusal::NoAlternateProduct => "no_alternate_product",
            Refusal::UnknownProduct => "unknown_product",
            Refusal::ChargeDateOverflow => "charge_date_overflow",
        }
    }
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alternate product offered when a switch names no target
#[derive(Debug, Clone, Default)]
pub struct SwitchPolicy {
    alt_products: HashMap<i64, i64>,
}

impl SwitchPolicy {
    pub fn new(alt_products: HashMap<i64, i64>) -> Self {
        Self { alt_products }
    }

    /// Built from `ALT_PRODUCTS`
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.alt_products.clone())
    }

    pub fn alternate_for(&self, product_id: i64) -> Option<i64> {
        self.alt_products.get(&product_id).copied()
    }

    /// `(product, alternate)` pairs in product order
    pub fn alternates(&self) -> Vec<(i64, i64)> {
        let mut pairs: Vec<(i64, i64)> = self
            .alt_products
            .iter()
            .map(|(product_id, alternate)| (*product_id, *alternate))
            .collect();
        pairs.sort_unstable();
        pairs
    }
}

fn is_this_months_prepaid_order(
    order: &QueuedOrder,
    subscription_id: i64,
    now: PrimitiveDateTime,
) -> bool {
    order.is_prepaid
        && order.status == OrderStatus::Queued
        && order.contains_subscription(subscription_id)
        && calendar::is_within_month(order.scheduled_at, now)
}

/// Queued prepaid order for the subscription still due later in `now`'s month
pub fn is_upcoming_prepaid_order(
    order: &QueuedOrder,
    subscription_id: i64,
    now: PrimitiveDateTime,
) -> bool {
    is_this_months_prepaid_order(order, subscription_id, now) && order.scheduled_at > now
}

/// Flagged prepaid by the ledger, or its product is currently tagged prepaid
pub fn is_prepaid(
    classifier: &ProductClassifier,
    sub: &SubscriptionSnapshot,
    now: PrimitiveDateTime,
) -> bool {
    sub.is_prepaid || classifier.has_tag(sub.product_id, ProductTag::Prepaid, now)
}

pub struct EligibilityEngine {
    classifier: ProductClassifier,
    policy: Arc<SwitchPolicy>,
}

impl EligibilityEngine {
    pub fn new(classifier: ProductClassifier, policy: Arc<SwitchPolicy>) -> Self {
        Self { classifier, policy }
    }

    pub fn classifier(&self) -> &ProductClassifier {
        &self.classifier
    }

    pub fn is_prepaid(&self, sub: &SubscriptionSnapshot, now: PrimitiveDateTime) -> bool {
        is_prepaid(&self.classifier, sub, now)
    }

    fn charges_later_this_month(sub: &SubscriptionSnapshot, now: PrimitiveDateTime) -> bool {
        sub.next_charge_at
            .is_some_and(|at| calendar::is_later_this_month(at, now))
    }

    pub fn check_skip(
        &self,
        sub: &SubscriptionSnapshot,
        now: PrimitiveDateTime,
    ) -> Result<(), Refusal> {
        if self.is_prepaid(sub, now) {
            return Err(Refusal::Prepaid);
        }
        if !sub.is_active() {
            return Err(Refusal::NotActive);
        }
        if !calendar::is_in_skip_window(now) {
            return Err(Refusal::SkipWindowClosed);
        }
        if !self
            .classifier
            .has_tag(sub.product_id, ProductTag::Skippable, now)
        {
            return Err(Refusal::ProductNotSkippable);
        }
        if !Self::charges_later_this_month(sub, now) {
            return Err(Refusal::NoChargeThisMonth);
        }
        Ok(())
    }

    pub fn is_skippable(&self, sub: &SubscriptionSnapshot, now: PrimitiveDateTime) -> bool {
        self.check_skip(sub, now).is_ok()
    }

    pub fn check_switch(
        &self,
        sub: &SubscriptionSnapshot,
        now: PrimitiveDateTime,
    ) -> Result<(), Refusal> {
        if self.is_prepaid(sub, now) {
            return Err(Refusal::Prepaid);
        }
        if !sub.is_active() {
            return Err(Refusal::NotActive);
        }
        if !self
            .classifier
            .has_tag(sub.product_id, ProductTag::Switchable, now)
        {
            return Err(Refusal::ProductNotSwitchable);
        }
        if !Self::charges_later_this_month(sub, now) {
            return Err(Refusal::NoChargeThisMonth);
        }
        Ok(())
    }

    pub fn is_switchable(&self, sub: &SubscriptionSnapshot, now: PrimitiveDateTime) -> bool {
        self.check_switch(sub, now).is_ok()
    }

    /// QUEUED prepaid orders for the subscription scheduled inside this month
    pub fn this_months_prepaid_orders<'o>(
        &self,
        sub: &SubscriptionSnapshot,
        orders: &'o [QueuedOrder],
        now: PrimitiveDateTime,
    ) -> impl Iterator<Item = &'o QueuedOrder> {
        let subscription_id = sub.subscription_id;
        orders
            .iter()
            .filter(move |order| is_this_months_prepaid_order(order, subscription_id, now))
    }

    pub fn has_queued_prepaid_order_this_month(
        &self,
        sub: &SubscriptionSnapshot,
        orders: &[QueuedOrder],
        now: PrimitiveDateTime,
    ) -> bool {
        self.this_months_prepaid_orders(sub, orders, now)
            .any(|order| order.scheduled_at > now)
    }

    fn order_product_has(
        &self,
        sub: &SubscriptionSnapshot,
        order: &QueuedOrder,
        tags: &[ProductTag],
        now: PrimitiveDateTime,
    ) -> bool {
        order
            .product_id_for(sub.subscription_id)
            .is_some_and(|product_id| self.classifier.has_all(product_id, tags, now))
    }

    /// Some order this month still ships a product that is both skippable and current
    pub fn can_skip_and_hasnt_switched(
        &self,
        sub: &SubscriptionSnapshot,
        orders: &[QueuedOrder],
        now: PrimitiveDateTime,
    ) -> bool {
        self.this_months_prepaid_orders(sub, orders, now)
            .any(|order| {
                self.order_product_has(
                    sub,
                    order,
                    &[ProductTag::Skippable, ProductTag::Current],
                    now,
                )
            })
    }

    /// Assumed switched unless some order this month still ships a product
    /// that is both switchable and current.
    pub fn has_switched_this_month(
        &self,
        sub: &SubscriptionSnapshot,
        orders: &[QueuedOrder],
        now: PrimitiveDateTime,
    ) -> bool {
        !self
            .this_months_prepaid_orders(sub, orders, now)
            .any(|order| {
                self.order_product_has(
                    sub,
                    order,
                    &[ProductTag::Switchable, ProductTag::Current],
                    now,
                )
            })
    }

    pub fn check_skip_prepaid(
        &self,
        sub: &SubscriptionSnapshot,
        orders: &[QueuedOrder],
        now: PrimitiveDateTime,
    ) -> Result<(), Refusal> {
        if !self.is_prepaid(sub, now) {
            return Err(Refusal::NotPrepaid);
        }
        if !self.has_queued_prepaid_order_this_month(sub, orders, now) {
            return Err(Refusal::NoQueuedPrepaidOrder);
        }
        if !self.can_skip_and_hasnt_switched(sub, orders, now) {
            return Err(Refusal::OrderNotSkippable);
        }
        if !calendar::is_in_skip_window(now) {
            return Err(Refusal::SkipWindowClosed);
        }
        Ok(())
    }

    pub fn is_skippable_prepaid(
        &self,
        sub: &SubscriptionSnapshot,
        orders: &[QueuedOrder],
        now: PrimitiveDateTime,
    ) -> bool {
        self.check_skip_prepaid(sub, orders, now).is_ok()
    }

    pub fn check_switch_prepaid(
        &self,
        sub: &SubscriptionSnapshot,
        orders: &[QueuedOrder],
        now: PrimitiveDateTime,
    ) -> Result<(), Refusal> {
        if !self.is_prepaid(sub, now) {
            return Err(Refusal::NotPrepaid);
        }
        if !self.has_queued_prepaid_order_this_month(sub, orders, now) {
            return Err(Refusal::NoQueuedPrepaidOrder);
        }
        if self.has_switched_this_month(sub, orders, now) {
            return Err(Refusal::AlreadySwitchedThisMonth);
        }
        Ok(())
    }

    pub fn is_switchable_prepaid(
        &self,
        sub: &SubscriptionSnapshot,
        orders: &[QueuedOrder],
        now: PrimitiveDateTime,
    ) -> bool {
        self.check_switch_prepaid(sub, orders, now).is_ok()
    }

    fn advance_charge(sub: &mut SubscriptionSnapshot) -> Result<PrimitiveDateTime, Refusal> {
        let current = sub.next_charge_at.ok_or(Refusal::NoChargeThisMonth)?;
        let next = calendar::add_one_month(current).ok_or(Refusal::ChargeDateOverflow)?;
        sub.next_charge_at = Some(next);
        Ok(next)
    }

    /// Advance `next_charge_at` by one calendar month if the skip is allowed.
    /// Returns the new charge instant.
    pub fn try_skip(
        &self,
        sub: &mut SubscriptionSnapshot,
        now: PrimitiveDateTime,
    ) -> Result<PrimitiveDateTime, Refusal> {
        self.check_skip(sub, now)?;
        Self::advance_charge(sub)
    }

    pub fn skip(&self, sub: &mut SubscriptionSnapshot, now: PrimitiveDateTime) -> bool {
        self.try_skip(sub, now).is_ok()
    }

    pub fn try_skip_prepaid(
        &self,
        sub: &mut SubscriptionSnapshot,
        orders: &[QueuedOrder],
        now: PrimitiveDateTime,
    ) -> Result<PrimitiveDateTime, Refusal> {
        self.check_skip_prepaid(sub, orders, now)?;
        Self::advance_charge(sub)
    }

    /// Explicit target, else the configured alternate for the current product
    pub fn resolve_switch_target(
        &self,
        current_product_id: i64,
        requested: Option<i64>,
    ) -> Result<i64, Refusal> {
        requested
            .or_else(|| self.policy.alternate_for(current_product_id))
            .ok_or(Refusal::NoAlternateProduct)
    }

    /// Product shipped by this month's first queued prepaid order
    pub fn current_order_product(
        &self,
        sub: &SubscriptionSnapshot,
        orders: &[QueuedOrder],
        now: PrimitiveDateTime,
    ) -> Option<i64> {
        orders
            .iter()
            .filter(|order| is_upcoming_prepaid_order(order, sub.subscription_id, now))
            .find_map(|order| order.product_id_for(sub.subscription_id))
    }

    /// Point the subscription at the new product if the switch is allowed.
    /// Returns the product now on the subscription.
    pub fn try_switch_product(
        &self,
        sub: &mut SubscriptionSnapshot,
        new_product_id: Option<i64>,
        now: PrimitiveDateTime,
    ) -> Result<i64, Refusal> {
        self.check_switch(sub, now)?;
        let target = self.resolve_switch_target(sub.product_id, new_product_id)?;
        sub.product_id = target;
        Ok(target)
    }

    pub fn switch_product(
        &self,
        sub: &mut SubscriptionSnapshot,
        new_product_id: Option<i64>,
        now: PrimitiveDateTime,
    ) -> bool {
        self.try_switch_product(sub, new_product_id, now).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LineItemProperty, OrderLineItem, SubscriptionStatus};
    use crate::tags::ProductTagWindow;
    use time::macros::datetime;

    const P1: i64 = 138427301906;
    const ALT: i64 = 138427596818;
    const PREPAID_WRAPPER: i64 = 159581274130;

    fn classifier() -> ProductClassifier {
        let start = datetime!(2018-01-01 0:00);
        ProductClassifier::new(vec![
            ProductTagWindow::open(P1, ProductTag::Current, start),
            ProductTagWindow::open(P1, ProductTag::Skippable, start),
            ProductTagWindow::open(P1, ProductTag::Switchable, start),
            ProductTagWindow::open(ALT, ProductTag::Current, start),
            ProductTagWindow::open(PREPAID_WRAPPER, ProductTag::Prepaid, start),
        ])
    }

    fn engine() -> EligibilityEngine {
        EligibilityEngine::new(
            classifier(),
            Arc::new(SwitchPolicy::new(HashMap::from([(P1, ALT)]))),
        )
    }

    fn s1() -> SubscriptionSnapshot {
        let mut sub = SubscriptionSnapshot::new(1, 100, P1);
        sub.next_charge_at = Some(datetime!(2018-01-20 0:00));
        sub
    }

    fn prepaid_sub() -> SubscriptionSnapshot {
        let mut sub = SubscriptionSnapshot::new(2, 200, PREPAID_WRAPPER);
        sub.next_charge_at = Some(datetime!(2018-03-20 0:00));
        sub
    }

    fn prepaid_order(product_id: i64, scheduled_at: PrimitiveDateTime) -> QueuedOrder {
        QueuedOrder {
            order_id: 500,
            scheduled_at,
            status: OrderStatus::Queued,
            is_prepaid: true,
            line_items: vec![OrderLineItem {
                subscription_id: 2,
                properties: vec![LineItemProperty::new("product_id", product_id.to_string())],
            }],
        }
    }

    #[test]
    fn test_scenario_a_skip_early_in_month() {
        let engine = engine();
        let now = datetime!(2018-01-03 0:00);
        let mut sub = s1();

        assert!(engine.is_skippable(&sub, now));
        assert!(engine.skip(&mut sub, now));
        assert_eq!(sub.next_charge_at, Some(datetime!(2018-02-20 0:00)));

        // Re-evaluating in the same cycle refuses: the charge left the window
        assert!(!engine.is_skippable(&sub, now));
        assert_eq!(engine.check_skip(&sub, now), Err(Refusal::NoChargeThisMonth));
        assert!(!engine.skip(&mut sub, now));
        assert_eq!(sub.next_charge_at, Some(datetime!(2018-02-20 0:00)));
    }

    #[test]
    fn test_scenario_b_day_of_month_gate() {
        let engine = engine();
        let sub = s1();
        assert_eq!(
            engine.check_skip(&sub, datetime!(2018-01-06 0:00)),
            Err(Refusal::SkipWindowClosed)
        );
    }

    #[test]
    fn test_no_skip_from_fifth_day_onwards() {
        let engine = engine();
        for day in 5..=31u8 {
            let now = time::Date::from_calendar_date(2018, time::Month::January, day)
                .unwrap()
                .midnight();
            let mut sub = s1();
            sub.next_charge_at = Some(datetime!(2018-01-31 12:00));
            assert!(!engine.is_skippable(&sub, now), "day {day} must not allow skips");
        }
    }

    #[test]
    fn test_inactive_subscriptions_never_eligible() {
        let engine = engine();
        let now = datetime!(2018-01-03 0:00);
        for status in [
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
            SubscriptionStatus::Other("ONETIME".into()),
        ] {
            let mut sub = s1();
            sub.status = status;
            assert_eq!(engine.check_skip(&sub, now), Err(Refusal::NotActive));
            assert_eq!(engine.check_switch(&sub, now), Err(Refusal::NotActive));
        }
    }

    #[test]
    fn test_skip_requires_skippable_tag_and_charge_this_month() {
        let engine = engine();
        let now = datetime!(2018-01-03 0:00);

        let mut sub = s1();
        sub.product_id = ALT;
        assert_eq!(engine.check_skip(&sub, now), Err(Refusal::ProductNotSkippable));

        let mut sub = s1();
        sub.next_charge_at = None;
        assert_eq!(engine.check_skip(&sub, now), Err(Refusal::NoChargeThisMonth));

        let mut sub = s1();
        sub.next_charge_at = Some(datetime!(2018-01-02 0:00));
        assert_eq!(engine.check_skip(&sub, now), Err(Refusal::NoChargeThisMonth));
    }

    #[test]
    fn test_prepaid_excluded_from_regular_rules() {
        let engine = engine();
        let now = datetime!(2018-01-03 0:00);

        let mut flagged = s1();
        flagged.is_prepaid = true;
        assert_eq!(engine.check_skip(&flagged, now), Err(Refusal::Prepaid));
        assert_eq!(engine.check_switch(&flagged, now), Err(Refusal::Prepaid));

        let tagged = prepaid_sub();
        assert!(engine.is_prepaid(&tagged, now));
        assert_eq!(engine.check_skip(&tagged, now), Err(Refusal::Prepaid));
    }

    #[test]
    fn test_switch_uses_alternate_product() {
        let engine = engine();
        let now = datetime!(2018-01-12 0:00);
        let mut sub = s1();

        // No day-of-month gate on switching
        assert!(engine.is_switchable(&sub, now));
        assert!(engine.switch_product(&mut sub, None, now));
        assert_eq!(sub.product_id, ALT);

        // ALT is not switchable, so a second switch is refused
        assert!(!engine.switch_product(&mut sub, Some(P1), now));
        assert_eq!(sub.product_id, ALT);
    }

    #[test]
    fn test_switch_without_alternate_refused() {
        let engine = EligibilityEngine::new(classifier(), Arc::new(SwitchPolicy::default()));
        let mut sub = s1();
        assert_eq!(
            engine.try_switch_product(&mut sub, None, datetime!(2018-01-03 0:00)),
            Err(Refusal::NoAlternateProduct)
        );
        assert_eq!(sub.product_id, P1);
    }

    #[test]
    fn test_scenario_c_prepaid_order_on_original_product() {
        let engine = engine();
        let now = datetime!(2018-01-03 0:00);
        let sub = prepaid_sub();
        let orders = vec![prepaid_order(P1, datetime!(2018-01-15 0:00))];

        assert!(engine.has_queued_prepaid_order_this_month(&sub, &orders, now));
        assert!(engine.can_skip_and_hasnt_switched(&sub, &orders, now));
        assert!(!engine.has_switched_this_month(&sub, &orders, now));
        assert!(engine.is_skippable_prepaid(&sub, &orders, now));
        assert!(engine.is_switchable_prepaid(&sub, &orders, now));
    }

    #[test]
    fn test_prepaid_order_already_switched() {
        let engine = engine();
        let now = datetime!(2018-01-03 0:00);
        let sub = prepaid_sub();
        // ALT is current but neither skippable nor switchable
        let orders = vec![prepaid_order(ALT, datetime!(2018-01-15 0:00))];

        assert!(!engine.can_skip_and_hasnt_switched(&sub, &orders, now));
        assert!(engine.has_switched_this_month(&sub, &orders, now));
        assert_eq!(
            engine.check_skip_prepaid(&sub, &orders, now),
            Err(Refusal::OrderNotSkippable)
        );
        assert_eq!(
            engine.check_switch_prepaid(&sub, &orders, now),
            Err(Refusal::AlreadySwitchedThisMonth)
        );
    }

    #[test]
    fn test_prepaid_requires_future_queued_order_this_month() {
        let engine = engine();
        let now = datetime!(2018-01-03 0:00);
        let sub = prepaid_sub();

        let past = vec![prepaid_order(P1, datetime!(2018-01-02 0:00))];
        assert_eq!(
            engine.check_skip_prepaid(&sub, &past, now),
            Err(Refusal::NoQueuedPrepaidOrder)
        );

        let next_month = vec![prepaid_order(P1, datetime!(2018-02-15 0:00))];
        assert!(!engine.has_queued_prepaid_order_this_month(&sub, &next_month, now));

        let mut shipped = prepaid_order(P1, datetime!(2018-01-15 0:00));
        shipped.status = OrderStatus::Success;
        assert!(!engine.has_queued_prepaid_order_this_month(&sub, &[shipped], now));

        let mut not_prepaid = prepaid_order(P1, datetime!(2018-01-15 0:00));
        not_prepaid.is_prepaid = false;
        assert!(!engine.has_queued_prepaid_order_this_month(&sub, &[not_prepaid], now));
    }

    #[test]
    fn test_prepaid_skip_day_gate_and_advance() {
        let engine = engine();
        let orders = vec![prepaid_order(P1, datetime!(2018-01-15 0:00))];

        let mut sub = prepaid_sub();
        assert_eq!(
            engine.try_skip_prepaid(&mut sub, &orders, datetime!(2018-01-05 0:00)),
            Err(Refusal::SkipWindowClosed)
        );

        let advanced = engine
            .try_skip_prepaid(&mut sub, &orders, datetime!(2018-01-04 0:00))
            .unwrap();
        assert_eq!(advanced, datetime!(2018-04-20 0:00));
        assert_eq!(sub.next_charge_at, Some(advanced));
    }

    #[test]
    fn test_prepaid_rules_reject_regular_subscription() {
        let engine = engine();
        let orders = vec![prepaid_order(P1, datetime!(2018-01-15 0:00))];
        let now = datetime!(2018-01-03 0:00);
        assert_eq!(
            engine.check_skip_prepaid(&s1(), &orders, now),
            Err(Refusal::NotPrepaid)
        );
        assert_eq!(
            engine.check_switch_prepaid(&s1(), &orders, now),
            Err(Refusal::NotPrepaid)
        );
    }

    #[test]
    fn test_upcoming_order_excludes_earlier_and_non_prepaid_orders() {
        let now = datetime!(2018-01-03 0:00);
        let upcoming = prepaid_order(P1, datetime!(2018-01-15 0:00));
        assert!(is_upcoming_prepaid_order(&upcoming, 2, now));
        assert!(!is_upcoming_prepaid_order(&upcoming, 1, now));

        let overdue = prepaid_order(P1, datetime!(2018-01-02 0:00));
        assert!(!is_upcoming_prepaid_order(&overdue, 2, now));

        let mut not_prepaid = prepaid_order(P1, datetime!(2018-01-15 0:00));
        not_prepaid.is_prepaid = false;
        assert!(!is_upcoming_prepaid_order(&not_prepaid, 2, now));

        // An overdue order never decides the current product
        let orders = vec![
            prepaid_order(ALT, datetime!(2018-01-02 0:00)),
            prepaid_order(P1, datetime!(2018-01-15 0:00)),
        ];
        assert_eq!(engine().current_order_product(&prepaid_sub(), &orders, now), Some(P1));
    }

    #[test]
    fn test_switch_policy_from_config() {
        use std::time::Duration;
        use subsync_shared::{LedgerConfig, LogFormat, WorkerConfig};

        let config = Config {
            database_url: "postgres://localhost/subsync".into(),
            ledger: LedgerConfig {
                base_url: "http://ledger.test".into(),
                access_token: "token".into(),
                timeout: Duration::from_secs(80),
                utc_offset_hours: 0,
            },
            worker: WorkerConfig {
                pool_size: 1,
                poll_interval: Duration::from_millis(10),
                lease: Duration::from_secs(300),
                notification_max_attempts: 5,
                notification_webhook_url: None,
            },
            alt_products: HashMap::from([(P1, ALT), (10, 20)]),
            log_format: LogFormat::Pretty,
        };

        let policy = SwitchPolicy::from_config(&config);
        assert_eq!(policy.alternate_for(P1), Some(ALT));
        assert_eq!(policy.alternate_for(ALT), None);
        assert_eq!(policy.alternates(), vec![(10, 20), (P1, ALT)]);
    }
}
