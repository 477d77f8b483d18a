//! Read access to the local cache of pre-generated orders

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use time::PrimitiveDateTime;
use tokio::sync::RwLock;

use crate::calendar;
use crate::error::BillingResult;
use crate::mapping::MappingError;
use crate::models::{OrderLineItem, OrderStatus, QueuedOrder};

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// QUEUED orders containing the subscription, scheduled within the month of `now`
    async fn queued_orders_for_subscription_this_month(
        &self,
        subscription_id: i64,
        is_prepaid: bool,
        now: PrimitiveDateTime,
    ) -> BillingResult<Vec<QueuedOrder>>;

    /// Refresh the cached copy of a remote order
    async fn upsert(&self, order: &QueuedOrder) -> BillingResult<()>;
}

/// Parse a remote order object.
///
/// Remote orders carry ids as strings or numbers and flag prepaid orders
/// with `0`/`1` or a boolean.
pub fn order_from_remote(remote: &Value) -> Result<QueuedOrder, MappingError> {
    let object = remote.as_object().ok_or(MappingError::NotAnObject)?;

    let order_id = match object.get("id") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or(MappingError::MissingField("id"))?;

    let scheduled_at = object
        .get("scheduled_at")
        .and_then(Value::as_str)
        .ok_or(MappingError::MissingField("scheduled_at"))?;
    let scheduled_at =
        calendar::parse_wire(scheduled_at).map_err(|e| MappingError::InvalidField {
            field: "scheduled_at",
            reason: e.to_string(),
        })?;

    let status = object
        .get("status")
        .and_then(Value::as_str)
        .map(|s| OrderStatus::from(s.to_string()))
        .ok_or(MappingError::MissingField("status"))?;

    let is_prepaid = match object.get("is_prepaid") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    };

    let line_items: Vec<OrderLineItem> = match object.get("line_items") {
        Some(items @ Value::Array(_)) => {
            serde_json::from_value(items.clone()).map_err(|e| MappingError::InvalidField {
                field: "line_items",
                reason: e.to_string(),
            })?
        }
        _ => Vec::new(),
    };

    Ok(QueuedOrder {
        order_id,
        scheduled_at,
        status,
        is_prepaid,
        line_items,
    })
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    order_id: i64,
    scheduled_at: PrimitiveDateTime,
    status: String,
    is_prepaid: bool,
    line_items: sqlx::types::Json<Vec<OrderLineItem>>,
}

impl From<OrderRow> for QueuedOrder {
    fn from(row: OrderRow) -> Self {
        QueuedOrder {
            order_id: row.order_id,
            scheduled_at: row.scheduled_at,
            status: OrderStatus::from(row.status),
            is_prepaid: row.is_prepaid,
            line_items: row.line_items.0,
        }
    }
}

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn queued_orders_for_subscription_this_month(
        &self,
        subscription_id: i64,
        is_prepaid: bool,
        now: PrimitiveDateTime,
    ) -> BillingResult<Vec<QueuedOrder>> {
        // Remote payloads have carried the id both as a number and as a string
        let numeric = serde_json::json!([{ "subscription_id": subscription_id }]);
        let textual = serde_json::json!([{ "subscription_id": subscription_id.to_string() }]);

        let rows: Vec<OrderRow> = sqlx::query_as(
            r#"
            SELECT order_id, scheduled_at, status, is_prepaid, line_items
            FROM orders
            WHERE status = 'QUEUED'
              AND is_prepaid = $1
              AND scheduled_at >= $2 AND scheduled_at <= $3
              AND (line_items @> $4 OR line_items @> $5)
            ORDER BY scheduled_at
            "#,
        )
        .bind(is_prepaid)
        .bind(calendar::start_of_month(now))
        .bind(calendar::end_of_month(now))
        .bind(numeric)
        .bind(textual)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(QueuedOrder::from).collect())
    }

    async fn upsert(&self, order: &QueuedOrder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (order_id, scheduled_at, status, is_prepaid, line_items)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_id) DO UPDATE SET
                scheduled_at = EXCLUDED.scheduled_at,
                status = EXCLUDED.status,
                is_prepaid = EXCLUDED.is_prepaid,
                line_items = EXCLUDED.line_items
            "#,
        )
        .bind(order.order_id)
        .bind(order.scheduled_at)
        .bind(order.status.as_str())
        .bind(order.is_prepaid)
        .bind(sqlx::types::Json(&order.line_items))
        .execute(&self.pool)
        .await?;

        tracing::debug!(order_id = order.order_id, "Cached remote order");
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryOrderRepository {
    orders: Arc<RwLock<BTreeMap<i64, QueuedOrder>>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn queued_orders_for_subscription_this_month(
        &self,
        subscription_id: i64,
        is_prepaid: bool,
        now: PrimitiveDateTime,
    ) -> BillingResult<Vec<QueuedOrder>> {
        let orders = self.orders.read().await;
        let mut matching: Vec<QueuedOrder> = orders
            .values()
            .filter(|order| {
                order.status == OrderStatus::Queued
                    && order.is_prepaid == is_prepaid
                    && order.contains_subscription(subscription_id)
                    && calendar::is_within_month(order.scheduled_at, now)
            })
            .cloned()
            .collect();
        matching.sort_by_key(|order| order.scheduled_at);
        Ok(matching)
    }

    async fn upsert(&self, order: &QueuedOrder) -> BillingResult<()> {
        self.orders
            .write()
            .await
            .insert(order.order_id, order.clone());
        Ok(())
    }
}
