//! Local replica of remote subscriptions

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::PrimitiveDateTime;
use tokio::sync::RwLock;

use crate::error::BillingResult;
use crate::models::{LineItemProperty, SubscriptionSnapshot, SubscriptionStatus};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, subscription_id: i64) -> BillingResult<Option<SubscriptionSnapshot>>;

    /// Insert or fully replace the replica row
    async fn save(&self, sub: &SubscriptionSnapshot) -> BillingResult<()>;

    async fn for_customer(&self, customer_id: i64) -> BillingResult<Vec<SubscriptionSnapshot>>;
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    subscription_id: i64,
    address_id: Option<i64>,
    customer_id: i64,
    created_at: Option<PrimitiveDateTime>,
    updated_at: Option<PrimitiveDateTime>,
    next_charge_scheduled_at: Option<PrimitiveDateTime>,
    cancelled_at: Option<PrimitiveDateTime>,
    product_title: Option<String>,
    price: Option<String>,
    quantity: Option<i32>,
    status: String,
    shopify_product_id: i64,
    shopify_variant_id: Option<i64>,
    sku: Option<String>,
    order_interval_unit: Option<String>,
    order_interval_frequency: Option<String>,
    order_day_of_month: Option<String>,
    order_day_of_week: Option<String>,
    is_prepaid: bool,
    raw_line_item_properties: sqlx::types::Json<Vec<LineItemProperty>>,
}

impl From<SubscriptionRow> for SubscriptionSnapshot {
    fn from(row: SubscriptionRow) -> Self {
        SubscriptionSnapshot {
            subscription_id: row.subscription_id,
            address_id: row.address_id,
            customer_id: row.customer_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_charge_at: row.next_charge_scheduled_at,
            cancelled_at: row.cancelled_at,
            product_title: row.product_title,
            price: row.price,
            quantity: row.quantity,
            status: SubscriptionStatus::from(row.status),
            product_id: row.shopify_product_id,
            variant_id: row.shopify_variant_id,
            sku: row.sku,
            order_interval_unit: row.order_interval_unit,
            order_interval_frequency: row.order_interval_frequency,
            order_day_of_month: row.order_day_of_month,
            order_day_of_week: row.order_day_of_week,
            is_prepaid: row.is_prepaid,
            line_item_properties: row.raw_line_item_properties.0,
        }
    }
}

const SELECT_SUBSCRIPTION: &str = r#"
    SELECT subscription_id, address_id, customer_id, created_at, updated_at,
           next_charge_scheduled_at, cancelled_at, product_title, price, quantity,
           status, shopify_product_id, shopify_variant_id, sku,
           order_interval_unit, order_interval_frequency, order_day_of_month,
           order_day_of_week, is_prepaid, raw_line_item_properties
    FROM subscriptions
"#;

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, subscription_id: i64) -> BillingResult<Option<SubscriptionSnapshot>> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as(&format!("{SELECT_SUBSCRIPTION} WHERE subscription_id = $1"))
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(SubscriptionSnapshot::from))
    }

    async fn save(&self, sub: &SubscriptionSnapshot) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                subscription_id, address_id, customer_id, created_at, updated_at,
                next_charge_scheduled_at, cancelled_at, product_title, price, quantity,
                status, shopify_product_id, shopify_variant_id, sku,
                order_interval_unit, order_interval_frequency, order_day_of_month,
                order_day_of_week, is_prepaid, raw_line_item_properties
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (subscription_id) DO UPDATE SET
                address_id = EXCLUDED.address_id,
                customer_id = EXCLUDED.customer_id,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                next_charge_scheduled_at = EXCLUDED.next_charge_scheduled_at,
                cancelled_at = EXCLUDED.cancelled_at,
                product_title = EXCLUDED.product_title,
                price = EXCLUDED.price,
                quantity = EXCLUDED.quantity,
                status = EXCLUDED.status,
                shopify_product_id = EXCLUDED.shopify_product_id,
                shopify_variant_id = EXCLUDED.shopify_variant_id,
                sku = EXCLUDED.sku,
                order_interval_unit = EXCLUDED.order_interval_unit,
                order_interval_frequency = EXCLUDED.order_interval_frequency,
                order_day_of_month = EXCLUDED.order_day_of_month,
                order_day_of_week = EXCLUDED.order_day_of_week,
                is_prepaid = EXCLUDED.is_prepaid,
                raw_line_item_properties = EXCLUDED.raw_line_item_properties
            "#,
        )
        .bind(sub.subscription_id)
        .bind(sub.address_id)
        .bind(sub.customer_id)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .bind(sub.next_charge_at)
        .bind(sub.cancelled_at)
        .bind(&sub.product_title)
        .bind(&sub.price)
        .bind(sub.quantity)
        .bind(sub.status.as_str())
        .bind(sub.product_id)
        .bind(sub.variant_id)
        .bind(&sub.sku)
        .bind(&sub.order_interval_unit)
        .bind(&sub.order_interval_frequency)
        .bind(&sub.order_day_of_month)
        .bind(&sub.order_day_of_week)
        .bind(sub.is_prepaid)
        .bind(sqlx::types::Json(&sub.line_item_properties))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn for_customer(&self, customer_id: i64) -> BillingResult<Vec<SubscriptionSnapshot>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "{SELECT_SUBSCRIPTION} WHERE customer_id = $1 ORDER BY subscription_id"
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SubscriptionSnapshot::from).collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: Arc<RwLock<BTreeMap<i64, SubscriptionSnapshot>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, subscription_id: i64) -> BillingResult<Option<SubscriptionSnapshot>> {
        Ok(self.subscriptions.read().await.get(&subscription_id).cloned())
    }

    async fn save(&self, sub: &SubscriptionSnapshot) -> BillingResult<()> {
        self.subscriptions
            .write()
            .await
            .insert(sub.subscription_id, sub.clone());
        Ok(())
    }

    async fn for_customer(&self, customer_id: i64) -> BillingResult<Vec<SubscriptionSnapshot>> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.customer_id == customer_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_replaces_existing_row() {
        let store = InMemorySubscriptionStore::new();
        let mut sub = SubscriptionSnapshot::new(1, 10, 100);
        store.save(&sub).await.unwrap();

        sub.product_id = 200;
        store.save(&sub).await.unwrap();
        store.save(&SubscriptionSnapshot::new(2, 10, 100)).await.unwrap();
        store.save(&SubscriptionSnapshot::new(3, 11, 100)).await.unwrap();

        assert_eq!(store.get(1).await.unwrap().unwrap().product_id, 200);
        assert!(store.get(4).await.unwrap().is_none());
        let ids: Vec<i64> = store
            .for_customer(10)
            .await
            .unwrap()
            .iter()
            .map(|s| s.subscription_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
