//! Product identity lookup used when rewriting a subscription or order to a new product

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::BillingResult;

/// Shop variant as mirrored locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProductVariant {
    pub variant_id: i64,
    pub product_id: i64,
    pub sku: Option<String>,
    pub product_title: String,
    pub variant_title: Option<String>,
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Default variant of a product (the lowest variant id)
    async fn variant_for_product(&self, product_id: i64) -> BillingResult<Option<ProductVariant>>;

    async fn upsert(&self, variant: &ProductVariant) -> BillingResult<()>;
}

pub struct PgProductCatalog {
    pool: PgPool,
}

impl PgProductCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductCatalog for PgProductCatalog {
    async fn variant_for_product(&self, product_id: i64) -> BillingResult<Option<ProductVariant>> {
        let variant = sqlx::query_as::<_, ProductVariant>(
            r#"
            SELECT variant_id, product_id, sku, product_title, variant_title
            FROM product_variants
            WHERE product_id = $1
            ORDER BY variant_id
            LIMIT 1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(variant)
    }

    async fn upsert(&self, variant: &ProductVariant) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO product_variants (variant_id, product_id, sku, product_title, variant_title)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (variant_id) DO UPDATE SET
                product_id = EXCLUDED.product_id,
                sku = EXCLUDED.sku,
                product_title = EXCLUDED.product_title,
                variant_title = EXCLUDED.variant_title
            "#,
        )
        .bind(variant.variant_id)
        .bind(variant.product_id)
        .bind(&variant.sku)
        .bind(&variant.product_title)
        .bind(&variant.variant_title)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryProductCatalog {
    variants: Arc<RwLock<BTreeMap<i64, ProductVariant>>>,
}

impl InMemoryProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProductCatalog for InMemoryProductCatalog {
    async fn variant_for_product(&self, product_id: i64) -> BillingResult<Option<ProductVariant>> {
        // Keyed by variant id, so the first match is the lowest
        Ok(self
            .variants
            .read()
            .await
            .values()
            .find(|v| v.product_id == product_id)
            .cloned())
    }

    async fn upsert(&self, variant: &ProductVariant) -> BillingResult<()> {
        self.variants
            .write()
            .await
            .insert(variant.variant_id, variant.clone());
        Ok(())
    }
}
