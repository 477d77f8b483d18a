//! Append-only audit trail of skip and switch attempts
//!
//! One row per attempt, successful or not. Rows are never updated or
//! deleted; redelivered jobs append again.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use time::PrimitiveDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SkipAuditEntry {
    pub id: Uuid,
    pub customer_id: i64,
    /// Storefront customer reference supplied with the request
    pub customer_ref: Option<String>,
    pub subscription_id: i64,
    pub charge_id: Option<i64>,
    /// Absent when the attempt was refused before a target date existed
    pub skipped_to: Option<PrimitiveDateTime>,
    pub skip_status: bool,
    pub reason: Option<String>,
    /// Per-call outcomes or the refusal that stopped the attempt
    pub detail: Option<sqlx::types::Json<Value>>,
    pub created_at: PrimitiveDateTime,
}

impl SkipAuditEntry {
    pub fn new(
        customer_id: i64,
        subscription_id: i64,
        skip_status: bool,
        created_at: PrimitiveDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            customer_ref: None,
            subscription_id,
            charge_id: None,
            skipped_to: None,
            skip_status,
            reason: None,
            detail: None,
            created_at,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(sqlx::types::Json(detail));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SwitchAuditEntry {
    pub id: Uuid,
    pub customer_id: i64,
    pub subscription_id: i64,
    pub from_product_id: i64,
    pub to_product_id: Option<i64>,
    pub switch_status: bool,
    pub detail: Option<sqlx::types::Json<Value>>,
    pub created_at: PrimitiveDateTime,
}

impl SwitchAuditEntry {
    pub fn new(
        customer_id: i64,
        subscription_id: i64,
        from_product_id: i64,
        to_product_id: Option<i64>,
        switch_status: bool,
        created_at: PrimitiveDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id,
            subscription_id,
            from_product_id,
            to_product_id,
            switch_status,
            detail: None,
            created_at,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(sqlx::types::Json(detail));
        self
    }
}

#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn record_skip(&self, entry: &SkipAuditEntry) -> BillingResult<()>;

    async fn record_switch(&self, entry: &SwitchAuditEntry) -> BillingResult<()>;

    /// Oldest first
    async fn skips_for_subscription(&self, subscription_id: i64) -> BillingResult<Vec<SkipAuditEntry>>;

    async fn skips_for_customer(&self, customer_id: i64) -> BillingResult<Vec<SkipAuditEntry>>;

    async fn switches_for_subscription(
        &self,
        subscription_id: i64,
    ) -> BillingResult<Vec<SwitchAuditEntry>>;

    async fn switches_for_customer(&self, customer_id: i64) -> BillingResult<Vec<SwitchAuditEntry>>;
}

pub struct PgAuditTrail {
    pool: PgPool,
}

impl PgAuditTrail {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn skips_where(&self, column: &str, id: i64) -> BillingResult<Vec<SkipAuditEntry>> {
        let entries = sqlx::query_as::<_, SkipAuditEntry>(&format!(
            r#"
            SELECT id, customer_id, customer_ref, subscription_id, charge_id, skipped_to,
                   skip_status, reason, detail, created_at
            FROM skip_audit
            WHERE {column} = $1
            ORDER BY created_at, id
            "#
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn switches_where(&self, column: &str, id: i64) -> BillingResult<Vec<SwitchAuditEntry>> {
        let entries = sqlx::query_as::<_, SwitchAuditEntry>(&format!(
            r#"
            SELECT id, customer_id, subscription_id, from_product_id, to_product_id,
                   switch_status, detail, created_at
            FROM switch_audit
            WHERE {column} = $1
            ORDER BY created_at, id
            "#
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[async_trait]
impl AuditTrail for PgAuditTrail {
    async fn record_skip(&self, entry: &SkipAuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO skip_audit (
                id, customer_id, customer_ref, subscription_id, charge_id,
                skipped_to, skip_status, reason, detail, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.customer_id)
        .bind(&entry.customer_ref)
        .bind(entry.subscription_id)
        .bind(entry.charge_id)
        .bind(entry.skipped_to)
        .bind(entry.skip_status)
        .bind(&entry.reason)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            audit_id = %entry.id,
            subscription_id = entry.subscription_id,
            skip_status = entry.skip_status,
            "Recorded skip attempt"
        );
        Ok(())
    }

    async fn record_switch(&self, entry: &SwitchAuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO switch_audit (
                id, customer_id, subscription_id, from_product_id, to_product_id,
                switch_status, detail, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.customer_id)
        .bind(entry.subscription_id)
        .bind(entry.from_product_id)
        .bind(entry.to_product_id)
        .bind(entry.switch_status)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            audit_id = %entry.id,
            subscription_id = entry.subscription_id,
            switch_status = entry.switch_status,
            "Recorded switch attempt"
        );
        Ok(())
    }

    async fn skips_for_subscription(&self, subscription_id: i64) -> BillingResult<Vec<SkipAuditEntry>> {
        self.skips_where("subscription_id", subscription_id).await
    }

    async fn skips_for_customer(&self, customer_id: i64) -> BillingResult<Vec<SkipAuditEntry>> {
        self.skips_where("customer_id", customer_id).await
    }

    async fn switches_for_subscription(
        &self,
        subscription_id: i64,
    ) -> BillingResult<Vec<SwitchAuditEntry>> {
        self.switches_where("subscription_id", subscription_id).await
    }

    async fn switches_for_customer(&self, customer_id: i64) -> BillingResult<Vec<SwitchAuditEntry>> {
        self.switches_where("customer_id", customer_id).await
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAuditTrail {
    skips: Arc<RwLock<Vec<SkipAuditEntry>>>,
    switches: Arc<RwLock<Vec<SwitchAuditEntry>>>,
}

impl InMemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditTrail for InMemoryAuditTrail {
    async fn record_skip(&self, entry: &SkipAuditEntry) -> BillingResult<()> {
        self.skips.write().await.push(entry.clone());
        Ok(())
    }

    async fn record_switch(&self, entry: &SwitchAuditEntry) -> BillingResult<()> {
        self.switches.write().await.push(entry.clone());
        Ok(())
    }

    async fn skips_for_subscription(&self, subscription_id: i64) -> BillingResult<Vec<SkipAuditEntry>> {
        Ok(self
            .skips
            .read()
            .await
            .iter()
            .filter(|e| e.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn skips_for_customer(&self, customer_id: i64) -> BillingResult<Vec<SkipAuditEntry>> {
        Ok(self
            .skips
            .read()
            .await
            .iter()
            .filter(|e| e.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn switches_for_subscription(
        &self,
        subscription_id: i64,
    ) -> BillingResult<Vec<SwitchAuditEntry>> {
        Ok(self
            .switches
            .read()
            .await
            .iter()
            .filter(|e| e.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn switches_for_customer(&self, customer_id: i64) -> BillingResult<Vec<SwitchAuditEntry>> {
        Ok(self
            .switches
            .read()
            .await
            .iter()
            .filter(|e| e.customer_id == customer_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[tokio::test]
    async fn test_entries_queryable_by_subscription_and_customer() {
        let audit = InMemoryAuditTrail::new();
        let at = datetime!(2018-01-03 9:00);

        audit
            .record_skip(&SkipAuditEntry::new(10, 1, true, at))
            .await
            .unwrap();
        audit
            .record_skip(&SkipAuditEntry::new(10, 2, false, at).with_detail(json!({"refusal": "not_active"})))
            .await
            .unwrap();
        audit
            .record_switch(&SwitchAuditEntry::new(11, 3, 100, Some(200), true, at))
            .await
            .unwrap();

        assert_eq!(audit.skips_for_customer(10).await.unwrap().len(), 2);
        let failed = audit.skips_for_subscription(2).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(!failed[0].skip_status);
        assert_eq!(failed[0].detail.as_ref().unwrap().0["refusal"], "not_active");
        assert_eq!(audit.switches_for_customer(11).await.unwrap().len(), 1);
        assert!(audit.switches_for_subscription(1).await.unwrap().is_empty());
    }
}
