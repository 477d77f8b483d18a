//! Time-windowed product classification
//!
//! A product belongs to a named category (current, prepaid, skippable,
//! switchable) only while one of its tag windows covers the instant being
//! evaluated. Windows are maintained by administrative tooling and only read
//! by the eligibility rules.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, PrimitiveDateTime};
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};

/// Closing a window ends it this long before its successor starts
pub const WINDOW_CLOSE_TICK: Duration = Duration::SECOND;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductTag {
    Current,
    Prepaid,
    Skippable,
    Switchable,
}

impl ProductTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductTag::Current => "current",
            ProductTag::Prepaid => "prepaid",
            ProductTag::Skippable => "skippable",
            ProductTag::Switchable => "switchable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "current" => Some(ProductTag::Current),
            "prepaid" => Some(ProductTag::Prepaid),
            "skippable" => Some(ProductTag::Skippable),
            "switchable" => Some(ProductTag::Switchable),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProductTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductTagWindow {
    pub product_id: i64,
    pub tag: ProductTag,
    pub active_start: PrimitiveDateTime,
    /// `None` means the window is still open
    pub active_end: Option<PrimitiveDateTime>,
}

impl ProductTagWindow {
    pub fn open(product_id: i64, tag: ProductTag, active_start: PrimitiveDateTime) -> Self {
        Self {
            product_id,
            tag,
            active_start,
            active_end: None,
        }
    }

    pub fn bounded(
        product_id: i64,
        tag: ProductTag,
        active_start: PrimitiveDateTime,
        active_end: PrimitiveDateTime,
    ) -> Self {
        Self {
            product_id,
            tag,
            active_start,
            active_end: Some(active_end),
        }
    }

    pub fn is_open(&self) -> bool {
        self.active_end.is_none()
    }

    /// `active_start <= at < active_end`, open windows never end
    pub fn covers(&self, at: PrimitiveDateTime) -> bool {
        self.active_start <= at && self.active_end.map_or(true, |end| at < end)
    }
}

/// Window collection that keeps at most one open window per product and tag
#[derive(Debug, Clone, Default)]
pub struct TagWindowSet {
    windows: Vec<ProductTagWindow>,
}

impl TagWindowSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a window, closing the open window for the same product and tag
    /// one tick before the new one starts.
    pub fn insert(&mut self, window: ProductTagWindow) -> BillingResult<()> {
        if let Some(open) = self.windows.iter_mut().find(|w| {
            w.product_id == window.product_id && w.tag == window.tag && w.is_open()
        }) {
            if open.active_start >= window.active_start {
                return Err(BillingError::InvalidTagWindow(format!(
                    "product {} already has an open '{}' window starting at {}",
                    window.product_id, window.tag, open.active_start
                )));
            }
            open.active_end = Some(window.active_start - WINDOW_CLOSE_TICK);
        }
        self.windows.push(window);
        Ok(())
    }

    pub fn windows(&self) -> &[ProductTagWindow] {
        &self.windows
    }

    pub fn into_classifier(self) -> ProductClassifier {
        ProductClassifier::new(self.windows)
    }
}

/// Resolves which tags a product carries at a point in time. Pure reads only.
#[derive(Debug, Clone, Default)]
pub struct ProductClassifier {
    windows: Vec<ProductTagWindow>,
}

impl ProductClassifier {
    pub fn new(windows: Vec<ProductTagWindow>) -> Self {
        Self { windows }
    }

    /// The window in force for each tag. Overlapping windows for one tag are
    /// a data anomaly; the one with the latest `active_start` wins.
    pub fn active_windows(
        &self,
        product_id: i64,
        at: PrimitiveDateTime,
    ) -> BTreeMap<ProductTag, &ProductTagWindow> {
        let mut active: BTreeMap<ProductTag, &ProductTagWindow> = BTreeMap::new();
        for window in self
            .windows
            .iter()
            .filter(|w| w.product_id == product_id && w.covers(at))
        {
            match active.get(&window.tag) {
                Some(existing) if existing.active_start >= window.active_start => {}
                _ => {
                    active.insert(window.tag, window);
                }
            }
        }
        active
    }

    pub fn active_tags(&self, product_id: i64, at: PrimitiveDateTime) -> BTreeSet<ProductTag> {
        self.active_windows(product_id, at).into_keys().collect()
    }

    pub fn has_tag(&self, product_id: i64, tag: ProductTag, at: PrimitiveDateTime) -> bool {
        self.windows
            .iter()
            .any(|w| w.product_id == product_id && w.tag == tag && w.covers(at))
    }

    pub fn has_all(&self, product_id: i64, tags: &[ProductTag], at: PrimitiveDateTime) -> bool {
        tags.iter().all(|tag| self.has_tag(product_id, *tag, at))
    }

    pub fn products_with_tag(&self, tag: ProductTag, at: PrimitiveDateTime) -> BTreeSet<i64> {
        self.windows
            .iter()
            .filter(|w| w.tag == tag && w.covers(at))
            .map(|w| w.product_id)
            .collect()
    }
}

/// Source of tag windows
#[async_trait]
pub trait ProductTagStore: Send + Sync {
    async fn load_windows(&self) -> BillingResult<Vec<ProductTagWindow>>;

    /// Administrative write: start a new window, closing the open one
    async fn assign(&self, window: ProductTagWindow) -> BillingResult<()>;

    async fn classifier(&self) -> BillingResult<ProductClassifier> {
        Ok(ProductClassifier::new(self.load_windows().await?))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductTagRow {
    product_id: i64,
    tag: String,
    active_start: PrimitiveDateTime,
    active_end: Option<PrimitiveDateTime>,
}

pub struct PgProductTagStore {
    pool: PgPool,
}

impl PgProductTagStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductTagStore for PgProductTagStore {
    async fn load_windows(&self) -> BillingResult<Vec<ProductTagWindow>> {
        let rows: Vec<ProductTagRow> = sqlx::query_as(
            r#"
            SELECT product_id, tag, active_start, active_end
            FROM product_tags
            ORDER BY product_id, tag, active_start
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match ProductTag::parse(&row.tag) {
                Some(tag) => Some(ProductTagWindow {
                    product_id: row.product_id,
                    tag,
                    active_start: row.active_start,
                    active_end: row.active_end,
                }),
                None => {
                    tracing::warn!(
                        product_id = row.product_id,
                        tag = %row.tag,
                        "Ignoring product tag with unknown name"
                    );
                    None
                }
            })
            .collect())
    }

    async fn assign(&self, window: ProductTagWindow) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let blocking: Option<PrimitiveDateTime> = sqlx::query_scalar(
            r#"
            SELECT active_start FROM product_tags
            WHERE product_id = $1 AND tag = $2 AND active_end IS NULL
              AND active_start >= $3
            FOR UPDATE
            "#,
        )
        .bind(window.product_id)
        .bind(window.tag.as_str())
        .bind(window.active_start)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(open_start) = blocking {
            return Err(BillingError::InvalidTagWindow(format!(
                "product {} already has an open '{}' window starting at {}",
                window.product_id, window.tag, open_start
            )));
        }

        sqlx::query(
            r#"
            UPDATE product_tags
            SET active_end = $3
            WHERE product_id = $1 AND tag = $2 AND active_end IS NULL
            "#,
        )
        .bind(window.product_id)
        .bind(window.tag.as_str())
        .bind(window.active_start - WINDOW_CLOSE_TICK)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO product_tags (product_id, tag, active_start, active_end)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(window.product_id)
        .bind(window.tag.as_str())
        .bind(window.active_start)
        .bind(window.active_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            product_id = window.product_id,
            tag = %window.tag,
            active_start = %window.active_start,
            "Assigned product tag window"
        );
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryProductTagStore {
    windows: Arc<RwLock<TagWindowSet>>,
}

impl InMemoryProductTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_windows(windows: Vec<ProductTagWindow>) -> Self {
        Self {
            windows: Arc::new(RwLock::new(TagWindowSet { windows })),
        }
    }
}

#[async_trait]
impl ProductTagStore for InMemoryProductTagStore {
    async fn load_windows(&self) -> BillingResult<Vec<ProductTagWindow>> {
        Ok(self.windows.read().await.windows().to_vec())
    }

    async fn assign(&self, window: ProductTagWindow) -> BillingResult<()> {
        self.windows.write().await.insert(window)
    }
}
