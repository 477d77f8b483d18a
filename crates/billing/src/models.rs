//! Local replica records

use serde::{Deserialize, Deserializer, Serialize};
use time::PrimitiveDateTime;

/// Name of the order line-item property carrying the shipped product
pub const PRODUCT_ID_PROPERTY: &str = "product_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
    Other(String),
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Expired => "EXPIRED",
            SubscriptionStatus::Other(s) => s,
        }
    }
}

impl From<String> for SubscriptionStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => SubscriptionStatus::Active,
            "CANCELLED" => SubscriptionStatus::Cancelled,
            "EXPIRED" => SubscriptionStatus::Expired,
            _ => SubscriptionStatus::Other(s),
        }
    }
}

impl From<SubscriptionStatus> for String {
    fn from(status: SubscriptionStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemProperty {
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub value: String,
}

impl LineItemProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Local copy of a remote subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub subscription_id: i64,
    pub address_id: Option<i64>,
    pub customer_id: i64,
    pub created_at: Option<PrimitiveDateTime>,
    pub updated_at: Option<PrimitiveDateTime>,
    /// Authoritative next billing instant, as last seen remotely or advanced by a skip
    pub next_charge_at: Option<PrimitiveDateTime>,
    pub cancelled_at: Option<PrimitiveDateTime>,
    pub product_title: Option<String>,
    pub price: Option<String>,
    pub quantity: Option<i32>,
    pub status: SubscriptionStatus,
    pub product_id: i64,
    pub variant_id: Option<i64>,
    pub sku: Option<String>,
    pub order_interval_unit: Option<String>,
    pub order_interval_frequency: Option<String>,
    pub order_day_of_month: Option<String>,
    pub order_day_of_week: Option<String>,
    pub is_prepaid: bool,
    pub line_item_properties: Vec<LineItemProperty>,
}

impl SubscriptionSnapshot {
    /// Minimal snapshot; remaining fields are filled by sync-down
    pub fn new(subscription_id: i64, customer_id: i64, product_id: i64) -> Self {
        Self {
            subscription_id,
            address_id: None,
            customer_id,
            created_at: None,
            updated_at: None,
            next_charge_at: None,
            cancelled_at: None,
            product_title: None,
            price: None,
            quantity: None,
            status: SubscriptionStatus::Active,
            product_id,
            variant_id: None,
            sku: None,
            order_interval_unit: None,
            order_interval_frequency: None,
            order_day_of_month: None,
            order_day_of_week: None,
            is_prepaid: false,
            line_item_properties: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.line_item_properties
            .iter()
            .rev()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    Queued,
    Success,
    Error,
    Cancelled,
    Other(String),
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Queued => "QUEUED",
            OrderStatus::Success => "SUCCESS",
            OrderStatus::Error => "ERROR",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Other(s) => s,
        }
    }
}

impl From<String> for OrderStatus {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => OrderStatus::Queued,
            "SUCCESS" => OrderStatus::Success,
            "ERROR" => OrderStatus::Error,
            "CANCELLED" => OrderStatus::Cancelled,
            _ => OrderStatus::Other(s),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineItem {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub subscription_id: i64,
    #[serde(default)]
    pub properties: Vec<LineItemProperty>,
}

/// A pre-generated order as cached locally (read-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOrder {
    pub order_id: i64,
    pub scheduled_at: PrimitiveDateTime,
    pub status: OrderStatus,
    pub is_prepaid: bool,
    pub line_items: Vec<OrderLineItem>,
}

impl QueuedOrder {
    pub fn contains_subscription(&self, subscription_id: i64) -> bool {
        self.line_items
            .iter()
            .any(|item| item.subscription_id == subscription_id)
    }

    /// Product shipped by this order for the given subscription.
    ///
    /// Read from the `product_id` line-item property; a later property
    /// overrides an earlier one.
    pub fn product_id_for(&self, subscription_id: i64) -> Option<i64> {
        self.line_items
            .iter()
            .filter(|item| item.subscription_id == subscription_id)
            .flat_map(|item| item.properties.iter())
            .filter(|prop| prop.name == PRODUCT_ID_PROPERTY)
            .last()
            .and_then(|prop| prop.value.trim().parse().ok())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Option::<StringOrNumber>::deserialize(d)? {
        Some(StringOrNumber::Str(s)) => s,
        Some(StringOrNumber::Int(i)) => i.to_string(),
        Some(StringOrNumber::Float(f)) => f.to_string(),
        Some(StringOrNumber::Bool(b)) => b.to_string(),
        None => String::new(),
    })
}

fn id_from_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match StringOrNumber::deserialize(d)? {
        StringOrNumber::Int(i) => Ok(i),
        StringOrNumber::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
        _ => Err(serde::de::Error::custom("expected an integer identifier")),
    }
}
