//! Bidirectional field map between [`SubscriptionSnapshot`] and the remote
//! subscription representation.
//!
//! Each entry pairs a remote key with a local field and the transforms in
//! both directions. The table is the only definition of which remote keys
//! the replica recognises: partial updates are filtered through it.

use serde_json::{Map, Value};
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::calendar;
use crate::models::{LineItemProperty, SubscriptionSnapshot, SubscriptionStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

type Inbound = fn(&mut SubscriptionSnapshot, &Value) -> Result<(), MappingError>;
type Outbound = fn(&SubscriptionSnapshot) -> Value;

/// One entry of the field map
pub struct FieldMapping {
    pub remote_key: &'static str,
    pub local_key: &'static str,
    /// Identity fields are set on sync-down only, never by a partial update
    pub writable: bool,
    inbound: Inbound,
    outbound: Outbound,
}

impl FieldMapping {
    pub fn apply_inbound(
        &self,
        sub: &mut SubscriptionSnapshot,
        value: &Value,
    ) -> Result<(), MappingError> {
        (self.inbound)(sub, value)
    }

    pub fn outbound(&self, sub: &SubscriptionSnapshot) -> Value {
        (self.outbound)(sub)
    }
}

impl std::fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldMapping")
            .field("remote_key", &self.remote_key)
            .field("local_key", &self.local_key)
            .field("writable", &self.writable)
            .finish()
    }
}

macro_rules! field {
    ($remote:literal => $local:literal, $writable:expr, $inbound:expr, $outbound:expr) => {
        FieldMapping {
            remote_key: $remote,
            local_key: $local,
            writable: $writable,
            inbound: $inbound,
            outbound: $outbound,
        }
    };
}

pub static SUBSCRIPTION_FIELDS: &[FieldMapping] = &[
    field!("id" => "subscription_id", false,
        |s, v| { s.subscription_id = required_id("id", v)?; Ok(()) },
        |s| Value::from(s.subscription_id)),
    field!("address_id" => "address_id", true,
        |s, v| { s.address_id = optional_id("address_id", v)?; Ok(()) },
        |s| s.address_id.map_or(Value::Null, Value::from)),
    field!("customer_id" => "customer_id", false,
        |s, v| { s.customer_id = required_id("customer_id", v)?; Ok(()) },
        |s| Value::from(s.customer_id)),
    field!("created_at" => "created_at", true,
        |s, v| { s.created_at = optional_time("created_at", v)?; Ok(()) },
        |s| time_value(s.created_at)),
    field!("updated_at" => "updated_at", true,
        |s, v| { s.updated_at = optional_time("updated_at", v)?; Ok(()) },
        |s| time_value(s.updated_at)),
    field!("next_charge_scheduled_at" => "next_charge_scheduled_at", true,
        |s, v| { s.next_charge_at = optional_time("next_charge_scheduled_at", v)?; Ok(()) },
        |s| time_value(s.next_charge_at)),
    field!("cancelled_at" => "cancelled_at", true,
        |s, v| { s.cancelled_at = optional_time("cancelled_at", v)?; Ok(()) },
        |s| time_value(s.cancelled_at)),
    field!("product_title" => "product_title", true,
        |s, v| { s.product_title = optional_string("product_title", v)?; Ok(()) },
        |s| string_value(&s.product_title)),
    field!("price" => "price", true,
        |s, v| { s.price = optional_string("price", v)?; Ok(()) },
        |s| string_value(&s.price)),
    field!("quantity" => "quantity", true,
        |s, v| { s.quantity = optional_quantity(v)?; Ok(()) },
        |s| s.quantity.map_or(Value::Null, Value::from)),
    field!("status" => "status", true,
        |s, v| {
            let raw = optional_string("status", v)?.ok_or(MappingError::MissingField("status"))?;
            s.status = SubscriptionStatus::from(raw);
            Ok(())
        },
        |s| Value::from(s.status.as_str())),
    field!("shopify_product_id" => "shopify_product_id", true,
        |s, v| { s.product_id = required_id("shopify_product_id", v)?; Ok(()) },
        |s| Value::from(s.product_id)),
    field!("shopify_variant_id" => "shopify_variant_id", true,
        |s, v| { s.variant_id = optional_id("shopify_variant_id", v)?; Ok(()) },
        |s| s.variant_id.map_or(Value::Null, Value::from)),
    field!("sku" => "sku", true,
        |s, v| { s.sku = optional_string("sku", v)?; Ok(()) },
        |s| string_value(&s.sku)),
    field!("order_interval_unit" => "order_interval_unit", true,
        |s, v| { s.order_interval_unit = optional_string("order_interval_unit", v)?; Ok(()) },
        |s| string_value(&s.order_interval_unit)),
    field!("order_interval_frequency" => "order_interval_frequency", true,
        |s, v| { s.order_interval_frequency = optional_string("order_interval_frequency", v)?; Ok(()) },
        |s| string_value(&s.order_interval_frequency)),
    field!("order_day_of_month" => "order_day_of_month", true,
        |s, v| { s.order_day_of_month = optional_string("order_day_of_month", v)?; Ok(()) },
        |s| string_value(&s.order_day_of_month)),
    field!("order_day_of_week" => "order_day_of_week", true,
        |s, v| { s.order_day_of_week = optional_string("order_day_of_week", v)?; Ok(()) },
        |s| string_value(&s.order_day_of_week)),
    field!("properties" => "raw_line_item_properties", true,
        |s, v| { s.line_item_properties = properties(v)?; Ok(()) },
        |s| {
            Value::Array(
                s.line_item_properties
                    .iter()
                    .map(|p| serde_json::json!({ "name": p.name, "value": p.value }))
                    .collect(),
            )
        }),
];

pub fn field_for_remote_key(remote_key: &str) -> Option<&'static FieldMapping> {
    SUBSCRIPTION_FIELDS
        .iter()
        .find(|field| field.remote_key == remote_key)
}

/// Outbound representation of a snapshot
pub fn to_remote(sub: &SubscriptionSnapshot) -> Map<String, Value> {
    SUBSCRIPTION_FIELDS
        .iter()
        .map(|field| (field.remote_key.to_string(), field.outbound(sub)))
        .collect()
}

/// Build a snapshot from a remote subscription object.
///
/// `id`, `customer_id` and `shopify_product_id` are required; every other
/// recognised key is optional and unrecognised keys are ignored.
pub fn from_remote(remote: &Value) -> Result<SubscriptionSnapshot, MappingError> {
    let object = remote.as_object().ok_or(MappingError::NotAnObject)?;
    let subscription_id = required_id("id", lookup(object, "id")?)?;
    let customer_id = required_id("customer_id", lookup(object, "customer_id")?)?;
    let product_id = required_id("shopify_product_id", lookup(object, "shopify_product_id")?)?;

    let mut sub = SubscriptionSnapshot::new(subscription_id, customer_id, product_id);
    for field in SUBSCRIPTION_FIELDS {
        if let Some(value) = object.get(field.remote_key) {
            field.apply_inbound(&mut sub, value)?;
        }
    }
    Ok(sub)
}

/// Apply the recognised, writable keys of a partial update.
///
/// Returns the remote keys that were applied. The snapshot is untouched when
/// any recognised key fails to convert.
pub fn apply_partial(
    sub: &mut SubscriptionSnapshot,
    update: &Map<String, Value>,
) -> Result<Vec<&'static str>, MappingError> {
    let mut staged = sub.clone();
    let mut applied = Vec::new();
    for field in SUBSCRIPTION_FIELDS.iter().filter(|f| f.writable) {
        if let Some(value) = update.get(field.remote_key) {
            field.apply_inbound(&mut staged, value)?;
            applied.push(field.remote_key);
        }
    }
    *sub = staged;
    Ok(applied)
}

fn lookup<'a>(object: &'a Map<String, Value>, key: &'static str) -> Result<&'a Value, MappingError> {
    object.get(key).ok_or(MappingError::MissingField(key))
}

fn invalid(field: &'static str, reason: impl Into<String>) -> MappingError {
    MappingError::InvalidField {
        field,
        reason: reason.into(),
    }
}

fn optional_id(field: &'static str, value: &Value) -> Result<Option<i64>, MappingError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| invalid(field, "not an integer")),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(field, format!("`{s}` is not an integer"))),
        _ => Err(invalid(field, "expected a string or integer")),
    }
}

fn required_id(field: &'static str, value: &Value) -> Result<i64, MappingError> {
    optional_id(field, value)?.ok_or(MappingError::MissingField(field))
}

fn optional_time(
    field: &'static str,
    value: &Value,
) -> Result<Option<PrimitiveDateTime>, MappingError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => calendar::parse_wire(s)
            .map(Some)
            .map_err(|e| invalid(field, e.to_string())),
        _ => Err(invalid(field, "expected a timestamp string")),
    }
}

fn optional_string(field: &'static str, value: &Value) -> Result<Option<String>, MappingError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(invalid(field, "expected a string")),
    }
}

fn optional_quantity(value: &Value) -> Result<Option<i32>, MappingError> {
    match optional_id("quantity", value)? {
        None => Ok(None),
        Some(q) => i32::try_from(q)
            .map(Some)
            .map_err(|_| invalid("quantity", "out of range")),
    }
}

fn properties(value: &Value) -> Result<Vec<LineItemProperty>, MappingError> {
    match value {
        Value::Null => Ok(Vec::new()),
        _ => serde_json::from_value(value.clone()).map_err(|e| invalid("properties", e.to_string())),
    }
}

fn time_value(at: Option<PrimitiveDateTime>) -> Value {
    at.map_or(Value::Null, |at| Value::from(calendar::format_wire(at)))
}

fn string_value(s: &Option<String>) -> Value {
    s.as_deref().map_or(Value::Null, Value::from)
}
