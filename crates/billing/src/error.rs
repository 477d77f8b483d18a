//! Billing error types

use thiserror::Error;

use crate::mapping::MappingError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Remote ledger request failed: {0}")]
    Remote(String),

    #[error("Remote ledger request timed out")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(i64),

    #[error("Malformed job payload: {0}")]
    MalformedJob(String),

    #[error("Skip for subscription {0} has no customer reference")]
    MissingCustomerRef(i64),

    #[error("Invalid tag window: {0}")]
    InvalidTagWindow(String),

    #[error("Field mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Queue did not accept job: {0}")]
    QueueRejected(String),

    #[error("Notification delivery failed: {0}")]
    Notification(String),
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BillingError::Timeout
        } else {
            BillingError::Remote(err.to_string())
        }
    }
}
