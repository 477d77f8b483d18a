// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::Database wraps sqlx::Error
#![allow(clippy::too_many_arguments)] // Sync flows thread job, replica row and clock through
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subsync Billing Module
//!
//! Customer-facing skip and switch requests for subscriptions mirrored from
//! a remote subscription ledger.
//!
//! ## Features
//!
//! - **Eligibility**: Day-of-month and product-tag rules for skips and switches
//! - **Prepaid Subscriptions**: Skips and switches applied to pre-generated orders
//! - **Local Replica**: Subscriptions, queued orders and product variants in Postgres
//! - **Field Mapping**: Translation between remote and local subscription shapes
//! - **Sync Queue**: Durable, per-subscription ordered jobs for remote mutations
//! - **Sync Worker**: Replays accepted changes against the ledger, exactly one
//!   audit entry and notification per job
//! - **Notifications**: Success messages to customers, failures to support

pub mod audit;
pub mod calendar;
pub mod catalog;
pub mod context;
pub mod eligibility;
pub mod error;
pub mod mapping;
pub mod models;
pub mod notify;
pub mod orders;
pub mod queue;
pub mod remote;
pub mod runner;
pub mod service;
pub mod store;
pub mod tags;
pub mod worker;


// Audit
pub use audit::{AuditTrail, InMemoryAuditTrail, PgAuditTrail, SkipAuditEntry, SwitchAuditEntry};

// Calendar
pub use calendar::{Clock, FixedClock, SystemClock, SKIP_CUTOFF_DAY};

// Catalog
pub use catalog::{InMemoryProductCatalog, PgProductCatalog, ProductCatalog, ProductVariant};

// Context
pub use context::BillingContext;

// Eligibility
pub use eligibility::{EligibilityEngine, Refusal, SwitchPolicy};

// Errors
pub use error::{BillingError, BillingResult};

// Mapping
pub use mapping::{MappingError, SUBSCRIPTION_FIELDS};

// Models
pub use models::{
    LineItemProperty, OrderLineItem, OrderStatus, QueuedOrder, SubscriptionSnapshot,
    SubscriptionStatus,
};

// Notifications
pub use notify::{
    LogNotificationSink, NotificationDispatcher, NotificationSink, WebhookNotificationSink,
};

// Orders
pub use orders::{InMemoryOrderRepository, OrderRepository, PgOrderRepository};

// Queue
pub use queue::{
    Delivery, InMemoryJobQueue, JobEnvelope, JobQueue, NotificationJob, NotificationKind,
    PgJobQueue, SyncAction, SyncJob, NOTIFICATION_QUEUE, SYNC_QUEUE,
};

// Remote ledger
pub use remote::{HttpLedgerClient, RemoteLedgerClient, RemoteResponse};

// Worker
pub use runner::WorkerPool;
pub use worker::{JobOutcome, RemoteSyncWorker, WorkerFailure};

// Service
pub use service::{
    PartialUpdate, SkipOutcome, SkipRequest, SubscriptionEligibility, SubscriptionService,
    SwitchOutcome,
};

// Store
pub use store::{InMemorySubscriptionStore, PgSubscriptionStore, SubscriptionStore};

// Tags
pub use tags::{
    InMemoryProductTagStore, PgProductTagStore, ProductClassifier, ProductTag, ProductTagStore,
    ProductTagWindow,
};
