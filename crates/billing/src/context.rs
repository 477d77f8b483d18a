//! Collaborators shared by the request path and the sync worker

use std::sync::Arc;

use sqlx::PgPool;

use crate::audit::{AuditTrail, PgAuditTrail};
use crate::calendar::Clock;
use crate::catalog::{PgProductCatalog, ProductCatalog};
use crate::orders::{OrderRepository, PgOrderRepository};
use crate::queue::{JobQueue, PgJobQueue};
use crate::store::{PgSubscriptionStore, SubscriptionStore};
use crate::tags::{PgProductTagStore, ProductTagStore};

#[derive(Clone)]
pub struct BillingContext {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub orders: Arc<dyn OrderRepository>,
    pub catalog: Arc<dyn ProductCatalog>,
    pub tags: Arc<dyn ProductTagStore>,
    pub audit: Arc<dyn AuditTrail>,
    pub queue: Arc<dyn JobQueue>,
    pub clock: Arc<dyn Clock>,
}

impl BillingContext {
    /// Every collaborator backed by the same Postgres pool
    pub fn postgres(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            subscriptions: Arc::new(PgSubscriptionStore::new(pool.clone())),
            orders: Arc::new(PgOrderRepository::new(pool.clone())),
            catalog: Arc::new(PgProductCatalog::new(pool.clone())),
            tags: Arc::new(PgProductTagStore::new(pool.clone())),
            audit: Arc::new(PgAuditTrail::new(pool.clone())),
            queue: Arc::new(PgJobQueue::new(pool)),
            clock,
        }
    }
}
