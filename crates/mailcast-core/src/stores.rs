//! Repository handles shared by the engine components

use mailcast_storage::repository::{
    AudienceSource, BroadcastRepository, DbAudienceSource, DbBroadcastRepository,
    DbDeliveryEventRepository, DbDispatchStore, DbUnsubscribeRepository,
    DeliveryEventRepository, DispatchStore, UnsubscribeRepository,
};
use mailcast_storage::{DatabasePool, MemoryStore};
use std::sync::Arc;

/// Every repository the engine reads or writes
#[derive(Clone)]
pub struct Stores {
    pub broadcasts: Arc<dyn BroadcastRepository>,
    pub audience: Arc<dyn AudienceSource>,
    pub unsubscribes: Arc<dyn UnsubscribeRepository>,
    pub dispatch: Arc<dyn DispatchStore>,
    pub events: Arc<dyn DeliveryEventRepository>,
}

impl Stores {
    /// PostgreSQL repositories over one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            broadcasts: Arc::new(DbBroadcastRepository::new(pool.clone())),
            audience: Arc::new(DbAudienceSource::new(pool.clone())),
            unsubscribes: Arc::new(DbUnsubscribeRepository::new(pool.clone())),
            dispatch: Arc::new(DbDispatchStore::new(pool.clone())),
            events: Arc::new(DbDeliveryEventRepository::new(pool)),
        }
    }

    /// All repositories backed by one in-memory store
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            broadcasts: store.clone(),
            audience: store.clone(),
            unsubscribes: store.clone(),
            dispatch: store.clone(),
            events: store,
        }
    }
}
