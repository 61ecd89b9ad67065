//! Shared handler state

use mailcast_core::{BroadcastManager, EngineMetrics, EventNormalizer, MetricsAggregator};
use mailcast_storage::repository::DeliveryEventRepository;
use mailcast_storage::DatabasePool;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BroadcastManager>,
    pub aggregator: Arc<MetricsAggregator>,
    pub normalizer: Arc<EventNormalizer>,
    pub events: Arc<dyn DeliveryEventRepository>,
    pub metrics: Arc<EngineMetrics>,
    /// `None` when running on the in-memory store
    pub db_pool: Option<DatabasePool>,
}
