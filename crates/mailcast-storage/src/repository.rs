//! Repository layer for data access

pub mod audience;
pub mod broadcasts;
pub mod dispatch;
pub mod events;
pub mod unsubscribes;

// Re-export repository traits
pub use audience::AudienceSource;
pub use broadcasts::{build_variations, BroadcastRepository, CycleLease};
pub use dispatch::DispatchStore;
pub use events::DeliveryEventRepository;
pub use unsubscribes::UnsubscribeRepository;

// Re-export concrete database implementations
pub use audience::DbAudienceSource;
pub use broadcasts::DbBroadcastRepository;
pub use dispatch::DbDispatchStore;
pub use events::DbDeliveryEventRepository;
pub use unsubscribes::DbUnsubscribeRepository;
