//! Mailcast Core - Broadcast dispatch and delivery-event engine
//!
//! This crate runs broadcast campaigns end to end: audience snapshots,
//! the campaign state machine, rate-limited and window-aware dispatch,
//! A/B test winner selection, metrics, and provider webhook normalization.

pub mod audience;
pub mod clock;
pub mod dispatch;
pub mod metrics;
pub mod scheduler;
pub mod stores;
pub mod telemetry;
pub mod webhooks;
pub mod winner;

pub use audience::AudienceResolver;
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{
    CycleReport, CycleStats, FileTemplates, InMemoryTemplates, MockTransport, Orchestrator,
    Personalizer, SmtpTransport, TemplateRenderer, Transport,
};
pub use metrics::{BroadcastMetrics, MetricsAggregator, VariationMetrics};
pub use scheduler::{BroadcastManager, DispatchWorker, TickSummary};
pub use stores::Stores;
pub use telemetry::EngineMetrics;
pub use webhooks::{EventNormalizer, IngestOutcome};
pub use winner::{WinnerDecision, WinnerSelector, WinnerTrigger};
