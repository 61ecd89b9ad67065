//! Metrics Aggregator

mod aggregator;

pub use aggregator::{rate, BroadcastMetrics, MetricsAggregator, VariationMetrics};
