//! Folds send records and delivery events into variation metrics

use mailcast_common::types::{BroadcastId, VariationId};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{Broadcast, BroadcastStatus, WinnerMetric};
use mailcast_storage::repository::{BroadcastRepository, DeliveryEventRepository, DispatchStore};
use serde::Serialize;
use std::sync::Arc;

/// Counters and rates for one variation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariationMetrics {
    pub variation_id: VariationId,
    pub name: String,
    pub position: i32,
    /// Send records in the sent state
    pub recipients: i64,
    pub failed: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub complained: i64,
    pub opens: i64,
    pub clicks: i64,
    pub delivery_rate: f64,
    pub bounce_rate: f64,
    pub complaint_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
}

impl VariationMetrics {
    /// Value of the metric used for winner selection
    pub fn score(&self, metric: WinnerMetric) -> f64 {
        match metric {
            WinnerMetric::OpenRate => self.open_rate,
            WinnerMetric::ClickRate => self.click_rate,
        }
    }
}

/// Broadcast-wide metrics with the per-variation breakdown
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastMetrics {
    pub broadcast_id: BroadcastId,
    pub status: BroadcastStatus,
    pub total_recipients: i64,
    pub sent: i64,
    pub failed: i64,
    pub pending: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub complained: i64,
    pub opens: i64,
    pub clicks: i64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub progress_percentage: f64,
    pub winning_variation: Option<VariationId>,
    pub variations: Vec<VariationMetrics>,
}

/// `count / recipients`, zero for an empty denominator
pub fn rate(count: i64, recipients: i64) -> f64 {
    if recipients <= 0 {
        0.0
    } else {
        count as f64 / recipients as f64
    }
}

/// Metrics Aggregator
pub struct MetricsAggregator {
    broadcasts: Arc<dyn BroadcastRepository>,
    store: Arc<dyn DispatchStore>,
    events: Arc<dyn DeliveryEventRepository>,
}

impl MetricsAggregator {
    pub fn new(
        broadcasts: Arc<dyn BroadcastRepository>,
        store: Arc<dyn DispatchStore>,
        events: Arc<dyn DeliveryEventRepository>,
    ) -> Self {
        Self {
            broadcasts,
            store,
            events,
        }
    }

    async fn load(&self, broadcast_id: BroadcastId) -> Result<Broadcast> {
        self.broadcasts
            .get(broadcast_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("broadcast {}", broadcast_id)))
    }

    /// Metrics for every variation of the broadcast, in creation order
    pub async fn variation_metrics(&self, broadcast_id: BroadcastId) -> Result<Vec<VariationMetrics>> {
        let broadcast = self.load(broadcast_id).await?;
        self.compute_variations(&broadcast).await
    }

    async fn compute_variations(&self, broadcast: &Broadcast) -> Result<Vec<VariationMetrics>> {
        let sends = self.store.send_counts(broadcast.id).await?;
        let events = self.events.counts_by_variation(broadcast.id).await?;

        let metrics = broadcast
            .ordered_variations()
            .into_iter()
            .map(|variation| {
                let send = sends.iter().find(|s| s.variation_id == variation.id);
                let recipients = send.map_or(0, |s| s.sent);
                let counts = events.get(&variation.id).cloned().unwrap_or_default();

                VariationMetrics {
                    variation_id: variation.id,
                    name: variation.name.clone(),
                    position: variation.position,
                    recipients,
                    failed: send.map_or(0, |s| s.failed),
                    delivered: counts.delivered,
                    bounced: counts.bounced,
                    complained: counts.complained,
                    opens: counts.opens,
                    clicks: counts.clicks,
                    delivery_rate: rate(counts.delivered, recipients),
                    bounce_rate: rate(counts.bounced, recipients),
                    complaint_rate: rate(counts.complained, recipients),
                    open_rate: rate(counts.opens, recipients),
                    click_rate: rate(counts.clicks, recipients),
                }
            })
            .collect();

        Ok(metrics)
    }

    /// Broadcast totals derived from the variation breakdown
    pub async fn broadcast_metrics(&self, broadcast_id: BroadcastId) -> Result<BroadcastMetrics> {
        let broadcast = self.load(broadcast_id).await?;
        let variations = self.compute_variations(&broadcast).await?;
        let pending: i64 = self
            .store
            .send_counts(broadcast_id)
            .await?
            .iter()
            .map(|s| s.pending)
            .sum();

        let sum = |f: fn(&VariationMetrics) -> i64| variations.iter().map(f).sum::<i64>();
        let sent = sum(|v| v.recipients);
        let opens = sum(|v| v.opens);
        let clicks = sum(|v| v.clicks);

        Ok(BroadcastMetrics {
            broadcast_id,
            status: broadcast.status,
            total_recipients: broadcast.total_recipients,
            sent,
            failed: sum(|v| v.failed),
            pending,
            delivered: sum(|v| v.delivered),
            bounced: sum(|v| v.bounced),
            complained: sum(|v| v.complained),
            opens,
            clicks,
            open_rate: rate(opens, sent),
            click_rate: rate(clicks, sent),
            progress_percentage: broadcast.progress_percentage(),
            winning_variation: broadcast.winning_variation,
            variations,
        })
    }
}
