//! Compares variation metrics and promotes a winner

use crate::metrics::{MetricsAggregator, VariationMetrics};
use chrono::{DateTime, Duration, Utc};
use mailcast_common::types::{BroadcastId, VariationId};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{Broadcast, BroadcastStatus, WinnerMetric};
use mailcast_storage::repository::BroadcastRepository;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// What asked for an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinnerTrigger {
    /// Periodic check; acts only once the test duration has elapsed
    Deadline,
    /// Operator request, optionally naming the variation
    Manual { variation_id: Option<VariationId> },
}

/// Result of an evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WinnerDecision {
    /// A/B testing is off for this broadcast
    NotTesting,
    /// The test phase has not run for `test_duration_hours` yet
    NotDue { due_at: DateTime<Utc> },
    /// A winner was recorded earlier and is kept
    AlreadySelected(VariationId),
    Selected(VariationId),
}

/// Best variation by `metric`; ties go to more recipients, then creation order
pub fn pick_winner(metrics: &[VariationMetrics], metric: WinnerMetric) -> Option<VariationId> {
    metrics
        .iter()
        .min_by(|a, b| {
            b.score(metric)
                .partial_cmp(&a.score(metric))
                .unwrap_or(Ordering::Equal)
                .then(b.recipients.cmp(&a.recipients))
                .then(a.position.cmp(&b.position))
        })
        .map(|m| m.variation_id)
}

/// Winner Selection
pub struct WinnerSelector {
    broadcasts: Arc<dyn BroadcastRepository>,
    aggregator: Arc<MetricsAggregator>,
}

impl WinnerSelector {
    pub fn new(broadcasts: Arc<dyn BroadcastRepository>, aggregator: Arc<MetricsAggregator>) -> Self {
        Self {
            broadcasts,
            aggregator,
        }
    }

    async fn load(&self, broadcast_id: BroadcastId) -> Result<Broadcast> {
        self.broadcasts
            .get(broadcast_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("broadcast {}", broadcast_id)))
    }

    /// Evaluate the test and record a winner when one is due.
    ///
    /// Idempotent: once a winner is stored it is returned unchanged.
    pub async fn evaluate(
        &self,
        broadcast_id: BroadcastId,
        now: DateTime<Utc>,
        trigger: WinnerTrigger,
    ) -> Result<WinnerDecision> {
        let broadcast = self.load(broadcast_id).await?;

        if !broadcast.test_settings.enabled {
            return match trigger {
                WinnerTrigger::Deadline => Ok(WinnerDecision::NotTesting),
                WinnerTrigger::Manual { .. } => Err(Error::Validation(
                    "A/B testing is not enabled for this broadcast".to_string(),
                )),
            };
        }

        if let Some(existing) = broadcast.winning_variation {
            return Ok(WinnerDecision::AlreadySelected(existing));
        }

        let variation_id = match trigger {
            WinnerTrigger::Deadline => {
                let Some(started) = broadcast.test_phase_started_at else {
                    return Ok(WinnerDecision::NotDue { due_at: now });
                };
                let due_at = started + Duration::hours(broadcast.test_settings.test_duration_hours as i64);
                if now < due_at {
                    return Ok(WinnerDecision::NotDue { due_at });
                }
                self.score(&broadcast).await?
            }
            WinnerTrigger::Manual { variation_id } => {
                if !matches!(
                    broadcast.status,
                    BroadcastStatus::Sending | BroadcastStatus::Paused
                ) {
                    return Err(Error::Validation(format!(
                        "cannot select a winner while broadcast is {}",
                        broadcast.status
                    )));
                }
                match variation_id {
                    Some(id) if broadcast.variation(id).is_some() => id,
                    Some(id) => {
                        return Err(Error::Validation(format!(
                            "variation {} does not belong to this broadcast",
                            id
                        )))
                    }
                    None => self.score(&broadcast).await?,
                }
            }
        };

        if !self.broadcasts.set_winner(broadcast_id, variation_id, now).await? {
            // Another evaluation won the race
            let current = self.load(broadcast_id).await?;
            if let Some(existing) = current.winning_variation {
                return Ok(WinnerDecision::AlreadySelected(existing));
            }
            return Err(Error::Internal(format!(
                "winner for broadcast {} was not recorded",
                broadcast_id
            )));
        }

        info!(
            broadcast_id = %broadcast_id,
            variation_id = %variation_id,
            trigger = ?trigger,
            "Winning variation selected"
        );
        Ok(WinnerDecision::Selected(variation_id))
    }

    async fn score(&self, broadcast: &Broadcast) -> Result<VariationId> {
        let metrics = self.aggregator.variation_metrics(broadcast.id).await?;
        let metric = broadcast.test_settings.auto_send_winner_metric;

        for m in &metrics {
            debug!(
                broadcast_id = %broadcast.id,
                variation_id = %m.variation_id,
                recipients = m.recipients,
                score = m.score(metric),
                "Variation score"
            );
        }

        pick_winner(&metrics, metric)
            .ok_or_else(|| Error::Validation("broadcast has no variations".to_string()))
    }

    /// Let the orchestrator send the winner when auto send is off
    pub async fn release(&self, broadcast_id: BroadcastId) -> Result<Broadcast> {
        let broadcast = self.load(broadcast_id).await?;
        if broadcast.winning_variation.is_none() {
            return Err(Error::Validation(
                "no winning variation has been selected".to_string(),
            ));
        }
        if !matches!(
            broadcast.status,
            BroadcastStatus::Sending | BroadcastStatus::Paused
        ) {
            return Err(Error::Validation(format!(
                "cannot release the winner while broadcast is {}",
                broadcast.status
            )));
        }

        if self.broadcasts.release_winner(broadcast_id).await? {
            info!(broadcast_id = %broadcast_id, "Winner released for sending");
        }
        self.load(broadcast_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn metrics(position: i32, recipients: i64, opens: i64, clicks: i64) -> VariationMetrics {
        let rate = |count: i64| crate::metrics::rate(count, recipients);
        VariationMetrics {
            variation_id: Uuid::new_v4(),
            name: format!("v{}", position),
            position,
            recipients,
            failed: 0,
            delivered: recipients,
            bounced: 0,
            complained: 0,
            opens,
            clicks,
            delivery_rate: 1.0,
            bounce_rate: 0.0,
            complaint_rate: 0.0,
            open_rate: rate(opens),
            click_rate: rate(clicks),
        }
    }

    #[test]
    fn test_highest_rate_wins() {
        let all = vec![metrics(0, 10, 2, 5), metrics(1, 10, 6, 1)];
        assert_eq!(pick_winner(&all, WinnerMetric::OpenRate), Some(all[1].variation_id));
        assert_eq!(pick_winner(&all, WinnerMetric::ClickRate), Some(all[0].variation_id));
    }

    #[test]
    fn test_tie_prefers_more_recipients_then_creation_order() {
        let all = vec![metrics(0, 10, 5, 0), metrics(1, 20, 10, 0)];
        assert_eq!(pick_winner(&all, WinnerMetric::OpenRate), Some(all[1].variation_id));

        let all = vec![metrics(1, 10, 5, 0), metrics(0, 10, 5, 0)];
        assert_eq!(pick_winner(&all, WinnerMetric::OpenRate), Some(all[1].variation_id));
    }

    #[test]
    fn test_no_metrics_no_winner() {
        assert_eq!(pick_winner(&[], WinnerMetric::OpenRate), None);
    }
}
