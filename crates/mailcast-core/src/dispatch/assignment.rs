//! Variation assignment for the A/B test sample and the winner phase

use mailcast_common::types::VariationId;
use mailcast_storage::models::Broadcast;

/// Shape of the test sample over the snapshot.
///
/// The sample is the snapshot prefix `[0, sample_size)`. Inside it,
/// variations take positions round-robin in creation order, so every
/// variation receives exactly `quota` recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestPlan {
    pub variation_count: i64,
    pub quota: i64,
}

impl TestPlan {
    /// Plan for a broadcast with `total` snapshot entries; `None` without testing
    pub fn for_broadcast(broadcast: &Broadcast, total: i64) -> Option<Self> {
        let settings = &broadcast.test_settings;
        let variation_count = broadcast.variations.len() as i64;
        if !settings.enabled || variation_count == 0 {
            return None;
        }

        let percentage = settings.sample_percentage.min(100) as i64;
        let quota = total * percentage / 100 / variation_count;

        Some(Self {
            variation_count,
            quota,
        })
    }

    /// Recipients in the test phase
    pub fn sample_size(&self) -> i64 {
        self.quota * self.variation_count
    }

    pub fn in_sample(&self, position: i64) -> bool {
        position < self.sample_size()
    }
}

/// Pick the variation for the recipient at `position`.
///
/// `None` means the recipient belongs to the winner phase and no winner has
/// been chosen yet.
pub fn assign_variation(
    broadcast: &Broadcast,
    plan: Option<&TestPlan>,
    position: i64,
) -> Option<VariationId> {
    let ordered = broadcast.ordered_variations();

    match plan {
        Some(plan) if plan.in_sample(position) => {
            let index = (position % plan.variation_count) as usize;
            ordered.get(index).map(|v| v.id)
        }
        Some(_) => broadcast.winning_variation,
        None => ordered.first().map(|v| v.id),
    }
}
