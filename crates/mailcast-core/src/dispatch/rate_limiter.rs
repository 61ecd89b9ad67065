//! Rate Limiter - Per-broadcast token buckets

use chrono::{DateTime, Duration, Utc};
use mailcast_common::types::BroadcastId;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

/// Token bucket refilled continuously at `per_minute / 60` tokens per second
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// Full bucket for a per-minute rate
    pub fn per_minute(rate: u32, now: DateTime<Utc>) -> Self {
        let capacity = rate as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).num_milliseconds();
        if elapsed > 0 {
            let added = self.refill_per_sec * (elapsed as f64 / 1000.0);
            self.tokens = (self.tokens + added).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Whole tokens available at `now`
    pub fn available(&mut self, now: DateTime<Utc>) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }

    /// Spend tokens; never goes below zero
    pub fn consume(&mut self, count: u32, now: DateTime<Utc>) {
        self.refill(now);
        self.tokens = (self.tokens - count as f64).max(0.0);
    }
}

/// Bucket plus the sends of the trailing minute
#[derive(Debug)]
struct BroadcastLimit {
    rate: u32,
    bucket: TokenBucket,
    recent: VecDeque<(DateTime<Utc>, usize)>,
}

impl BroadcastLimit {
    fn new(rate: u32, now: DateTime<Utc>) -> Self {
        Self {
            rate,
            bucket: TokenBucket::per_minute(rate, now),
            recent: VecDeque::new(),
        }
    }

    fn sent_in_window(&mut self, now: DateTime<Utc>) -> usize {
        let window_start = now - Duration::seconds(60);
        while matches!(self.recent.front(), Some((at, _)) if *at <= window_start) {
            self.recent.pop_front();
        }
        self.recent.iter().map(|(_, count)| count).sum()
    }
}

/// Token buckets keyed by broadcast.
///
/// A trailing one-minute log caps the bucket so a refilled bucket can never
/// push more than `rate` sends into any 60 second window.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<BroadcastId, BroadcastLimit>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many recipients the broadcast may send right now
    pub async fn allowance(
        &self,
        broadcast_id: BroadcastId,
        rate_per_minute: Option<u32>,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> usize {
        let Some(rate) = rate_per_minute else {
            return batch_size;
        };

        let mut buckets = self.buckets.lock().await;
        let limit = buckets
            .entry(broadcast_id)
            .or_insert_with(|| BroadcastLimit::new(rate, now));
        if limit.rate != rate {
            *limit = BroadcastLimit::new(rate, now);
        }
        let headroom = (rate as usize).saturating_sub(limit.sent_in_window(now));
        let available = (limit.bucket.available(now) as usize).min(headroom);

        if available == 0 {
            debug!(broadcast_id = %broadcast_id, rate, "Rate limit reached");
        }
        available.min(batch_size)
    }

    /// Record recipients handed to the transport
    pub async fn consume(&self, broadcast_id: BroadcastId, count: usize, now: DateTime<Utc>) {
        if count == 0 {
            return;
        }
        let mut buckets = self.buckets.lock().await;
        if let Some(limit) = buckets.get_mut(&broadcast_id) {
            limit.bucket.consume(count as u32, now);
            limit.recent.push_back((now, count));
        }
    }

    /// Drop state for a finished broadcast
    pub async fn forget(&self, broadcast_id: BroadcastId) {
        self.buckets.lock().await.remove(&broadcast_id);
    }
}
