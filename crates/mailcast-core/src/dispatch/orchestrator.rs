//! Send Orchestrator - Runs dispatch cycles for sending broadcasts

use super::assignment::{assign_variation, TestPlan};
use super::message::compose;
use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;
use super::template::{Personalizer, TemplateRenderer};
use super::transport::{Transport, TransportError};
use super::window::{resolve_timezone, SendWindow};
use crate::audience::AudienceResolver;
use crate::clock::Clock;
use crate::stores::Stores;
use crate::telemetry::EngineMetrics;
use chrono_tz::Tz;
use mailcast_common::config::DispatchConfig;
use mailcast_common::types::{BroadcastId, VariationId};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{
    AudienceMember, Broadcast, BroadcastCounters, BroadcastStatus, DeferredRecipient, Variation,
};
use mailcast_storage::repository::{BroadcastRepository, DeliveryEventRepository, DispatchStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

/// Outcome of one dispatch cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// Another cycle holds the broadcast
    Busy,
    /// The broadcast is not sending; nothing was done
    NotSending(BroadcastStatus),
    /// A batch was processed, possibly empty under the rate limit
    Progress(CycleStats),
    /// The test sample is done and the winner phase cannot start yet
    AwaitingWinner,
    /// Every recipient has been processed and the broadcast is sent
    Completed,
}

impl CycleReport {
    pub fn label(&self) -> &'static str {
        match self {
            CycleReport::Busy => "busy",
            CycleReport::NotSending(_) => "not_sending",
            CycleReport::Progress(_) => "progress",
            CycleReport::AwaitingWinner => "awaiting_winner",
            CycleReport::Completed => "completed",
        }
    }
}

/// Per-cycle recipient counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub sent: usize,
    pub failed: usize,
    /// Already had a send record
    pub skipped: usize,
    /// Parked outside their send window
    pub deferred: usize,
}

impl CycleStats {
    pub fn is_empty(&self) -> bool {
        self.sent + self.failed + self.skipped + self.deferred == 0
    }

    fn record(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Sent => self.sent += 1,
            SendOutcome::Failed => self.failed += 1,
            SendOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    Failed,
    Skipped,
}

impl SendOutcome {
    fn label(&self) -> &'static str {
        match self {
            SendOutcome::Sent => "sent",
            SendOutcome::Failed => "failed",
            SendOutcome::Skipped => "skipped",
        }
    }
}

/// One recipient ready for the transport
struct SendJob {
    member: AudienceMember,
    variation: Variation,
    html: Arc<String>,
    from_deferred: bool,
}

/// Everything a spawned send task needs
struct Delivery {
    store: Arc<dyn DispatchStore>,
    transport: Arc<dyn Transport>,
    personalizer: Arc<Personalizer>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Delivery {
    /// Claim, send with retries, and record the result for one recipient
    async fn deliver(&self, broadcast_id: BroadcastId, job: SendJob) -> Result<SendOutcome> {
        let email = job.member.contact.email.as_str();

        let claimed = self
            .store
            .claim_send(broadcast_id, job.variation.id, email, self.clock.now())
            .await?;
        if !claimed {
            debug!(broadcast_id = %broadcast_id, recipient = %email, "Send record exists, skipping");
            return Ok(SendOutcome::Skipped);
        }

        let message = compose(
            &self.personalizer,
            &job.variation,
            &job.html,
            &job.member.contact,
            Some(broadcast_id),
        );

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let result = match tokio::time::timeout(self.timeout, self.transport.send(&message))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::retryable(format!(
                    "transport timed out after {}s",
                    self.timeout.as_secs()
                ))),
            };

            match result {
                Ok(provider_message_id) => {
                    self.metrics.record_transport_attempt("ok");
                    self.store
                        .complete_send(
                            broadcast_id,
                            email,
                            attempt as i32,
                            &provider_message_id,
                            self.clock.now(),
                        )
                        .await?;
                    return Ok(SendOutcome::Sent);
                }
                Err(e) if e.retryable && attempt < self.retry.max_attempts => {
                    self.metrics.record_transport_attempt("retry");
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        broadcast_id = %broadcast_id,
                        recipient = %email,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transport failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.record_transport_attempt("error");
                    warn!(
                        broadcast_id = %broadcast_id,
                        recipient = %email,
                        attempt,
                        retryable = e.retryable,
                        error = %e,
                        "Send failed"
                    );
                    self.store
                        .fail_send(broadcast_id, email, attempt as i32, &e.message)
                        .await?;
                    return Ok(SendOutcome::Failed);
                }
            }
        }
    }
}

/// Send Orchestrator
pub struct Orchestrator {
    broadcasts: Arc<dyn BroadcastRepository>,
    store: Arc<dyn DispatchStore>,
    events: Arc<dyn DeliveryEventRepository>,
    resolver: AudienceResolver,
    templates: Arc<dyn TemplateRenderer>,
    delivery: Arc<Delivery>,
    rate_limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    guards: Mutex<HashMap<BroadcastId, Arc<Mutex<()>>>>,
    batch_size: usize,
    concurrency: usize,
    default_timezone: Tz,
}

impl Orchestrator {
    pub fn new(
        stores: Stores,
        templates: Arc<dyn TemplateRenderer>,
        transport: Arc<dyn Transport>,
        personalizer: Arc<Personalizer>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
        config: &DispatchConfig,
    ) -> Self {
        let resolver = AudienceResolver::new(
            stores.audience.clone(),
            stores.unsubscribes.clone(),
            stores.dispatch.clone(),
        );
        let delivery = Arc::new(Delivery {
            store: stores.dispatch.clone(),
            transport,
            personalizer,
            clock: clock.clone(),
            metrics: metrics.clone(),
            retry: RetryPolicy::from_config(config),
            timeout: Duration::from_secs(config.transport_timeout_secs.max(1)),
        });

        Self {
            broadcasts: stores.broadcasts,
            store: stores.dispatch,
            events: stores.events,
            resolver,
            templates,
            delivery,
            rate_limiter: RateLimiter::new(),
            clock,
            metrics,
            guards: Mutex::new(HashMap::new()),
            batch_size: config.batch_size.max(1),
            concurrency: config.worker_concurrency.max(1),
            default_timezone: resolve_timezone(Some(&config.default_timezone), Tz::UTC),
        }
    }

    /// Run one dispatch cycle for a broadcast.
    ///
    /// Returns `Busy` when another cycle for the same broadcast is running,
    /// in this process or, with PostgreSQL, in another one. A store fault
    /// marks the broadcast failed and surfaces as `Error::Orchestration`.
    /// An audience that resolves empty leaves the status alone and is
    /// recorded on `last_error` for the operator.
    pub async fn run_cycle(&self, broadcast_id: BroadcastId) -> Result<CycleReport> {
        let guard = self.guard(broadcast_id).await;
        let Ok(_local) = guard.try_lock() else {
            debug!(broadcast_id = %broadcast_id, "Cycle already running");
            self.metrics.record_cycle(CycleReport::Busy.label());
            return Ok(CycleReport::Busy);
        };
        let Some(_lease) = self.broadcasts.try_lease_cycle(broadcast_id).await? else {
            debug!(broadcast_id = %broadcast_id, "Cycle lease held elsewhere");
            self.metrics.record_cycle(CycleReport::Busy.label());
            return Ok(CycleReport::Busy);
        };

        let broadcast = self
            .broadcasts
            .get(broadcast_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("broadcast {}", broadcast_id)))?;

        if broadcast.status != BroadcastStatus::Sending {
            return Ok(CycleReport::NotSending(broadcast.status));
        }

        match self.execute(broadcast).await {
            Ok(report) => {
                self.metrics.record_cycle(report.label());
                Ok(report)
            }
            Err(e @ Error::InvalidAudience(_)) => {
                self.metrics.record_cycle("invalid_audience");
                warn!(
                    broadcast_id = %broadcast_id,
                    error = %e,
                    "Audience is empty, broadcast left as is"
                );
                self.broadcasts
                    .record_error(broadcast_id, &e.to_string())
                    .await?;
                Err(e)
            }
            Err(e) => {
                self.metrics.record_cycle("failed");
                self.fail_broadcast(broadcast_id, &e).await;
                Err(Error::Orchestration(e.to_string()))
            }
        }
    }

    async fn execute(&self, mut broadcast: Broadcast) -> Result<CycleReport> {
        let id = broadcast.id;
        let now = self.clock.now();

        let total = self.resolver.snapshot(&broadcast).await?;
        let testing = broadcast.test_settings.enabled;
        if broadcast.total_recipients != total
            || (testing && broadcast.test_phase_started_at.is_none())
        {
            self.broadcasts
                .set_audience_total(id, total, testing.then_some(now))
                .await?;
            broadcast.total_recipients = total;
            if testing && broadcast.test_phase_started_at.is_none() {
                broadcast.test_phase_started_at = Some(now);
                info!(broadcast_id = %id, total, "Test phase started");
            }
        }

        let plan = TestPlan::for_broadcast(&broadcast, total);
        let winner_ready = match plan {
            None => true,
            Some(_) => {
                broadcast.winning_variation.is_some()
                    && (broadcast.test_settings.auto_send_winner || broadcast.winner_released)
            }
        };
        let sample_end = plan.map_or(total, |p| p.sample_size().min(total));
        let pull_end = if winner_ready { total } else { sample_end };

        let allowed = self
            .rate_limiter
            .allowance(
                id,
                broadcast.audience.rate_limit_per_minute,
                self.batch_size,
                now,
            )
            .await;

        let mut members: Vec<(AudienceMember, bool)> = Vec::new();
        let mut cursor = broadcast.recipient_cursor;
        if allowed > 0 {
            let due = self.store.due_deferred(id, now, allowed as i64).await?;
            members.extend(
                due.into_iter()
                    .filter(|d| d.member.position < pull_end)
                    .map(|d| (d.member, true)),
            );

            let remaining = allowed.saturating_sub(members.len()) as i64;
            let room = pull_end - cursor;
            if remaining > 0 && room > 0 {
                let page = self.resolver.page(id, cursor, remaining.min(room)).await?;
                if let Some(last) = page.last() {
                    cursor = last.position + 1;
                }
                members.extend(page.into_iter().map(|m| (m, false)));
            }
        }

        // Pause and cancel take effect at the batch boundary
        if !members.is_empty() {
            let status = self
                .broadcasts
                .get(id)
                .await?
                .map_or(broadcast.status, |b| b.status);
            if status != BroadcastStatus::Sending {
                info!(broadcast_id = %id, status = %status, "Broadcast left sending before batch");
                return Ok(CycleReport::NotSending(status));
            }
        }

        let window = if broadcast.schedule.use_recipient_timezone {
            SendWindow::from_schedule(&broadcast.schedule)?
        } else {
            None
        };

        let mut stats = CycleStats::default();
        let mut rendered: HashMap<VariationId, Arc<String>> = HashMap::new();
        let mut jobs = Vec::with_capacity(members.len());
        let mut winner_phase_dispatched = false;

        for (member, from_deferred) in members {
            if let Some(window) = &window {
                let tz = resolve_timezone(member.contact.timezone.as_deref(), self.default_timezone);
                if !window.is_open(now, tz) {
                    let not_before = window.next_opening(now, tz);
                    debug!(
                        broadcast_id = %id,
                        recipient = %member.contact.email,
                        not_before = %not_before,
                        "Outside send window, deferring"
                    );
                    self.store
                        .defer(DeferredRecipient {
                            broadcast_id: id,
                            member,
                            not_before,
                        })
                        .await?;
                    self.metrics.record_send("deferred");
                    stats.deferred += 1;
                    continue;
                }
            }

            let variation = assign_variation(&broadcast, plan.as_ref(), member.position)
                .and_then(|variation_id| broadcast.variation(variation_id))
                .cloned();
            let Some(variation) = variation else {
                // Winner phase without a winner yet; retried once one is set
                self.store
                    .defer(DeferredRecipient {
                        broadcast_id: id,
                        member,
                        not_before: now,
                    })
                    .await?;
                stats.deferred += 1;
                continue;
            };

            let html = match rendered.get(&variation.id) {
                Some(html) => html.clone(),
                None => {
                    let html = Arc::new(
                        self.templates
                            .render(variation.template_id, variation.template_version)
                            .await?,
                    );
                    rendered.insert(variation.id, html.clone());
                    html
                }
            };

            if plan.map_or(false, |p| !p.in_sample(member.position)) {
                winner_phase_dispatched = true;
            }

            jobs.push(SendJob {
                member,
                variation,
                html,
                from_deferred,
            });
        }

        self.rate_limiter.consume(id, jobs.len(), now).await;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            let delivery = self.delivery.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let position = job.member.position;
                let from_deferred = job.from_deferred;
                let outcome = delivery.deliver(id, job).await?;
                if from_deferred {
                    delivery.store.remove_deferred(id, position).await?;
                }
                Ok::<_, Error>(outcome)
            }));
        }

        // The in-flight batch always runs to completion
        let mut fault = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => {
                    self.metrics.record_send(outcome.label());
                    stats.record(outcome);
                }
                Ok(Err(e)) => {
                    error!(broadcast_id = %id, error = %e, "Send task failed");
                    fault.get_or_insert(e);
                }
                Err(e) => {
                    error!(broadcast_id = %id, error = %e, "Send task panicked");
                    fault.get_or_insert(Error::Internal(e.to_string()));
                }
            }
        }
        if let Some(e) = fault {
            return Err(e);
        }

        if cursor != broadcast.recipient_cursor {
            self.broadcasts.set_cursor(id, cursor).await?;
        }
        self.refresh_counters(id).await?;

        if winner_phase_dispatched && broadcast.winner_sent_at.is_none() {
            self.broadcasts.mark_winner_sent(id, self.clock.now()).await?;
            info!(broadcast_id = %id, "Winner phase dispatch started");
        }

        let deferred_left = self.store.deferred_count(id).await?;
        let winner_known = plan.is_none() || broadcast.winning_variation.is_some();
        if cursor >= total && deferred_left == 0 && winner_known {
            return self.complete(id).await;
        }

        if !winner_ready && cursor >= sample_end && stats.is_empty() {
            debug!(broadcast_id = %id, "Test sample exhausted, awaiting winner");
            return Ok(CycleReport::AwaitingWinner);
        }

        debug!(
            broadcast_id = %id,
            cursor,
            total,
            sent = stats.sent,
            failed = stats.failed,
            skipped = stats.skipped,
            deferred = stats.deferred,
            "Cycle processed batch"
        );
        Ok(CycleReport::Progress(stats))
    }

    /// Recompute the broadcast counters from send records and events
    pub async fn refresh_counters(&self, broadcast_id: BroadcastId) -> Result<BroadcastCounters> {
        let sends = self.store.send_counts(broadcast_id).await?;
        let events = self.events.counts_by_variation(broadcast_id).await?;

        let counters = BroadcastCounters {
            sent: sends.iter().map(|c| c.sent).sum(),
            failed: sends.iter().map(|c| c.failed).sum(),
            delivered: events.values().map(|c| c.delivered).sum(),
        };
        self.broadcasts.set_counters(broadcast_id, counters).await?;
        Ok(counters)
    }

    async fn complete(&self, broadcast_id: BroadcastId) -> Result<CycleReport> {
        let now = self.clock.now();
        match self
            .broadcasts
            .transition(broadcast_id, BroadcastStatus::Sending, BroadcastStatus::Sent, now)
            .await?
        {
            Some(_) => {
                info!(broadcast_id = %broadcast_id, "Broadcast sent");
                self.forget(broadcast_id).await;
                Ok(CycleReport::Completed)
            }
            None => {
                let status = self
                    .broadcasts
                    .get(broadcast_id)
                    .await?
                    .map_or(BroadcastStatus::Sending, |b| b.status);
                Ok(CycleReport::NotSending(status))
            }
        }
    }

    async fn fail_broadcast(&self, broadcast_id: BroadcastId, cause: &Error) {
        error!(broadcast_id = %broadcast_id, error = %cause, "Dispatch fault, failing broadcast");

        if let Err(e) = self
            .broadcasts
            .record_error(broadcast_id, &cause.to_string())
            .await
        {
            error!(broadcast_id = %broadcast_id, error = %e, "Failed to record broadcast error");
        }

        match self
            .broadcasts
            .transition(
                broadcast_id,
                BroadcastStatus::Sending,
                BroadcastStatus::Failed,
                self.clock.now(),
            )
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!(broadcast_id = %broadcast_id, "Broadcast no longer sending, not failed"),
            Err(e) => error!(broadcast_id = %broadcast_id, error = %e, "Failed to mark broadcast failed"),
        }

        self.forget(broadcast_id).await;
    }

    /// Drop per-broadcast state held in memory
    pub async fn forget(&self, broadcast_id: BroadcastId) {
        self.rate_limiter.forget(broadcast_id).await;
    }

    async fn guard(&self, broadcast_id: BroadcastId) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().await;
        guards.entry(broadcast_id).or_default().clone()
    }
}
