//! Broadcast Manager - Handles broadcast lifecycle requests

use super::state::ensure_transition;
use super::validation::{validate_for_schedule, validate_settings};
use crate::audience::AudienceResolver;
use crate::clock::Clock;
use crate::dispatch::message::compose;
use crate::dispatch::template::{Personalizer, TemplateRenderer};
use crate::dispatch::transport::{Transport, TransportError};
use crate::winner::{WinnerDecision, WinnerSelector, WinnerTrigger};
use chrono::{DateTime, Utc};
use mailcast_common::types::{normalize_email, BroadcastId, EmailAddress, VariationId, WorkspaceId};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{
    Broadcast, BroadcastStatus, Contact, CreateBroadcast, CreateVariation, UpdateBroadcast,
};
use mailcast_storage::repository::BroadcastRepository;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_TRANSPORT_TIMEOUT_SECS: u64 = 30;

/// Broadcast Manager - Owns the broadcast state machine
pub struct BroadcastManager {
    broadcasts: Arc<dyn BroadcastRepository>,
    audience: Arc<AudienceResolver>,
    templates: Arc<dyn TemplateRenderer>,
    transport: Arc<dyn Transport>,
    personalizer: Arc<Personalizer>,
    winners: Arc<WinnerSelector>,
    clock: Arc<dyn Clock>,
    transport_timeout: Duration,
}

impl BroadcastManager {
    pub fn new(
        broadcasts: Arc<dyn BroadcastRepository>,
        audience: Arc<AudienceResolver>,
        templates: Arc<dyn TemplateRenderer>,
        transport: Arc<dyn Transport>,
        personalizer: Arc<Personalizer>,
        winners: Arc<WinnerSelector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broadcasts,
            audience,
            templates,
            transport,
            personalizer,
            winners,
            clock,
            transport_timeout: Duration::from_secs(DEFAULT_TRANSPORT_TIMEOUT_SECS),
        }
    }

    /// Deadline for a single test send
    pub fn with_transport_timeout(mut self, secs: u64) -> Self {
        self.transport_timeout = Duration::from_secs(secs.max(1));
        self
    }

    /// Create a draft broadcast
    pub async fn create(&self, input: CreateBroadcast) -> Result<Broadcast> {
        validate_settings(
            &input.name,
            &input.audience,
            &input.schedule,
            &input.test_settings,
            &input.variations,
        )?;

        let broadcast = self.broadcasts.create(input).await?;
        info!(
            broadcast_id = %broadcast.id,
            workspace_id = %broadcast.workspace_id,
            variations = broadcast.variations.len(),
            "Broadcast created"
        );
        Ok(broadcast)
    }

    pub async fn get(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<Broadcast> {
        self.broadcasts
            .get_in_workspace(workspace_id, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("broadcast {}", id)))
    }

    /// One page of broadcasts and the total matching count
    pub async fn list(
        &self,
        workspace_id: WorkspaceId,
        status: Option<BroadcastStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Broadcast>, i64)> {
        let items = self
            .broadcasts
            .list(workspace_id, status, limit, offset)
            .await?;
        let total = self.broadcasts.count(workspace_id, status).await?;
        Ok((items, total))
    }

    /// Edit a draft broadcast
    pub async fn update(
        &self,
        workspace_id: WorkspaceId,
        id: BroadcastId,
        input: UpdateBroadcast,
    ) -> Result<Broadcast> {
        let current = self.get(workspace_id, id).await?;
        if current.status != BroadcastStatus::Draft {
            return Err(Error::Validation(format!(
                "only draft broadcasts can be edited, broadcast is {}",
                current.status
            )));
        }

        let variations: Vec<CreateVariation> = match &input.variations {
            Some(variations) => variations.clone(),
            None => current
                .ordered_variations()
                .into_iter()
                .map(|v| CreateVariation {
                    name: v.name.clone(),
                    template_id: v.template_id,
                    template_version: v.template_version,
                    subject: v.subject.clone(),
                    from_name: v.from_name.clone(),
                    from_email: v.from_email.clone(),
                    reply_to: v.reply_to.clone(),
                })
                .collect(),
        };
        validate_settings(
            input.name.as_deref().unwrap_or(&current.name),
            input.audience.as_ref().unwrap_or(&current.audience),
            input.schedule.as_ref().unwrap_or(&current.schedule),
            input.test_settings.as_ref().unwrap_or(&current.test_settings),
            &variations,
        )?;

        self.broadcasts
            .update(workspace_id, id, input)
            .await?
            .ok_or_else(|| Error::Validation("broadcast is no longer a draft".to_string()))
    }

    /// Delete a draft broadcast
    pub async fn delete(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<()> {
        let current = self.get(workspace_id, id).await?;
        if current.status != BroadcastStatus::Draft {
            return Err(Error::Validation(format!(
                "only draft broadcasts can be deleted, broadcast is {}",
                current.status
            )));
        }
        if !self.broadcasts.delete(workspace_id, id).await? {
            return Err(Error::Validation("broadcast is no longer a draft".to_string()));
        }
        info!(broadcast_id = %id, "Broadcast deleted");
        Ok(())
    }

    /// Move a draft to scheduled; an immediate broadcast starts sending at once.
    ///
    /// The audience is resolved up front so an empty one is rejected while
    /// the broadcast is still a draft.
    pub async fn schedule(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<Broadcast> {
        let broadcast = self.get(workspace_id, id).await?;
        ensure_transition(broadcast.status, BroadcastStatus::Scheduled)?;
        validate_for_schedule(&broadcast, self.clock.now())?;
        self.audience
            .resolve(broadcast.workspace_id, &broadcast.audience)
            .await?;

        let scheduled = self.apply(&broadcast, BroadcastStatus::Scheduled).await?;
        if scheduled.schedule.send_immediately {
            return self.apply(&scheduled, BroadcastStatus::Sending).await;
        }
        Ok(scheduled)
    }

    /// Stop sending at the next batch boundary
    pub async fn pause(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<Broadcast> {
        let broadcast = self.get(workspace_id, id).await?;
        self.apply(&broadcast, BroadcastStatus::Paused).await
    }

    /// Continue from the persisted cursor
    pub async fn resume(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<Broadcast> {
        let broadcast = self.get(workspace_id, id).await?;
        self.apply(&broadcast, BroadcastStatus::Sending).await
    }

    pub async fn cancel(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<Broadcast> {
        let broadcast = self.get(workspace_id, id).await?;
        self.apply(&broadcast, BroadcastStatus::Cancelled).await
    }

    /// Mark a sending broadcast failed with the cause on `last_error`
    pub async fn fail(&self, id: BroadcastId, message: &str) -> Result<Broadcast> {
        let broadcast = self.load(id).await?;
        ensure_transition(broadcast.status, BroadcastStatus::Failed)?;
        self.broadcasts.record_error(id, message).await?;
        self.apply(&broadcast, BroadcastStatus::Failed).await
    }

    /// Finish a sending broadcast
    pub async fn complete(&self, id: BroadcastId) -> Result<Broadcast> {
        let broadcast = self.load(id).await?;
        self.apply(&broadcast, BroadcastStatus::Sent).await
    }

    /// Promote scheduled broadcasts whose time has come
    pub async fn start_due(&self, now: DateTime<Utc>) -> Result<Vec<Broadcast>> {
        let scheduled = self
            .broadcasts
            .list_by_status(BroadcastStatus::Scheduled)
            .await?;

        let mut started = Vec::new();
        for broadcast in scheduled {
            let due = broadcast.schedule.send_immediately
                || broadcast.schedule.scheduled_time.map_or(false, |at| at <= now);
            if !due {
                continue;
            }

            match self
                .broadcasts
                .transition(
                    broadcast.id,
                    BroadcastStatus::Scheduled,
                    BroadcastStatus::Sending,
                    now,
                )
                .await?
            {
                Some(updated) => {
                    info!(
                        broadcast_id = %updated.id,
                        scheduled_time = ?updated.schedule.scheduled_time,
                        "Starting scheduled broadcast"
                    );
                    started.push(updated);
                }
                None => warn!(broadcast_id = %broadcast.id, "Broadcast changed before it could start"),
            }
        }

        Ok(started)
    }

    /// Send one variation to one address.
    ///
    /// Bypasses scheduling, send records and metrics. Returns the provider
    /// message id.
    pub async fn send_to_individual(
        &self,
        workspace_id: WorkspaceId,
        id: BroadcastId,
        variation_id: Option<VariationId>,
        email: &str,
    ) -> Result<String> {
        let broadcast = self.get(workspace_id, id).await?;
        if EmailAddress::parse(email).is_none() {
            return Err(Error::Validation(format!("invalid recipient address: {}", email)));
        }

        let variation = match variation_id {
            Some(variation_id) => broadcast.variation(variation_id).ok_or_else(|| {
                Error::NotFound(format!("variation {}", variation_id))
            })?,
            None => broadcast
                .ordered_variations()
                .into_iter()
                .next()
                .ok_or_else(|| Error::Validation("broadcast has no variations".to_string()))?,
        };

        let html = self
            .templates
            .render(variation.template_id, variation.template_version)
            .await?;
        let contact = Contact::new(normalize_email(email));
        let message = compose(&self.personalizer, variation, &html, &contact, None);

        let provider_message_id =
            tokio::time::timeout(self.transport_timeout, self.transport.send(&message))
                .await
                .map_err(|_| {
                    TransportError::retryable(format!(
                        "transport timed out after {}s",
                        self.transport_timeout.as_secs()
                    ))
                })??;
        info!(
            broadcast_id = %id,
            variation_id = %variation.id,
            recipient = %contact.email,
            "Test send delivered to transport"
        );
        Ok(provider_message_id)
    }

    /// Manual winner selection
    pub async fn select_winner(
        &self,
        workspace_id: WorkspaceId,
        id: BroadcastId,
        variation_id: Option<VariationId>,
    ) -> Result<WinnerDecision> {
        self.get(workspace_id, id).await?;
        self.winners
            .evaluate(id, self.clock.now(), WinnerTrigger::Manual { variation_id })
            .await
    }

    /// Operator release of the winner phase
    pub async fn send_winner(&self, workspace_id: WorkspaceId, id: BroadcastId) -> Result<Broadcast> {
        self.get(workspace_id, id).await?;
        self.winners.release(id).await
    }

    async fn load(&self, id: BroadcastId) -> Result<Broadcast> {
        self.broadcasts
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("broadcast {}", id)))
    }

    /// Compare-and-set transition from the broadcast's current status
    async fn apply(&self, broadcast: &Broadcast, to: BroadcastStatus) -> Result<Broadcast> {
        ensure_transition(broadcast.status, to)?;

        match self
            .broadcasts
            .transition(broadcast.id, broadcast.status, to, self.clock.now())
            .await?
        {
            Some(updated) => {
                info!(
                    broadcast_id = %broadcast.id,
                    from = %broadcast.status,
                    to = %to,
                    "Broadcast transitioned"
                );
                Ok(updated)
            }
            None => {
                let current = self
                    .broadcasts
                    .get(broadcast.id)
                    .await?
                    .map_or(broadcast.status, |b| b.status);
                Err(Error::InvalidTransition {
                    from: current.to_string(),
                    to: to.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatch::template::InMemoryTemplates;
    use crate::dispatch::transport::MockTransport;
    use crate::metrics::MetricsAggregator;
    use chrono::Duration;
    use mailcast_storage::models::{AudienceSettings, ScheduleSettings, TestSettings};
    use mailcast_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    const LIST_ID: Uuid = Uuid::from_u128(0x5eed);

    struct Fixture {
        ws: WorkspaceId,
        store: Arc<MemoryStore>,
        templates: Arc<InMemoryTemplates>,
        transport: Arc<MockTransport>,
        clock: Arc<ManualClock>,
        manager: BroadcastManager,
    }

    async fn fixture() -> Fixture {
        fixture_with(MockTransport::new()).await
    }

    /// Manager over a fresh store whose workspace list holds one contact
    async fn fixture_with(transport: MockTransport) -> Fixture {
        let ws = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        store
            .add_list_member(ws, LIST_ID, Contact::new("reader@example.com"))
            .await;
        let templates = Arc::new(InMemoryTemplates::new());
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let aggregator = Arc::new(MetricsAggregator::new(store.clone(), store.clone(), store.clone()));
        let winners = Arc::new(WinnerSelector::new(store.clone(), aggregator));
        let audience = Arc::new(AudienceResolver::new(store.clone(), store.clone(), store.clone()));
        let manager = BroadcastManager::new(
            store.clone(),
            audience,
            templates.clone(),
            transport.clone(),
            Arc::new(Personalizer::new("https://example.com/u", "secret")),
            winners,
            clock.clone(),
        );
        Fixture {
            ws,
            store,
            templates,
            transport,
            clock,
            manager,
        }
    }

    fn input(workspace_id: WorkspaceId, schedule: ScheduleSettings) -> CreateBroadcast {
        CreateBroadcast {
            workspace_id,
            name: "Newsletter".to_string(),
            audience: AudienceSettings {
                lists: vec![LIST_ID],
                ..Default::default()
            },
            schedule,
            test_settings: TestSettings::default(),
            variations: vec![CreateVariation {
                name: "A".to_string(),
                template_id: Uuid::new_v4(),
                template_version: 1,
                subject: "Hello {{first_name}}".to_string(),
                from_name: Some("Shop".to_string()),
                from_email: "news@shop.example".to_string(),
                reply_to: None,
            }],
        }
    }

    fn immediate() -> ScheduleSettings {
        ScheduleSettings {
            send_immediately: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_settings() {
        let f = fixture().await;
        let mut bad = input(Uuid::new_v4(), immediate());
        bad.variations.clear();

        let err = f.manager.create(bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_schedule_immediately_starts_sending() {
        let f = fixture().await;
        let ws = f.ws;
        let broadcast = f.manager.create(input(ws, immediate())).await.unwrap();
        assert_eq!(broadcast.status, BroadcastStatus::Draft);

        let sending = f.manager.schedule(ws, broadcast.id).await.unwrap();
        assert_eq!(sending.status, BroadcastStatus::Sending);
        assert!(sending.scheduled_at.is_some());
        assert!(sending.started_at.is_some());
    }

    #[tokio::test]
    async fn test_schedule_rejects_past_time() {
        let f = fixture().await;
        let ws = f.ws;
        let past = ScheduleSettings {
            scheduled_time: Some(f.clock.now() - Duration::minutes(5)),
            ..Default::default()
        };
        let broadcast = f.manager.create(input(ws, past)).await.unwrap();

        let err = f.manager.schedule(ws, broadcast.id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            f.manager.get(ws, broadcast.id).await.unwrap().status,
            BroadcastStatus::Draft
        );
    }

    #[tokio::test]
    async fn test_schedule_rejects_empty_audience_in_draft() {
        let f = fixture().await;
        let ws = f.ws;
        let mut empty = input(ws, immediate());
        empty.audience.lists = vec![Uuid::new_v4()];
        let broadcast = f.manager.create(empty).await.unwrap();

        let err = f.manager.schedule(ws, broadcast.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAudience(_)));

        let current = f.manager.get(ws, broadcast.id).await.unwrap();
        assert_eq!(current.status, BroadcastStatus::Draft);
        assert!(current.scheduled_at.is_none());
    }

    #[tokio::test]
    async fn test_start_due_promotes_only_due_broadcasts() {
        let f = fixture().await;
        let ws = f.ws;
        let soon = f.clock.now() + Duration::minutes(10);
        let later = f.clock.now() + Duration::hours(3);

        let first = f
            .manager
            .create(input(ws, ScheduleSettings { scheduled_time: Some(soon), ..Default::default() }))
            .await
            .unwrap();
        let second = f
            .manager
            .create(input(ws, ScheduleSettings { scheduled_time: Some(later), ..Default::default() }))
            .await
            .unwrap();
        f.manager.schedule(ws, first.id).await.unwrap();
        f.manager.schedule(ws, second.id).await.unwrap();

        assert!(f.manager.start_due(f.clock.now()).await.unwrap().is_empty());

        f.clock.advance(Duration::minutes(15));
        let started = f.manager.start_due(f.clock.now()).await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, first.id);
        assert_eq!(started[0].status, BroadcastStatus::Sending);
    }

    #[tokio::test]
    async fn test_lifecycle_rejects_illegal_edges() {
        let f = fixture().await;
        let ws = f.ws;
        let broadcast = f.manager.create(input(ws, immediate())).await.unwrap();

        // Draft cannot pause
        let err = f.manager.pause(ws, broadcast.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        f.manager.schedule(ws, broadcast.id).await.unwrap();
        let paused = f.manager.pause(ws, broadcast.id).await.unwrap();
        assert_eq!(paused.status, BroadcastStatus::Paused);
        assert!(paused.paused_at.is_some());

        let resumed = f.manager.resume(ws, broadcast.id).await.unwrap();
        assert_eq!(resumed.status, BroadcastStatus::Sending);

        let sent = f.manager.complete(broadcast.id).await.unwrap();
        assert_eq!(sent.status, BroadcastStatus::Sent);
        assert!(sent.completed_at.is_some());

        // Sent is terminal
        let err = f.manager.resume(ws, broadcast.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        let err = f.manager.cancel(ws, broadcast.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_draft_sets_only_cancelled_at() {
        let f = fixture().await;
        let ws = f.ws;
        let broadcast = f.manager.create(input(ws, immediate())).await.unwrap();

        let cancelled = f.manager.cancel(ws, broadcast.id).await.unwrap();
        assert_eq!(cancelled.status, BroadcastStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert!(cancelled.scheduled_at.is_none());
        assert!(cancelled.started_at.is_none());
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let f = fixture().await;
        let ws = f.ws;
        let broadcast = f.manager.create(input(ws, immediate())).await.unwrap();

        let err = f.manager.fail(broadcast.id, "boom").await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        f.manager.schedule(ws, broadcast.id).await.unwrap();
        let failed = f.manager.fail(broadcast.id, "boom").await.unwrap();
        assert_eq!(failed.status, BroadcastStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_update_and_delete_only_in_draft() {
        let f = fixture().await;
        let ws = f.ws;
        let broadcast = f.manager.create(input(ws, immediate())).await.unwrap();

        let renamed = f
            .manager
            .update(
                ws,
                broadcast.id,
                UpdateBroadcast {
                    name: Some("Renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Renamed");

        f.manager.schedule(ws, broadcast.id).await.unwrap();
        let err = f
            .manager
            .update(ws, broadcast.id, UpdateBroadcast::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(f.manager.delete(ws, broadcast.id).await.is_err());

        let draft = f.manager.create(input(ws, immediate())).await.unwrap();
        f.manager.delete(ws, draft.id).await.unwrap();
        assert!(matches!(
            f.manager.get(ws, draft.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_other_workspace_cannot_see_broadcast() {
        let f = fixture().await;
        let broadcast = f.manager.create(input(Uuid::new_v4(), immediate())).await.unwrap();

        let err = f.manager.get(Uuid::new_v4(), broadcast.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_send_to_individual_bypasses_records() {
        let f = fixture().await;
        let ws = f.ws;
        let broadcast = f.manager.create(input(ws, immediate())).await.unwrap();
        let variation = &broadcast.variations[0];
        f.templates
            .insert(variation.template_id, 1, "<p>Hi {{email}}</p>")
            .await;

        let message_id = f
            .manager
            .send_to_individual(ws, broadcast.id, None, " Tester@Example.com ")
            .await
            .unwrap();

        let sent = f.transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "tester@example.com");
        assert_eq!(sent[0].message_id, message_id);
        assert!(sent[0].html_body.contains("Hi tester@example.com"));
        assert!(f.store.send_records(broadcast.id).await.is_empty());

        let err = f
            .manager
            .send_to_individual(ws, broadcast.id, None, "not-an-address")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_individual_times_out() {
        let slow = MockTransport::new().with_delay(std::time::Duration::from_secs(60));
        let f = fixture_with(slow).await;
        let ws = f.ws;
        let broadcast = f.manager.create(input(ws, immediate())).await.unwrap();
        f.templates
            .insert(broadcast.variations[0].template_id, 1, "<p>Hi</p>")
            .await;
        let manager = f.manager.with_transport_timeout(5);

        let err = manager
            .send_to_individual(ws, broadcast.id, None, "tester@example.com")
            .await
            .unwrap_err();
        match err {
            Error::Transport { retryable, message } => {
                assert!(retryable);
                assert!(message.contains("timed out after 5s"));
            }
            other => panic!("expected a transport error, got {:?}", other),
        }
        assert!(f.transport.sent().await.is_empty());
    }
}
