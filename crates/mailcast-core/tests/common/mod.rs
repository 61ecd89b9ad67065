//! Shared wiring for engine integration tests
#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use mailcast_common::config::{DispatchConfig, WebhookConfig};
use mailcast_common::types::{BroadcastId, ListId, TemplateId, WorkspaceId};
use mailcast_core::dispatch::{InMemoryTemplates, MockTransport, Personalizer};
use mailcast_core::{
    AudienceResolver, BroadcastManager, CycleReport, EngineMetrics, EventNormalizer, ManualClock, MetricsAggregator,
    Orchestrator, Stores, WinnerSelector,
};
use mailcast_storage::models::{
    AudienceSettings, Broadcast, Contact, CreateBroadcast, CreateVariation, ScheduleSettings,
    TestSettings,
};
use mailcast_storage::repository::BroadcastRepository;
use mailcast_storage::MemoryStore;
use std::sync::Arc;
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub templates: Arc<InMemoryTemplates>,
    pub transport: Arc<MockTransport>,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<EngineMetrics>,
    pub manager: Arc<BroadcastManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub winners: Arc<WinnerSelector>,
    pub aggregator: Arc<MetricsAggregator>,
    pub normalizer: EventNormalizer,
    pub workspace_id: WorkspaceId,
    pub list_id: ListId,
}

pub fn config() -> DispatchConfig {
    DispatchConfig {
        batch_size: 100,
        worker_concurrency: 4,
        max_attempts: 3,
        retry_base_ms: 1,
        retry_max_ms: 5,
        transport_timeout_secs: 5,
        ..DispatchConfig::default()
    }
}

impl Harness {
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_transport(config, MockTransport::new())
    }

    pub fn with_transport(config: DispatchConfig, transport: MockTransport) -> Self {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores::in_memory(store.clone());
        let templates = Arc::new(InMemoryTemplates::new());
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let personalizer = Arc::new(Personalizer::new("https://mail.example.com/u", "secret"));

        let aggregator = Arc::new(MetricsAggregator::new(
            stores.broadcasts.clone(),
            stores.dispatch.clone(),
            stores.events.clone(),
        ));
        let winners = Arc::new(WinnerSelector::new(stores.broadcasts.clone(), aggregator.clone()));
        let audience = Arc::new(AudienceResolver::new(
            stores.audience.clone(),
            stores.unsubscribes.clone(),
            stores.dispatch.clone(),
        ));
        let manager = Arc::new(
            BroadcastManager::new(
                stores.broadcasts.clone(),
                audience,
                templates.clone(),
                transport.clone(),
                personalizer.clone(),
                winners.clone(),
                clock.clone(),
            )
            .with_transport_timeout(config.transport_timeout_secs),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            stores.clone(),
            templates.clone(),
            transport.clone(),
            personalizer,
            clock.clone(),
            metrics.clone(),
            &config,
        ));
        let normalizer = EventNormalizer::new(
            &stores,
            metrics.clone(),
            clock.clone(),
            WebhookConfig::default(),
        );

        Self {
            store,
            templates,
            transport,
            clock,
            metrics,
            manager,
            orchestrator,
            winners,
            aggregator,
            normalizer,
            workspace_id: Uuid::new_v4(),
            list_id: Uuid::new_v4(),
        }
    }

    /// Add `count` contacts named user000@example.com, user001@example.com, ...
    pub async fn add_contacts(&self, count: usize) {
        for i in 0..count {
            self.add_contact(Contact::new(format!("user{:03}@example.com", i)))
                .await;
        }
    }

    pub async fn add_contact(&self, contact: Contact) {
        self.store
            .add_list_member(self.workspace_id, self.list_id, contact)
            .await;
    }

    pub fn variation(name: &str, template_id: TemplateId) -> CreateVariation {
        CreateVariation {
            name: name.to_string(),
            template_id,
            template_version: 1,
            subject: format!("Subject {}", name),
            from_name: Some("Shop".to_string()),
            from_email: "news@shop.example".to_string(),
            reply_to: None,
        }
    }

    /// Single-variation broadcast that sends immediately
    pub fn input(&self) -> CreateBroadcast {
        CreateBroadcast {
            workspace_id: self.workspace_id,
            name: "Spring sale".to_string(),
            audience: AudienceSettings {
                lists: vec![self.list_id],
                ..Default::default()
            },
            schedule: ScheduleSettings {
                send_immediately: true,
                ..Default::default()
            },
            test_settings: TestSettings::default(),
            variations: vec![Self::variation("A", Uuid::new_v4())],
        }
    }

    /// Create the broadcast, register its templates and start sending
    pub async fn launch(&self, input: CreateBroadcast) -> Broadcast {
        for variation in &input.variations {
            self.templates
                .insert(
                    variation.template_id,
                    variation.template_version,
                    "<p>Hello {{first_name}}</p>",
                )
                .await;
        }
        let broadcast = self.manager.create(input).await.unwrap();
        self.manager
            .schedule(self.workspace_id, broadcast.id)
            .await
            .unwrap()
    }

    pub async fn broadcast(&self, id: BroadcastId) -> Broadcast {
        BroadcastRepository::get(self.store.as_ref(), id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Run cycles until one completes or `max_cycles` is reached
    pub async fn run_to_completion(&self, id: BroadcastId, max_cycles: usize) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        for _ in 0..max_cycles {
            let report = self.orchestrator.run_cycle(id).await.unwrap();
            let done = report == CycleReport::Completed;
            reports.push(report);
            if done {
                break;
            }
        }
        reports
    }
}
