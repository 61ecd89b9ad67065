//! API routes

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{broadcasts, events, health, webhooks};
use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    let broadcast_routes = Router::new()
        .route(
            "/",
            get(broadcasts::list_broadcasts).post(broadcasts::create_broadcast),
        )
        .route(
            "/:id",
            get(broadcasts::get_broadcast)
                .put(broadcasts::update_broadcast)
                .delete(broadcasts::delete_broadcast),
        )
        .route("/:id/schedule", post(broadcasts::schedule_broadcast))
        .route("/:id/pause", post(broadcasts::pause_broadcast))
        .route("/:id/resume", post(broadcasts::resume_broadcast))
        .route("/:id/cancel", post(broadcasts::cancel_broadcast))
        .route("/:id/test-send", post(broadcasts::test_send))
        .route("/:id/metrics", get(broadcasts::broadcast_metrics))
        .route("/:id/select-winner", post(broadcasts::select_winner))
        .route("/:id/send-winner", post(broadcasts::send_winner));

    let api_v1 = Router::new()
        .nest("/workspaces/:workspace_id/broadcasts", broadcast_routes)
        .route(
            "/workspaces/:workspace_id/delivery-events",
            get(events::list_events),
        );

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .route("/webhooks/:provider", post(webhooks::receive))
        .route("/metrics", get(health::metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new()),
        )
        .with_state(state)
}

/// CORS for the console; an empty origin list allows any origin
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use mailcast_common::config::WebhookConfig;
    use mailcast_common::types::{ListId, WorkspaceId};
    use mailcast_core::dispatch::{InMemoryTemplates, MockTransport, Personalizer};
    use mailcast_core::{
        AudienceResolver, BroadcastManager, EngineMetrics, EventNormalizer, MetricsAggregator,
        Stores, SystemClock, WinnerSelector,
    };
    use mailcast_storage::models::Contact;
    use mailcast_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use uuid::Uuid;

    struct TestApp {
        server: TestServer,
        store: Arc<MemoryStore>,
        templates: Arc<InMemoryTemplates>,
        transport: Arc<MockTransport>,
        workspace_id: WorkspaceId,
        list_id: ListId,
    }

    fn app(webhooks: WebhookConfig) -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores::in_memory(store.clone());
        let templates = Arc::new(InMemoryTemplates::new());
        let transport = Arc::new(MockTransport::new());
        let clock = Arc::new(SystemClock);
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let personalizer = Arc::new(Personalizer::new("https://mail.example.com/u", "secret"));

        let aggregator = Arc::new(MetricsAggregator::new(
            stores.broadcasts.clone(),
            stores.dispatch.clone(),
            stores.events.clone(),
        ));
        let winners = Arc::new(WinnerSelector::new(
            stores.broadcasts.clone(),
            aggregator.clone(),
        ));
        let audience = Arc::new(AudienceResolver::new(
            stores.audience.clone(),
            stores.unsubscribes.clone(),
            stores.dispatch.clone(),
        ));
        let manager = Arc::new(BroadcastManager::new(
            stores.broadcasts.clone(),
            audience,
            templates.clone(),
            transport.clone(),
            personalizer,
            winners,
            clock.clone(),
        ));
        let normalizer = Arc::new(EventNormalizer::new(
            &stores,
            metrics.clone(),
            clock,
            webhooks,
        ));

        let state = AppState {
            manager,
            aggregator,
            normalizer,
            events: stores.events.clone(),
            metrics,
            db_pool: None,
        };

        TestApp {
            server: TestServer::new(create_router(state)).unwrap(),
            store,
            templates,
            transport,
            workspace_id: Uuid::new_v4(),
            list_id: Uuid::new_v4(),
        }
    }

    impl TestApp {
        fn broadcasts_path(&self) -> String {
            format!("/api/v1/workspaces/{}/broadcasts", self.workspace_id)
        }

        async fn create_broadcast(&self) -> Value {
            let template_id = Uuid::new_v4();
            self.templates
                .insert(template_id, 1, "<p>Hi {{first_name}}</p>")
                .await;

            let response = self
                .server
                .post(&self.broadcasts_path())
                .json(&json!({
                    "name": "Launch",
                    "audience": { "lists": [self.list_id] },
                    "schedule": { "send_immediately": true },
                    "variations": [{
                        "name": "A",
                        "template_id": template_id,
                        "subject": "Hello",
                        "from_email": "news@shop.example"
                    }]
                }))
                .await;
            assert_eq!(response.status_code(), StatusCode::CREATED);
            response.json::<Value>()
        }

        async fn postmark_delivery(&self, message_id: &str) -> Value {
            let response = self
                .server
                .post("/webhooks/postmark")
                .add_query_param("workspace_id", self.workspace_id)
                .json(&json!({
                    "RecordType": "Delivery",
                    "MessageID": message_id,
                    "Recipient": "reader@example.com",
                    "DeliveredAt": "2024-03-01T12:01:00Z"
                }))
                .await;
            assert_eq!(response.status_code(), StatusCode::OK);
            response.json::<Value>()
        }
    }

    #[tokio::test]
    async fn test_create_get_and_list_broadcasts() {
        let app = app(WebhookConfig::default());
        let created = app.create_broadcast().await;
        assert_eq!(created["status"], "draft");
        assert_eq!(created["progress_percentage"], 0.0);

        let id = created["id"].as_str().unwrap();
        let fetched = app
            .server
            .get(&format!("{}/{}", app.broadcasts_path(), id))
            .await
            .json::<Value>();
        assert_eq!(fetched["name"], "Launch");

        let list = app
            .server
            .get(&app.broadcasts_path())
            .add_query_param("status", "draft")
            .await
            .json::<Value>();
        assert_eq!(list["total"], 1);
        assert_eq!(list["data"][0]["id"], id);

        let bad = app
            .server
            .get(&app.broadcasts_path())
            .add_query_param("status", "bogus")
            .await;
        assert_eq!(bad.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_invalid_broadcast_is_rejected() {
        let app = app(WebhookConfig::default());
        let response = app
            .server
            .post(&app.broadcasts_path())
            .json(&json!({
                "name": "No audience",
                "audience": {},
                "variations": [{
                    "name": "A",
                    "template_id": Uuid::new_v4(),
                    "subject": "Hello",
                    "from_email": "news@shop.example"
                }]
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.json::<Value>()["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let app = app(WebhookConfig::default());
        app.store
            .add_list_member(app.workspace_id, app.list_id, Contact::new("a@example.com"))
            .await;
        let created = app.create_broadcast().await;
        let base = format!("{}/{}", app.broadcasts_path(), created["id"].as_str().unwrap());

        let scheduled = app.server.post(&format!("{}/schedule", base)).await;
        assert_eq!(scheduled.json::<Value>()["status"], "sending");

        let paused = app.server.post(&format!("{}/pause", base)).await;
        assert_eq!(paused.json::<Value>()["status"], "paused");

        let resumed = app.server.post(&format!("{}/resume", base)).await;
        assert_eq!(resumed.json::<Value>()["status"], "sending");

        let cancelled = app.server.post(&format!("{}/cancel", base)).await;
        assert_eq!(cancelled.json::<Value>()["status"], "cancelled");

        let again = app.server.post(&format!("{}/resume", base)).await;
        assert_eq!(again.status_code(), StatusCode::CONFLICT);
        assert_eq!(again.json::<Value>()["error"], "INVALID_TRANSITION");

        let deleted = app.server.delete(&base).await;
        assert_eq!(deleted.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_schedule_with_empty_audience_stays_draft() {
        let app = app(WebhookConfig::default());
        let created = app.create_broadcast().await;
        let base = format!("{}/{}", app.broadcasts_path(), created["id"].as_str().unwrap());

        let response = app.server.post(&format!("{}/schedule", base)).await;
        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.json::<Value>()["error"], "INVALID_AUDIENCE");

        let current = app.server.get(&base).await.json::<Value>();
        assert_eq!(current["status"], "draft");
    }

    #[tokio::test]
    async fn test_delete_draft() {
        let app = app(WebhookConfig::default());
        let created = app.create_broadcast().await;
        let path = format!("{}/{}", app.broadcasts_path(), created["id"].as_str().unwrap());

        let deleted = app.server.delete(&path).await;
        assert_eq!(deleted.status_code(), StatusCode::NO_CONTENT);

        let missing = app.server.get(&path).await;
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(missing.json::<Value>()["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_broadcast_is_scoped_to_workspace() {
        let app = app(WebhookConfig::default());
        let created = app.create_broadcast().await;

        let response = app
            .server
            .get(&format!(
                "/api/v1/workspaces/{}/broadcasts/{}",
                Uuid::new_v4(),
                created["id"].as_str().unwrap()
            ))
            .await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_test_send_returns_provider_id() {
        let app = app(WebhookConfig::default());
        let created = app.create_broadcast().await;

        let response = app
            .server
            .post(&format!(
                "{}/{}/test-send",
                app.broadcasts_path(),
                created["id"].as_str().unwrap()
            ))
            .json(&json!({ "email": "Tester@Example.com" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(!response.json::<Value>()["message_id"]
            .as_str()
            .unwrap()
            .is_empty());

        let sent = app.transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "tester@example.com");
    }

    #[tokio::test]
    async fn test_metrics_and_winner_endpoints() {
        let app = app(WebhookConfig::default());
        app.store
            .add_list_member(app.workspace_id, app.list_id, Contact::new("a@example.com"))
            .await;
        let created = app.create_broadcast().await;
        let base = format!("{}/{}", app.broadcasts_path(), created["id"].as_str().unwrap());

        let metrics = app
            .server
            .get(&format!("{}/metrics", base))
            .await
            .json::<Value>();
        assert_eq!(metrics["sent"], 0);
        assert_eq!(metrics["variations"].as_array().unwrap().len(), 1);

        let decision = app
            .server
            .post(&format!("{}/select-winner", base))
            .await
            .json::<Value>();
        assert_eq!(decision["decision"], "not_testing");
    }

    #[tokio::test]
    async fn test_webhook_records_then_deduplicates() {
        let app = app(WebhookConfig::default());

        let first = app.postmark_delivery("pm-1").await;
        assert_eq!(first["recorded"], 1);
        let second = app.postmark_delivery("pm-1").await;
        assert_eq!(second["recorded"], 0);
        assert_eq!(second["duplicates"], 1);
    }

    #[tokio::test]
    async fn test_malformed_webhook_is_acknowledged() {
        let app = app(WebhookConfig::default());
        let response = app
            .server
            .post("/webhooks/postmark")
            .add_query_param("workspace_id", app.workspace_id)
            .json(&json!({ "RecordType": "Delivery" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let ack = response.json::<Value>();
        assert_eq!(ack["recorded"], 0);
        assert!(ack["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_provider_is_acknowledged() {
        let app = app(WebhookConfig::default());
        let response = app
            .server
            .post("/webhooks/carrier-pigeon")
            .add_query_param("workspace_id", app.workspace_id)
            .json(&json!({}))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(response.json::<Value>()["error"].is_string());
    }

    #[tokio::test]
    async fn test_non_json_webhook_is_acknowledged() {
        let app = app(WebhookConfig::default());
        let response = app
            .server
            .post("/webhooks/postmark")
            .add_query_param("workspace_id", app.workspace_id)
            .text("RecordType=Delivery&MessageID=pm-1")
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let ack = response.json::<Value>();
        assert_eq!(ack["recorded"], 0);
        assert!(ack["error"].as_str().unwrap().contains("not JSON"));
    }

    #[tokio::test]
    async fn test_webhook_without_workspace_is_acknowledged() {
        let app = app(WebhookConfig::default());
        let response = app
            .server
            .post("/webhooks/postmark")
            .json(&json!({
                "RecordType": "Delivery",
                "MessageID": "pm-1",
                "Recipient": "reader@example.com"
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let ack = response.json::<Value>();
        assert_eq!(ack["recorded"], 0);
        assert!(ack["error"].as_str().unwrap().contains("workspace_id"));
    }

    #[tokio::test]
    async fn test_mailgun_bad_signature_is_unauthorized() {
        let app = app(WebhookConfig {
            mailgun_signing_key: Some("key-123".to_string()),
            ..WebhookConfig::default()
        });
        let response = app
            .server
            .post("/webhooks/mailgun")
            .add_query_param("workspace_id", app.workspace_id)
            .json(&json!({
                "signature": {
                    "timestamp": "1709294400",
                    "token": "abc",
                    "signature": "00"
                },
                "event-data": {
                    "event": "delivered",
                    "timestamp": 1709294400.0,
                    "recipient": "reader@example.com",
                    "message": { "headers": { "message-id": "mg-1" } }
                }
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.json::<Value>()["error"], "INVALID_SIGNATURE");
    }

    #[tokio::test]
    async fn test_delivery_events_paginate_with_cursor() {
        let app = app(WebhookConfig::default());
        for id in ["pm-1", "pm-2", "pm-3"] {
            app.postmark_delivery(id).await;
        }
        let path = format!("/api/v1/workspaces/{}/delivery-events", app.workspace_id);

        let page = app
            .server
            .get(&path)
            .add_query_param("limit", 2)
            .await
            .json::<Value>();
        assert_eq!(page["data"].as_array().unwrap().len(), 2);
        assert_eq!(page["has_more"], true);
        assert_eq!(page["data"][0]["message_id"], "pm-1");

        let cursor = page["cursor"].as_str().unwrap().to_string();
        let next = app
            .server
            .get(&path)
            .add_query_param("limit", 2)
            .add_query_param("cursor", cursor)
            .await
            .json::<Value>();
        assert_eq!(next["data"].as_array().unwrap().len(), 1);
        assert_eq!(next["data"][0]["message_id"], "pm-3");
        assert_eq!(next["has_more"], false);
        assert!(next["cursor"].is_null());

        let filtered = app
            .server
            .get(&path)
            .add_query_param("message_id", "pm-2")
            .await
            .json::<Value>();
        assert_eq!(filtered["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_and_prometheus() {
        let app = app(WebhookConfig::default());

        let health = app.server.get("/health").await.json::<Value>();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["checks"]["database"]["status"], "in_memory");

        let ready = app.server.get("/health/ready").await;
        assert_eq!(ready.status_code(), StatusCode::OK);

        app.postmark_delivery("pm-1").await;
        let text = app.server.get("/metrics").await.text();
        assert!(text.contains("mailcast_webhook_events_total"));
    }
}
