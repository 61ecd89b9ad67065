//! Event Normalizer - Turns provider webhooks into stored delivery events

use super::payload::{ParsedEvent, ProviderPayload};
use super::ses::SnsMessage;
use super::signature::verify_mailgun;
use crate::clock::Clock;
use crate::stores::Stores;
use crate::telemetry::EngineMetrics;
use mailcast_common::config::WebhookConfig;
use mailcast_common::types::{normalize_message_id, IntegrationId, WorkspaceId};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{
    BounceType, CreateUnsubscribe, DeliveryEvent, DeliveryEventType, EmailProvider,
    NewDeliveryEvent, UnsubscribeSource,
};
use mailcast_storage::repository::{DeliveryEventRepository, DispatchStore, UnsubscribeRepository};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of ingesting one canonical event
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Recorded(DeliveryEvent),
    /// Same (provider, message id, event type) was stored before
    Duplicate {
        message_id: String,
        event_type: DeliveryEventType,
    },
}

/// Event Normalizer
pub struct EventNormalizer {
    events: Arc<dyn DeliveryEventRepository>,
    dispatch: Arc<dyn DispatchStore>,
    unsubscribes: Arc<dyn UnsubscribeRepository>,
    metrics: Arc<EngineMetrics>,
    clock: Arc<dyn Clock>,
    config: WebhookConfig,
    http_client: Client,
}

impl EventNormalizer {
    pub fn new(
        stores: &Stores,
        metrics: Arc<EngineMetrics>,
        clock: Arc<dyn Clock>,
        config: WebhookConfig,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            events: stores.events.clone(),
            dispatch: stores.dispatch.clone(),
            unsubscribes: stores.unsubscribes.clone(),
            metrics,
            clock,
            config,
            http_client,
        }
    }

    /// Replace the HTTP client used for SNS confirmations
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http_client = client;
        self
    }

    /// Ingest one webhook body.
    ///
    /// Entries that cannot be normalized are skipped with a warning; the
    /// call only fails when nothing in the body could be normalized.
    pub async fn ingest(
        &self,
        workspace_id: WorkspaceId,
        provider: EmailProvider,
        integration_id: Option<IntegrationId>,
        body: &Value,
    ) -> Result<Vec<IngestOutcome>> {
        let provider_label = provider.to_string();

        let payload = match ProviderPayload::parse(provider, body) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.record_webhook(&provider_label, "malformed");
                return Err(e);
            }
        };

        if let Err(e) = self.verify(&payload) {
            self.metrics.record_webhook(&provider_label, "rejected");
            return Err(e);
        }

        if let ProviderPayload::Ses(SnsMessage::SubscriptionConfirmation {
            topic_arn,
            subscribe_url,
        }) = &payload
        {
            self.confirm_subscription(topic_arn.as_deref(), subscribe_url)
                .await?;
            return Ok(Vec::new());
        }

        let entries = payload.events();
        let total = entries.len();
        let mut parsed = Vec::with_capacity(total);
        let mut first_error = None;

        for entry in entries {
            match entry {
                Ok(event) => parsed.push(event),
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Skipping unusable webhook entry");
                    self.metrics.record_webhook(&provider_label, "malformed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if parsed.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let mut outcomes = Vec::with_capacity(parsed.len());
        for event in parsed {
            let outcome = self
                .record(workspace_id, provider, integration_id, event)
                .await?;
            let label = match outcome {
                IngestOutcome::Recorded(_) => "recorded",
                IngestOutcome::Duplicate { .. } => "duplicate",
            };
            self.metrics.record_webhook(&provider_label, label);
            outcomes.push(outcome);
        }

        debug!(provider = %provider, entries = total, stored = outcomes.len(), "Webhook ingested");
        Ok(outcomes)
    }

    fn verify(&self, payload: &ProviderPayload) -> Result<()> {
        let ProviderPayload::Mailgun(webhook) = payload else {
            return Ok(());
        };
        let Some(key) = self.config.mailgun_signing_key.as_deref() else {
            return Ok(());
        };

        let signature = webhook
            .signature
            .as_ref()
            .ok_or_else(|| Error::Signature("mailgun webhook is unsigned".to_string()))?;
        verify_mailgun(key, &signature.timestamp, &signature.token, &signature.signature)
    }

    async fn confirm_subscription(&self, topic_arn: Option<&str>, url: &str) -> Result<()> {
        if !self.config.sns_auto_confirm {
            info!(topic_arn = ?topic_arn, "SNS subscription confirmation received, auto-confirm disabled");
            return Ok(());
        }

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("SNS confirmation failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "SNS confirmation returned {}",
                response.status()
            )));
        }

        info!(topic_arn = ?topic_arn, "Confirmed SNS subscription");
        Ok(())
    }

    async fn record(
        &self,
        workspace_id: WorkspaceId,
        provider: EmailProvider,
        integration_id: Option<IntegrationId>,
        mut event: ParsedEvent,
    ) -> Result<IngestOutcome> {
        if event.broadcast_id.is_none() && event.transactional_id.is_none() {
            event.broadcast_id = self.broadcast_for_message(&event.message_id).await?;
        }

        let input = NewDeliveryEvent {
            workspace_id,
            provider,
            integration_id,
            event_type: event.event_type,
            recipient_email: event.recipient_email,
            message_id: normalize_message_id(&event.message_id),
            broadcast_id: event.broadcast_id,
            transactional_id: event.transactional_id,
            timestamp: event.timestamp.unwrap_or_else(|| self.clock.now()),
            bounce: event.bounce,
            complaint_feedback: event.complaint_feedback,
            link: event.link,
            raw_payload: event.raw,
        };
        let message_id = input.message_id.clone();
        let event_type = input.event_type;

        match self.events.insert(input).await? {
            Some(stored) => {
                self.suppress_if_needed(&stored).await?;
                Ok(IngestOutcome::Recorded(stored))
            }
            None => {
                debug!(message_id = %message_id, event_type = %event_type, "Duplicate delivery event");
                Ok(IngestOutcome::Duplicate {
                    message_id,
                    event_type,
                })
            }
        }
    }

    /// Match a provider message id against our send records
    async fn broadcast_for_message(&self, message_id: &str) -> Result<Option<uuid::Uuid>> {
        Ok(self
            .dispatch
            .find_send_by_message_id(message_id)
            .await?
            .map(|record| record.broadcast_id))
    }

    /// Permanent bounces and complaints stop further mail to the address
    async fn suppress_if_needed(&self, event: &DeliveryEvent) -> Result<()> {
        let source = match event.event_type {
            DeliveryEventType::Bounce
                if event
                    .bounce
                    .as_ref()
                    .is_some_and(|b| b.bounce_type == BounceType::Permanent) =>
            {
                UnsubscribeSource::Bounce
            }
            DeliveryEventType::Complaint => UnsubscribeSource::Complaint,
            _ => return Ok(()),
        };

        self.unsubscribes
            .create(CreateUnsubscribe {
                workspace_id: event.workspace_id,
                email: event.recipient_email.clone(),
                source,
                broadcast_id: event.broadcast_id,
                reason: event.bounce.as_ref().and_then(|b| b.diagnostic.clone()),
            })
            .await?;

        info!(
            email = %event.recipient_email,
            source = %source,
            "Suppressed address after delivery event"
        );
        Ok(())
    }
}
