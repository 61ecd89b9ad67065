//! Mailgun event webhooks

use super::payload::{decode, from_unix_f64, Links, ParsedEvent};
use mailcast_common::Result;
use mailcast_storage::models::{
    BounceCategory, BounceDetail, BounceType, ComplaintFeedback, DeliveryEventType,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Webhook body: signature block plus one event
#[derive(Debug, Clone, Deserialize)]
pub struct MailgunWebhook {
    pub signature: Option<MailgunSignature>,
    #[serde(rename = "event-data")]
    event_data: MailgunEventData,
    #[serde(skip)]
    raw: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailgunSignature {
    pub timestamp: String,
    pub token: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MailgunEventData {
    event: String,
    timestamp: Option<f64>,
    recipient: Option<String>,
    severity: Option<String>,
    reason: Option<String>,
    #[serde(rename = "delivery-status")]
    delivery_status: Option<DeliveryStatus>,
    message: Option<MailgunMessage>,
    #[serde(rename = "user-variables")]
    user_variables: Option<Value>,
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeliveryStatus {
    code: Option<i64>,
    message: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MailgunMessage {
    headers: MailgunHeaders,
}

#[derive(Debug, Clone, Deserialize)]
struct MailgunHeaders {
    #[serde(rename = "message-id")]
    message_id: Option<String>,
}

impl MailgunWebhook {
    pub fn parse(body: &Value) -> Result<Self> {
        let mut webhook: Self = decode("mailgun", body)?;
        webhook.raw = body.get("event-data").cloned().unwrap_or_else(|| body.clone());
        Ok(webhook)
    }

    pub fn event(&self) -> Option<Result<ParsedEvent>> {
        let data = &self.event_data;
        let event_type = match data.event.as_str() {
            "delivered" => DeliveryEventType::Delivered,
            "failed" => DeliveryEventType::Bounce,
            "complained" => DeliveryEventType::Complaint,
            "opened" => DeliveryEventType::Open,
            "clicked" => DeliveryEventType::Click,
            other => {
                debug!(event_type = other, "Ignoring Mailgun event type");
                return None;
            }
        };

        Some(self.build(event_type))
    }

    fn build(&self, event_type: DeliveryEventType) -> Result<ParsedEvent> {
        let data = &self.event_data;
        let message_id = data
            .message
            .as_ref()
            .and_then(|m| m.headers.message_id.as_deref());

        let mut event = ParsedEvent::new(event_type, data.recipient.as_deref(), message_id, &self.raw)?
            .at(data.timestamp.and_then(from_unix_f64))
            .with_links(Links::from_metadata(data.user_variables.as_ref()));

        match event_type {
            DeliveryEventType::Bounce => {
                let bounce_type = match data.severity.as_deref() {
                    Some("permanent") => BounceType::Permanent,
                    Some("temporary") => BounceType::Transient,
                    _ => BounceType::Undetermined,
                };
                let code = data.delivery_status.as_ref().and_then(|s| s.code);
                let diagnostic = data.delivery_status.as_ref().and_then(|s| {
                    s.description
                        .clone()
                        .filter(|d| !d.is_empty())
                        .or_else(|| s.message.clone())
                });
                event.bounce = Some(BounceDetail {
                    bounce_type,
                    category: classify_failure(data.reason.as_deref(), code, bounce_type),
                    diagnostic,
                });
            }
            DeliveryEventType::Complaint => event.complaint_feedback = Some(ComplaintFeedback::Abuse),
            DeliveryEventType::Click => event.link = data.url.clone(),
            _ => {}
        }

        Ok(event)
    }
}

/// Category from Mailgun's failure reason and SMTP code
pub fn classify_failure(reason: Option<&str>, code: Option<i64>, bounce_type: BounceType) -> BounceCategory {
    match (reason, code) {
        (Some(r), _) if r.starts_with("suppress") => BounceCategory::Suppressed,
        (Some("espblock"), _) => BounceCategory::PolicyBlocked,
        (_, Some(550 | 551 | 553)) => BounceCategory::UnknownRecipient,
        (_, Some(552)) => BounceCategory::MailboxFull,
        (_, Some(554)) => BounceCategory::ContentRejected,
        (_, Some(400..=499)) => BounceCategory::TransientFailure,
        _ if bounce_type == BounceType::Transient => BounceCategory::TransientFailure,
        _ => BounceCategory::General,
    }
}
