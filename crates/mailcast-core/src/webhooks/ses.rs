//! Amazon SES notifications delivered through SNS

use super::payload::{decode, ParsedEvent, Links};
use chrono::{DateTime, Utc};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{
    BounceCategory, BounceDetail, BounceType, ComplaintFeedback, DeliveryEventType,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// SNS envelope
#[derive(Debug, Deserialize)]
struct SnsEnvelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "SubscribeURL")]
    subscribe_url: Option<String>,
    #[serde(rename = "TopicArn")]
    topic_arn: Option<String>,
}

/// What SNS delivered
#[derive(Debug, Clone)]
pub enum SnsMessage {
    /// Topic subscription handshake; must be confirmed by fetching the URL
    SubscriptionConfirmation {
        topic_arn: Option<String>,
        subscribe_url: String,
    },
    UnsubscribeConfirmation,
    Notification(SesEvent),
}

impl SnsMessage {
    /// Accepts the SNS envelope or, for direct deliveries, the bare SES event
    pub fn parse(body: &Value) -> Result<Self> {
        if body.get("Type").is_none() {
            return SesEvent::parse(body).map(Self::Notification);
        }

        let envelope: SnsEnvelope = decode("ses", body)?;
        match envelope.kind.as_str() {
            "SubscriptionConfirmation" => {
                let subscribe_url = envelope.subscribe_url.ok_or_else(|| {
                    Error::MalformedPayload("subscription confirmation has no SubscribeURL".into())
                })?;
                Ok(Self::SubscriptionConfirmation {
                    topic_arn: envelope.topic_arn,
                    subscribe_url,
                })
            }
            "UnsubscribeConfirmation" => Ok(Self::UnsubscribeConfirmation),
            "Notification" => {
                let message = envelope.message.ok_or_else(|| {
                    Error::MalformedPayload("SNS notification has no Message".into())
                })?;
                let inner: Value = serde_json::from_str(&message).map_err(|e| {
                    Error::MalformedPayload(format!("SNS Message is not JSON: {}", e))
                })?;
                SesEvent::parse(&inner).map(Self::Notification)
            }
            other => Err(Error::MalformedPayload(format!(
                "unknown SNS message type: {}",
                other
            ))),
        }
    }

    pub fn events(&self) -> Vec<Result<ParsedEvent>> {
        match self {
            Self::Notification(event) => event.events(),
            _ => Vec::new(),
        }
    }
}

/// SES event or notification body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SesEvent {
    #[serde(rename = "eventType", alias = "notificationType")]
    event_type: String,
    mail: SesMail,
    bounce: Option<SesBounce>,
    complaint: Option<SesComplaint>,
    delivery: Option<SesDelivery>,
    open: Option<SesEngagement>,
    click: Option<SesEngagement>,
    #[serde(skip)]
    raw: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SesMail {
    message_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    destination: Vec<String>,
    #[serde(default)]
    tags: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SesBounce {
    bounce_type: String,
    #[serde(default)]
    bounce_sub_type: String,
    #[serde(default)]
    bounced_recipients: Vec<SesRecipient>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SesRecipient {
    email_address: String,
    diagnostic_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SesComplaint {
    #[serde(default)]
    complained_recipients: Vec<SesRecipient>,
    complaint_feedback_type: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SesDelivery {
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    recipients: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SesEngagement {
    timestamp: Option<DateTime<Utc>>,
    link: Option<String>,
}

impl SesEvent {
    fn parse(body: &Value) -> Result<Self> {
        let mut event: Self = decode("ses", body)?;
        event.raw = body.clone();
        Ok(event)
    }

    fn links(&self) -> Links {
        let tags = serde_json::to_value(&self.mail.tags).ok();
        Links::from_metadata(tags.as_ref())
    }

    fn build(
        &self,
        event_type: DeliveryEventType,
        recipient: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<ParsedEvent> {
        Ok(ParsedEvent::new(
            event_type,
            Some(recipient),
            self.mail.message_id.as_deref(),
            &self.raw,
        )?
        .at(timestamp.or(self.mail.timestamp))
        .with_links(self.links()))
    }

    fn missing(&self, section: &str) -> Vec<Result<ParsedEvent>> {
        vec![Err(Error::MalformedPayload(format!(
            "SES {} event has no {} section",
            self.event_type, section
        )))]
    }

    fn events(&self) -> Vec<Result<ParsedEvent>> {
        match self.event_type.as_str() {
            "Bounce" => {
                let Some(bounce) = &self.bounce else {
                    return self.missing("bounce");
                };
                let (bounce_type, category) =
                    classify_bounce(&bounce.bounce_type, &bounce.bounce_sub_type);
                bounce
                    .bounced_recipients
                    .iter()
                    .map(|r| {
                        let mut event = self.build(
                            DeliveryEventType::Bounce,
                            &r.email_address,
                            bounce.timestamp,
                        )?;
                        event.bounce = Some(BounceDetail {
                            bounce_type,
                            category,
                            diagnostic: r.diagnostic_code.clone(),
                        });
                        Ok(event)
                    })
                    .collect()
            }
            "Complaint" => {
                let Some(complaint) = &self.complaint else {
                    return self.missing("complaint");
                };
                let feedback = complaint
                    .complaint_feedback_type
                    .as_deref()
                    .map(ComplaintFeedback::from_arf);
                complaint
                    .complained_recipients
                    .iter()
                    .map(|r| {
                        let mut event = self.build(
                            DeliveryEventType::Complaint,
                            &r.email_address,
                            complaint.timestamp,
                        )?;
                        event.complaint_feedback = feedback;
                        Ok(event)
                    })
                    .collect()
            }
            "Delivery" => {
                let (timestamp, recipients) = match &self.delivery {
                    Some(d) if !d.recipients.is_empty() => (d.timestamp, d.recipients.as_slice()),
                    Some(d) => (d.timestamp, self.mail.destination.as_slice()),
                    None => (None, self.mail.destination.as_slice()),
                };
                recipients
                    .iter()
                    .map(|r| self.build(DeliveryEventType::Delivered, r, timestamp))
                    .collect()
            }
            "Open" | "Click" => {
                let (event_type, engagement) = if self.event_type == "Open" {
                    (DeliveryEventType::Open, &self.open)
                } else {
                    (DeliveryEventType::Click, &self.click)
                };
                let timestamp = engagement.as_ref().and_then(|e| e.timestamp);
                let link = engagement.as_ref().and_then(|e| e.link.clone());
                self.mail
                    .destination
                    .iter()
                    .map(|r| {
                        let mut event = self.build(event_type, r, timestamp)?;
                        event.link = link.clone();
                        Ok(event)
                    })
                    .collect()
            }
            other => {
                debug!(event_type = other, "Ignoring SES event type");
                Vec::new()
            }
        }
    }
}

/// Map SES bounceType / bounceSubType onto the shared classification
pub fn classify_bounce(bounce_type: &str, sub_type: &str) -> (BounceType, BounceCategory) {
    let kind = match bounce_type {
        "Permanent" => BounceType::Permanent,
        "Transient" => BounceType::Transient,
        _ => BounceType::Undetermined,
    };

    let category = match sub_type {
        "NoEmail" => BounceCategory::UnknownRecipient,
        "Suppressed" | "OnAccountSuppressionList" => BounceCategory::Suppressed,
        "MailboxFull" => BounceCategory::MailboxFull,
        "MessageTooLarge" => BounceCategory::MessageTooLarge,
        "ContentRejected" | "AttachmentRejected" => BounceCategory::ContentRejected,
        _ if kind == BounceType::Transient => BounceCategory::TransientFailure,
        _ => BounceCategory::General,
    };

    (kind, category)
}
