//! Postmark webhooks

use super::payload::{decode, Links, ParsedEvent};
use chrono::{DateTime, Utc};
use mailcast_common::Result;
use mailcast_storage::models::{
    BounceCategory, BounceDetail, BounceType, ComplaintFeedback, DeliveryEventType,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// One Postmark webhook record
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostmarkRecord {
    record_type: String,
    #[serde(rename = "MessageID")]
    message_id: Option<String>,
    recipient: Option<String>,
    email: Option<String>,
    delivered_at: Option<DateTime<Utc>>,
    bounced_at: Option<DateTime<Utc>>,
    received_at: Option<DateTime<Utc>>,
    #[serde(rename = "Type")]
    bounce_kind: Option<String>,
    description: Option<String>,
    details: Option<String>,
    metadata: Option<Value>,
    original_link: Option<String>,
    #[serde(skip)]
    raw: Value,
}

impl PostmarkRecord {
    pub fn parse(body: &Value) -> Result<Self> {
        let mut record: Self = decode("postmark", body)?;
        record.raw = body.clone();
        Ok(record)
    }

    pub fn event(&self) -> Option<Result<ParsedEvent>> {
        let event_type = match self.record_type.as_str() {
            "Delivery" => DeliveryEventType::Delivered,
            "Bounce" => DeliveryEventType::Bounce,
            "SpamComplaint" => DeliveryEventType::Complaint,
            "Open" => DeliveryEventType::Open,
            "Click" => DeliveryEventType::Click,
            other => {
                debug!(record_type = other, "Ignoring Postmark record type");
                return None;
            }
        };

        Some(self.build(event_type))
    }

    fn build(&self, event_type: DeliveryEventType) -> Result<ParsedEvent> {
        let recipient = self.recipient.as_deref().or(self.email.as_deref());
        let timestamp = self.delivered_at.or(self.bounced_at).or(self.received_at);

        let mut event =
            ParsedEvent::new(event_type, recipient, self.message_id.as_deref(), &self.raw)?
                .at(timestamp)
                .with_links(Links::from_metadata(self.metadata.as_ref()));

        match event_type {
            DeliveryEventType::Bounce => {
                let (bounce_type, category) =
                    classify_bounce(self.bounce_kind.as_deref().unwrap_or_default());
                event.bounce = Some(BounceDetail {
                    bounce_type,
                    category,
                    diagnostic: self
                        .details
                        .clone()
                        .filter(|d| !d.is_empty())
                        .or_else(|| self.description.clone()),
                });
            }
            DeliveryEventType::Complaint => event.complaint_feedback = Some(ComplaintFeedback::Abuse),
            DeliveryEventType::Click => event.link = self.original_link.clone(),
            _ => {}
        }

        Ok(event)
    }
}

/// Postmark bounce `Type` names
pub fn classify_bounce(kind: &str) -> (BounceType, BounceCategory) {
    match kind {
        "HardBounce" | "BadEmailAddress" => (BounceType::Permanent, BounceCategory::UnknownRecipient),
        "SoftBounce" | "Transient" => (BounceType::Transient, BounceCategory::TransientFailure),
        "DnsError" => (BounceType::Transient, BounceCategory::DnsFailure),
        "SpamNotification" | "VirusNotification" | "SpamComplaint" => {
            (BounceType::Permanent, BounceCategory::ContentRejected)
        }
        "Blocked" | "DMARCPolicy" => (BounceType::Permanent, BounceCategory::PolicyBlocked),
        "ManuallyDeactivated" => (BounceType::Permanent, BounceCategory::Suppressed),
        _ => (BounceType::Undetermined, BounceCategory::General),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_hard_bounce() {
        let body = json!({
            "RecordType": "Bounce",
            "Type": "HardBounce",
            "MessageID": "883953f4-6105-42a2-a16a-77a8eac79483",
            "Email": "Bounced@Example.com",
            "BouncedAt": "2024-03-01T10:00:00Z",
            "Details": "smtp;550 5.1.1 The email account does not exist",
            "Description": "The server was unable to deliver your message",
            "Metadata": { "broadcast_id": "7f1c8f5e-8a47-4b5e-9d3e-2c6a0a9b1f00" }
        });
        let event = PostmarkRecord::parse(&body).unwrap().event().unwrap().unwrap();

        assert_eq!(event.recipient_email, "bounced@example.com");
        assert_eq!(
            event.bounce.as_ref().map(|b| (b.bounce_type, b.category)),
            Some((BounceType::Permanent, BounceCategory::UnknownRecipient))
        );
        assert!(event.broadcast_id.is_some());
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn test_click_link() {
        let body = json!({
            "RecordType": "Click",
            "MessageID": "m-1",
            "Recipient": "reader@example.com",
            "ReceivedAt": "2024-03-01T10:00:00Z",
            "OriginalLink": "https://example.com/a"
        });
        let event = PostmarkRecord::parse(&body).unwrap().event().unwrap().unwrap();
        assert_eq!(event.link.as_deref(), Some("https://example.com/a"));
    }

    #[test]
    fn test_subscription_change_dropped() {
        let body = json!({ "RecordType": "SubscriptionChange", "MessageID": "m" });
        assert!(PostmarkRecord::parse(&body).unwrap().event().is_none());
    }
}
