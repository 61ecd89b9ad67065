//! Mailjet event callbacks

use super::payload::{decode, entries, from_unix_f64, Links, ParsedEvent};
use mailcast_common::Result;
use mailcast_storage::models::{
    BounceCategory, BounceDetail, BounceType, ComplaintFeedback, DeliveryEventType,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct MailjetEvent {
    event: String,
    time: Option<i64>,
    email: Option<String>,
    #[serde(rename = "MessageID")]
    message_id: Option<Value>,
    #[serde(rename = "CustomID")]
    custom_id: Option<String>,
    #[serde(rename = "Payload")]
    payload: Option<String>,
    hard_bounce: Option<bool>,
    error_related_to: Option<String>,
    error: Option<String>,
    url: Option<String>,
    #[serde(skip)]
    raw: Value,
}

/// Decode one event or a grouped batch
pub fn parse(body: &Value) -> Result<Vec<MailjetEvent>> {
    entries(body)?
        .into_iter()
        .map(|entry| {
            let mut event: MailjetEvent = decode("mailjet", entry)?;
            event.raw = entry.clone();
            Ok(event)
        })
        .collect()
}

impl MailjetEvent {
    pub fn event(&self) -> Option<Result<ParsedEvent>> {
        let event_type = match self.event.as_str() {
            "sent" => DeliveryEventType::Delivered,
            "bounce" | "blocked" => DeliveryEventType::Bounce,
            "spam" => DeliveryEventType::Complaint,
            "open" => DeliveryEventType::Open,
            "click" => DeliveryEventType::Click,
            other => {
                debug!(event_type = other, "Ignoring Mailjet event type");
                return None;
            }
        };

        Some(self.build(event_type))
    }

    /// Message ids arrive as numbers; compare them as text
    fn message_id(&self) -> Option<String> {
        match self.message_id.as_ref()? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Links from the `Payload` JSON string, falling back to `CustomID`
    fn links(&self) -> Links {
        let payload = self
            .payload
            .as_deref()
            .filter(|p| !p.is_empty())
            .and_then(|p| serde_json::from_str::<Value>(p).ok());
        let mut links = Links::from_metadata(payload.as_ref());
        if links.transactional_id.is_none() {
            links.transactional_id = self.custom_id.clone().filter(|c| !c.is_empty());
        }
        links
    }

    fn build(&self, event_type: DeliveryEventType) -> Result<ParsedEvent> {
        let message_id = self.message_id();
        let mut event = ParsedEvent::new(
            event_type,
            self.email.as_deref(),
            message_id.as_deref(),
            &self.raw,
        )?
        .at(self.time.and_then(|t| from_unix_f64(t as f64)))
        .with_links(self.links());

        match event_type {
            DeliveryEventType::Bounce => {
                let bounce_type = if self.event == "blocked" || self.hard_bounce == Some(true) {
                    BounceType::Permanent
                } else {
                    BounceType::Transient
                };
                event.bounce = Some(BounceDetail {
                    bounce_type,
                    category: classify_error(
                        self.error.as_deref(),
                        self.error_related_to.as_deref(),
                        bounce_type,
                    ),
                    diagnostic: self.error.clone().filter(|e| !e.is_empty()),
                });
            }
            DeliveryEventType::Complaint => event.complaint_feedback = Some(ComplaintFeedback::Abuse),
            DeliveryEventType::Click => event.link = self.url.clone(),
            _ => {}
        }

        Ok(event)
    }
}

/// Category from Mailjet's `error` and `error_related_to` fields
pub fn classify_error(error: Option<&str>, related_to: Option<&str>, bounce_type: BounceType) -> BounceCategory {
    let error = error.unwrap_or_default().to_ascii_lowercase();

    if error.contains("user unknown") {
        BounceCategory::UnknownRecipient
    } else if error.contains("quota exceeded") {
        BounceCategory::MailboxFull
    } else if error.contains("invalid domain") || error.contains("no mail host") {
        BounceCategory::DnsFailure
    } else if related_to == Some("content") {
        BounceCategory::ContentRejected
    } else if related_to == Some("spam") {
        BounceCategory::PolicyBlocked
    } else if bounce_type == BounceType::Transient {
        BounceCategory::TransientFailure
    } else {
        BounceCategory::General
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_hard_bounce_with_payload_links() {
        let body = json!([{
            "event": "bounce",
            "time": 1700000000,
            "email": "nobody@example.com",
            "MessageID": 19140330729428381u64,
            "Payload": "{\"broadcast_id\":\"7f1c8f5e-8a47-4b5e-9d3e-2c6a0a9b1f00\"}",
            "hard_bounce": true,
            "error_related_to": "recipient",
            "error": "user unknown"
        }]);

        let events = parse(&body).unwrap();
        let event = events[0].event().unwrap().unwrap();
        assert_eq!(event.message_id, "19140330729428381");
        assert_eq!(
            event.bounce,
            Some(BounceDetail {
                bounce_type: BounceType::Permanent,
                category: BounceCategory::UnknownRecipient,
                diagnostic: Some("user unknown".to_string()),
            })
        );
        assert!(event.broadcast_id.is_some());
    }

    #[test]
    fn test_custom_id_is_transactional_link() {
        let body = json!({
            "event": "open",
            "time": 1700000000,
            "email": "reader@example.com",
            "MessageID": 42,
            "CustomID": "receipt-7"
        });
        let event = parse(&body).unwrap()[0].event().unwrap().unwrap();
        assert_eq!(event.event_type, DeliveryEventType::Open);
        assert_eq!(event.transactional_id.as_deref(), Some("receipt-7"));
    }

    #[test]
    fn test_blocked_is_permanent() {
        assert_eq!(
            classify_error(Some(""), Some("spam"), BounceType::Permanent),
            BounceCategory::PolicyBlocked
        );
        let body = json!({ "event": "blocked", "email": "a@example.com", "MessageID": 1 });
        let event = parse(&body).unwrap()[0].event().unwrap().unwrap();
        assert_eq!(event.bounce.map(|b| b.bounce_type), Some(BounceType::Permanent));
    }
}
