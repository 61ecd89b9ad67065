//! SparkPost event batches

use super::payload::{decode, entries, parse_timestamp, Links, ParsedEvent};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{
    BounceCategory, BounceDetail, BounceType, ComplaintFeedback, DeliveryEventType,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Event groups SparkPost nests under `msys`
const EVENT_GROUPS: &[&str] = &["message_event", "track_event"];

/// One SparkPost event
#[derive(Debug, Clone, Deserialize)]
pub struct SparkPostEvent {
    #[serde(rename = "type")]
    event_type: String,
    message_id: Option<String>,
    rcpt_to: Option<String>,
    timestamp: Option<Value>,
    bounce_class: Option<Value>,
    raw_reason: Option<String>,
    reason: Option<String>,
    fbtype: Option<String>,
    target_link_url: Option<String>,
    rcpt_meta: Option<Value>,
    #[serde(skip)]
    raw: Value,
}

/// Decode a batch. Entries without an event group (such as the
/// endpoint-test ping `{"msys": {}}`) are skipped.
pub fn parse(body: &Value) -> Result<Vec<SparkPostEvent>> {
    let mut events = Vec::new();

    for entry in entries(body)? {
        let msys = entry
            .get("msys")
            .ok_or_else(|| Error::MalformedPayload("SparkPost entry has no msys".into()))?;

        for group in EVENT_GROUPS {
            if let Some(inner) = msys.get(*group) {
                let mut event: SparkPostEvent = decode("sparkpost", inner)?;
                event.raw = inner.clone();
                events.push(event);
            }
        }
    }

    Ok(events)
}

impl SparkPostEvent {
    pub fn event(&self) -> Option<Result<ParsedEvent>> {
        let event_type = match self.event_type.as_str() {
            "bounce" | "out_of_band" | "policy_rejection" => DeliveryEventType::Bounce,
            "delivery" => DeliveryEventType::Delivered,
            "spam_complaint" => DeliveryEventType::Complaint,
            "open" | "initial_open" => DeliveryEventType::Open,
            "click" => DeliveryEventType::Click,
            other => {
                debug!(event_type = other, "Ignoring SparkPost event type");
                return None;
            }
        };

        Some(self.build(event_type))
    }

    fn build(&self, event_type: DeliveryEventType) -> Result<ParsedEvent> {
        let mut event = ParsedEvent::new(
            event_type,
            self.rcpt_to.as_deref(),
            self.message_id.as_deref(),
            &self.raw,
        )?
        .at(self.timestamp.as_ref().and_then(parse_timestamp))
        .with_links(Links::from_metadata(self.rcpt_meta.as_ref()));

        match event_type {
            DeliveryEventType::Bounce => {
                let code = self.bounce_class.as_ref().and_then(bounce_class_code);
                let (bounce_type, category) = match (self.event_type.as_str(), code) {
                    (_, Some(code)) => classify_bounce_class(code),
                    ("policy_rejection", None) => {
                        (BounceType::Permanent, BounceCategory::PolicyBlocked)
                    }
                    _ => (BounceType::Undetermined, BounceCategory::General),
                };
                event.bounce = Some(BounceDetail {
                    bounce_type,
                    category,
                    diagnostic: self.raw_reason.clone().or_else(|| self.reason.clone()),
                });
            }
            DeliveryEventType::Complaint => {
                event.complaint_feedback = Some(
                    self.fbtype
                        .as_deref()
                        .map(ComplaintFeedback::from_arf)
                        .unwrap_or(ComplaintFeedback::Abuse),
                );
            }
            DeliveryEventType::Click => event.link = self.target_link_url.clone(),
            _ => {}
        }

        Ok(event)
    }
}

fn bounce_class_code(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// SparkPost bounce classification codes
pub fn classify_bounce_class(code: u32) -> (BounceType, BounceCategory) {
    use BounceCategory::*;
    use BounceType::*;

    match code {
        10 | 30 => (Permanent, UnknownRecipient),
        20 | 24 | 70 => (Transient, TransientFailure),
        21 => (Transient, DnsFailure),
        22 => (Transient, MailboxFull),
        23 => (Permanent, MessageTooLarge),
        25 | 50 | 51 | 54 => (Permanent, PolicyBlocked),
        26 => (Permanent, Suppressed),
        52 | 53 => (Permanent, ContentRejected),
        60 | 80 | 90 | 100 => (Transient, General),
        _ => (Undetermined, General),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_bounce_batch() {
        let body = json!([
            { "msys": { "message_event": {
                "type": "bounce",
                "bounce_class": "10",
                "message_id": "0001-sp",
                "rcpt_to": "Gone@Example.com",
                "raw_reason": "550 5.1.1 unknown user",
                "timestamp": "1700000000",
                "rcpt_meta": { "broadcast_id": "7f1c8f5e-8a47-4b5e-9d3e-2c6a0a9b1f00" }
            }}},
            { "msys": { "track_event": {
                "type": "click",
                "message_id": "0001-sp",
                "rcpt_to": "gone@example.com",
                "target_link_url": "https://example.com/offer",
                "timestamp": 1700000100
            }}}
        ]);

        let events: Vec<_> = parse(&body)
            .unwrap()
            .iter()
            .filter_map(|e| e.event())
            .map(|e| e.unwrap())
            .collect();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].recipient_email, "gone@example.com");
        assert_eq!(
            events[0].bounce,
            Some(BounceDetail {
                bounce_type: BounceType::Permanent,
                category: BounceCategory::UnknownRecipient,
                diagnostic: Some("550 5.1.1 unknown user".to_string()),
            })
        );
        assert!(events[0].broadcast_id.is_some());
        assert_eq!(events[1].event_type, DeliveryEventType::Click);
        assert_eq!(events[1].link.as_deref(), Some("https://example.com/offer"));
    }

    #[test]
    fn test_ping_batch_has_no_events() {
        assert!(parse(&json!([{ "msys": {} }])).unwrap().is_empty());
    }

    #[test]
    fn test_missing_message_id_is_reported() {
        let body = json!([{ "msys": { "message_event": {
            "type": "delivery",
            "rcpt_to": "a@example.com"
        }}}]);
        let events = parse(&body).unwrap();
        assert!(matches!(events[0].event(), Some(Err(Error::MalformedPayload(_)))));
    }

    #[test]
    fn test_unsupported_type_is_dropped() {
        let body = json!([{ "msys": { "message_event": {
            "type": "injection",
            "message_id": "m",
            "rcpt_to": "a@example.com"
        }}}]);
        assert!(parse(&body).unwrap()[0].event().is_none());
    }

    #[test]
    fn test_bounce_class_table() {
        assert_eq!(classify_bounce_class(22), (BounceType::Transient, BounceCategory::MailboxFull));
        assert_eq!(classify_bounce_class(53), (BounceType::Permanent, BounceCategory::ContentRejected));
        assert_eq!(classify_bounce_class(1), (BounceType::Undetermined, BounceCategory::General));
    }
}
