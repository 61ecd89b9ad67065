//! Provider payloads and the canonical event extracted from them

use super::{mailgun, mailjet, postmark, ses, sparkpost};
use chrono::{DateTime, TimeZone, Utc};
use mailcast_common::types::{normalize_email, BroadcastId};
use mailcast_common::{Error, Result};
use mailcast_storage::models::{BounceDetail, ComplaintFeedback, DeliveryEventType, EmailProvider};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

/// One provider event mapped onto the shared vocabulary
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub event_type: DeliveryEventType,
    pub recipient_email: String,
    pub message_id: String,
    /// `None` when the provider omitted it; the receive time is used instead
    pub timestamp: Option<DateTime<Utc>>,
    pub bounce: Option<BounceDetail>,
    pub complaint_feedback: Option<ComplaintFeedback>,
    pub link: Option<String>,
    pub broadcast_id: Option<BroadcastId>,
    pub transactional_id: Option<String>,
    pub raw: Value,
}

impl ParsedEvent {
    /// Start an event; recipient and message id are mandatory
    pub(super) fn new(
        event_type: DeliveryEventType,
        recipient: Option<&str>,
        message_id: Option<&str>,
        raw: &Value,
    ) -> Result<Self> {
        let recipient = recipient
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Error::MalformedPayload("event has no recipient".to_string()))?;
        let message_id = message_id
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::MalformedPayload("event has no message id".to_string()))?;

        Ok(Self {
            event_type,
            recipient_email: normalize_email(recipient),
            message_id: message_id.to_string(),
            timestamp: None,
            bounce: None,
            complaint_feedback: None,
            link: None,
            broadcast_id: None,
            transactional_id: None,
            raw: raw.clone(),
        })
    }

    pub(super) fn at(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub(super) fn with_links(mut self, links: Links) -> Self {
        self.broadcast_id = links.broadcast_id;
        self.transactional_id = links.transactional_id;
        self
    }
}

/// Broadcast or transactional reference carried in provider metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Links {
    pub broadcast_id: Option<BroadcastId>,
    pub transactional_id: Option<String>,
}

impl Links {
    /// Read `broadcast_id` / `transactional_id` from a metadata object.
    /// Values may be plain strings or single-element string arrays.
    pub fn from_metadata(metadata: Option<&Value>) -> Self {
        let Some(metadata) = metadata else {
            return Self::default();
        };
        let text = |key: &str| -> Option<String> {
            match metadata.get(key)? {
                Value::String(s) => Some(s.clone()),
                Value::Array(items) => items.first()?.as_str().map(str::to_string),
                _ => None,
            }
        };

        Self {
            broadcast_id: text("broadcast_id").and_then(|s| Uuid::parse_str(s.trim()).ok()),
            transactional_id: text("transactional_id").filter(|s| !s.is_empty()),
        }
    }
}

/// Webhook body, one variant per provider
#[derive(Debug, Clone)]
pub enum ProviderPayload {
    Ses(ses::SnsMessage),
    SparkPost(Vec<sparkpost::SparkPostEvent>),
    Mailgun(mailgun::MailgunWebhook),
    Mailjet(Vec<mailjet::MailjetEvent>),
    Postmark(postmark::PostmarkRecord),
}

impl ProviderPayload {
    /// Decode a webhook body for `provider`
    pub fn parse(provider: EmailProvider, body: &Value) -> Result<Self> {
        match provider {
            EmailProvider::Ses => ses::SnsMessage::parse(body).map(Self::Ses),
            EmailProvider::SparkPost => sparkpost::parse(body).map(Self::SparkPost),
            EmailProvider::Mailgun => mailgun::MailgunWebhook::parse(body).map(Self::Mailgun),
            EmailProvider::Mailjet => mailjet::parse(body).map(Self::Mailjet),
            EmailProvider::Postmark => postmark::PostmarkRecord::parse(body).map(Self::Postmark),
        }
    }

    pub fn provider(&self) -> EmailProvider {
        match self {
            Self::Ses(_) => EmailProvider::Ses,
            Self::SparkPost(_) => EmailProvider::SparkPost,
            Self::Mailgun(_) => EmailProvider::Mailgun,
            Self::Mailjet(_) => EmailProvider::Mailjet,
            Self::Postmark(_) => EmailProvider::Postmark,
        }
    }

    /// Canonical events. Entries that cannot be normalized come back as
    /// errors; event kinds outside the shared vocabulary are dropped.
    pub fn events(&self) -> Vec<Result<ParsedEvent>> {
        match self {
            Self::Ses(message) => message.events(),
            Self::SparkPost(events) => events.iter().filter_map(|e| e.event()).collect(),
            Self::Mailgun(webhook) => webhook.event().into_iter().collect(),
            Self::Mailjet(events) => events.iter().filter_map(|e| e.event()).collect(),
            Self::Postmark(record) => record.event().into_iter().collect(),
        }
    }
}

/// Deserialize one payload entry, reporting failures as malformed
pub(super) fn decode<T: DeserializeOwned>(provider: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::MalformedPayload(format!("{} payload: {}", provider, e)))
}

/// Unix seconds, as a number or numeric string, or an RFC 3339 string
pub(super) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_unix_f64),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(from_unix_f64)
            .or_else(|| {
                DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
        _ => None,
    }
}

pub(super) fn from_unix_f64(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1_000_000_000.0) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

/// A JSON array of entries, or a single entry
pub(super) fn entries(body: &Value) -> Result<Vec<&Value>> {
    match body {
        Value::Array(items) => Ok(items.iter().collect()),
        Value::Object(_) => Ok(vec![body]),
        _ => Err(Error::MalformedPayload(
            "expected a JSON object or array".to_string(),
        )),
    }
}
