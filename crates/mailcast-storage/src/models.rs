//! Database models

use chrono::{DateTime, Utc};
use mailcast_common::types::{
    BroadcastId, DeliveryEventId, IntegrationId, ListId, SegmentId, TemplateId, VariationId,
    WorkspaceId,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Broadcasts
// ============================================================================

/// Broadcast status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Draft,
    Scheduled,
    Sending,
    Paused,
    Sent,
    Cancelled,
    Failed,
}

impl BroadcastStatus {
    pub const ALL: [BroadcastStatus; 7] = [
        BroadcastStatus::Draft,
        BroadcastStatus::Scheduled,
        BroadcastStatus::Sending,
        BroadcastStatus::Paused,
        BroadcastStatus::Sent,
        BroadcastStatus::Cancelled,
        BroadcastStatus::Failed,
    ];

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BroadcastStatus::Sent | BroadcastStatus::Cancelled | BroadcastStatus::Failed
        )
    }
}

impl std::fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastStatus::Draft => write!(f, "draft"),
            BroadcastStatus::Scheduled => write!(f, "scheduled"),
            BroadcastStatus::Sending => write!(f, "sending"),
            BroadcastStatus::Paused => write!(f, "paused"),
            BroadcastStatus::Sent => write!(f, "sent"),
            BroadcastStatus::Cancelled => write!(f, "cancelled"),
            BroadcastStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for BroadcastStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(BroadcastStatus::Draft),
            "scheduled" => Ok(BroadcastStatus::Scheduled),
            "sending" => Ok(BroadcastStatus::Sending),
            "paused" => Ok(BroadcastStatus::Paused),
            "sent" => Ok(BroadcastStatus::Sent),
            "cancelled" => Ok(BroadcastStatus::Cancelled),
            "failed" => Ok(BroadcastStatus::Failed),
            _ => Err(format!("Invalid broadcast status: {}", s)),
        }
    }
}

/// Who receives a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceSettings {
    #[serde(default)]
    pub lists: Vec<ListId>,
    #[serde(default)]
    pub segments: Vec<SegmentId>,
    #[serde(default)]
    pub exclude_unsubscribed: bool,
    #[serde(default)]
    pub skip_duplicate_emails: bool,
    pub rate_limit_per_minute: Option<u32>,
}

/// When a broadcast goes out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default)]
    pub send_immediately: bool,
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Deliver inside a daily window local to each recipient
    #[serde(default)]
    pub use_recipient_timezone: bool,
    /// "HH:MM", inclusive
    pub time_window_start: Option<String>,
    /// "HH:MM", exclusive
    pub time_window_end: Option<String>,
}

/// Metric used to pick the winning variation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerMetric {
    OpenRate,
    ClickRate,
}

impl Default for WinnerMetric {
    fn default() -> Self {
        WinnerMetric::OpenRate
    }
}

/// A/B test configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sample_percentage: u32,
    #[serde(default)]
    pub auto_send_winner: bool,
    #[serde(default)]
    pub auto_send_winner_metric: WinnerMetric,
    #[serde(default = "default_test_duration")]
    pub test_duration_hours: u32,
}

fn default_test_duration() -> u32 {
    24
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_percentage: 0,
            auto_send_winner: false,
            auto_send_winner_metric: WinnerMetric::OpenRate,
            test_duration_hours: default_test_duration(),
        }
    }
}

/// One A/B arm of a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variation {
    pub id: VariationId,
    pub broadcast_id: BroadcastId,
    /// Creation order within the broadcast, starting at 0
    pub position: i32,
    pub name: String,
    pub template_id: TemplateId,
    pub template_version: i32,
    pub subject: String,
    pub from_name: Option<String>,
    pub from_email: String,
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Variation input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVariation {
    pub name: String,
    pub template_id: TemplateId,
    #[serde(default = "default_template_version")]
    pub template_version: i32,
    pub subject: String,
    pub from_name: Option<String>,
    pub from_email: String,
    pub reply_to: Option<String>,
}

fn default_template_version() -> i32 {
    1
}

/// Broadcast model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: BroadcastId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub status: BroadcastStatus,
    pub audience: AudienceSettings,
    pub schedule: ScheduleSettings,
    pub test_settings: TestSettings,
    pub variations: Vec<Variation>,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub delivered_count: i64,
    pub failed_count: i64,
    /// Position of the next unsent entry in the audience snapshot
    pub recipient_cursor: i64,
    pub winning_variation: Option<VariationId>,
    pub winner_selected_at: Option<DateTime<Utc>>,
    /// Operator released the winner for the remaining audience
    pub winner_released: bool,
    pub winner_sent_at: Option<DateTime<Utc>>,
    pub test_phase_started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Broadcast {
    /// Look up a variation by id
    pub fn variation(&self, id: VariationId) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == id)
    }

    /// Variations in creation order
    pub fn ordered_variations(&self) -> Vec<&Variation> {
        let mut variations: Vec<&Variation> = self.variations.iter().collect();
        variations.sort_by_key(|v| v.position);
        variations
    }

    /// Calculate progress percentage
    pub fn progress_percentage(&self) -> f64 {
        if self.total_recipients == 0 {
            0.0
        } else {
            (self.recipient_cursor as f64 / self.total_recipients as f64) * 100.0
        }
    }
}

/// Create broadcast input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBroadcast {
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub audience: AudienceSettings,
    pub schedule: ScheduleSettings,
    pub test_settings: TestSettings,
    pub variations: Vec<CreateVariation>,
}

/// Update broadcast input (draft broadcasts only)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateBroadcast {
    pub name: Option<String>,
    pub audience: Option<AudienceSettings>,
    pub schedule: Option<ScheduleSettings>,
    pub test_settings: Option<TestSettings>,
    pub variations: Option<Vec<CreateVariation>>,
}

/// Counters recomputed from send records and delivery events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastCounters {
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
}

// ============================================================================
// Audience
// ============================================================================

/// A contact as stored in a list or segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub email: String,
    pub name: Option<String>,
    /// IANA zone name, e.g. "Europe/Paris"
    pub timezone: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl Contact {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
            timezone: None,
            attributes: serde_json::json!({}),
        }
    }
}

/// An entry of the frozen audience snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceMember {
    pub position: i64,
    pub contact: Contact,
}

/// Recipient parked until its local send window opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRecipient {
    pub broadcast_id: BroadcastId,
    pub member: AudienceMember,
    pub not_before: DateTime<Utc>,
}

/// Unsubscribe source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsubscribeSource {
    Manual,
    Link,
    Bounce,
    Complaint,
}

impl std::fmt::Display for UnsubscribeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnsubscribeSource::Manual => write!(f, "manual"),
            UnsubscribeSource::Link => write!(f, "link"),
            UnsubscribeSource::Bounce => write!(f, "bounce"),
            UnsubscribeSource::Complaint => write!(f, "complaint"),
        }
    }
}

/// Create unsubscribe input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUnsubscribe {
    pub workspace_id: WorkspaceId,
    pub email: String,
    pub source: UnsubscribeSource,
    pub broadcast_id: Option<BroadcastId>,
    pub reason: Option<String>,
}

// ============================================================================
// Send records
// ============================================================================

/// Send record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendStatus::Pending => write!(f, "pending"),
            SendStatus::Sent => write!(f, "sent"),
            SendStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SendStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SendStatus::Pending),
            "sent" => Ok(SendStatus::Sent),
            "failed" => Ok(SendStatus::Failed),
            _ => Err(format!("Invalid send status: {}", s)),
        }
    }
}

/// Proof that a (broadcast, recipient) pair was dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRecord {
    pub broadcast_id: BroadcastId,
    pub variation_id: VariationId,
    pub recipient_email: String,
    pub status: SendStatus,
    pub attempts: i32,
    pub message_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Per-variation send counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationSendCounts {
    pub variation_id: VariationId,
    pub sent: i64,
    pub failed: i64,
    pub pending: i64,
}

// ============================================================================
// Delivery events
// ============================================================================

/// Email service provider that emitted a webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailProvider {
    Ses,
    #[serde(rename = "sparkpost")]
    SparkPost,
    Mailgun,
    Mailjet,
    Postmark,
}

impl std::fmt::Display for EmailProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailProvider::Ses => write!(f, "ses"),
            EmailProvider::SparkPost => write!(f, "sparkpost"),
            EmailProvider::Mailgun => write!(f, "mailgun"),
            EmailProvider::Mailjet => write!(f, "mailjet"),
            EmailProvider::Postmark => write!(f, "postmark"),
        }
    }
}

impl std::str::FromStr for EmailProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ses" => Ok(EmailProvider::Ses),
            "sparkpost" => Ok(EmailProvider::SparkPost),
            "mailgun" => Ok(EmailProvider::Mailgun),
            "mailjet" => Ok(EmailProvider::Mailjet),
            "postmark" => Ok(EmailProvider::Postmark),
            _ => Err(format!("Unknown email provider: {}", s)),
        }
    }
}

/// Normalized delivery event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventType {
    Delivered,
    Bounce,
    Complaint,
    Open,
    Click,
}

impl std::fmt::Display for DeliveryEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryEventType::Delivered => write!(f, "delivered"),
            DeliveryEventType::Bounce => write!(f, "bounce"),
            DeliveryEventType::Complaint => write!(f, "complaint"),
            DeliveryEventType::Open => write!(f, "open"),
            DeliveryEventType::Click => write!(f, "click"),
        }
    }
}

impl std::str::FromStr for DeliveryEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(DeliveryEventType::Delivered),
            "bounce" => Ok(DeliveryEventType::Bounce),
            "complaint" => Ok(DeliveryEventType::Complaint),
            "open" => Ok(DeliveryEventType::Open),
            "click" => Ok(DeliveryEventType::Click),
            _ => Err(format!("Invalid delivery event type: {}", s)),
        }
    }
}

/// Whether a bounce is final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceType {
    Permanent,
    Transient,
    Undetermined,
}

impl std::fmt::Display for BounceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BounceType::Permanent => write!(f, "permanent"),
            BounceType::Transient => write!(f, "transient"),
            BounceType::Undetermined => write!(f, "undetermined"),
        }
    }
}

impl std::str::FromStr for BounceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(BounceType::Permanent),
            "transient" => Ok(BounceType::Transient),
            "undetermined" => Ok(BounceType::Undetermined),
            _ => Err(format!("Invalid bounce type: {}", s)),
        }
    }
}

/// Why a message bounced, shared across providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceCategory {
    UnknownRecipient,
    MailboxFull,
    MessageTooLarge,
    ContentRejected,
    PolicyBlocked,
    Suppressed,
    DnsFailure,
    TransientFailure,
    General,
}

impl std::fmt::Display for BounceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BounceCategory::UnknownRecipient => "unknown_recipient",
            BounceCategory::MailboxFull => "mailbox_full",
            BounceCategory::MessageTooLarge => "message_too_large",
            BounceCategory::ContentRejected => "content_rejected",
            BounceCategory::PolicyBlocked => "policy_blocked",
            BounceCategory::Suppressed => "suppressed",
            BounceCategory::DnsFailure => "dns_failure",
            BounceCategory::TransientFailure => "transient_failure",
            BounceCategory::General => "general",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BounceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown_recipient" => Ok(BounceCategory::UnknownRecipient),
            "mailbox_full" => Ok(BounceCategory::MailboxFull),
            "message_too_large" => Ok(BounceCategory::MessageTooLarge),
            "content_rejected" => Ok(BounceCategory::ContentRejected),
            "policy_blocked" => Ok(BounceCategory::PolicyBlocked),
            "suppressed" => Ok(BounceCategory::Suppressed),
            "dns_failure" => Ok(BounceCategory::DnsFailure),
            "transient_failure" => Ok(BounceCategory::TransientFailure),
            "general" => Ok(BounceCategory::General),
            _ => Err(format!("Invalid bounce category: {}", s)),
        }
    }
}

/// Complaint feedback type (ARF vocabulary)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplaintFeedback {
    Abuse,
    AuthFailure,
    Fraud,
    NotSpam,
    Virus,
    Other,
}

impl ComplaintFeedback {
    /// Map an ARF feedback-type token; unknown tokens become `Other`
    pub fn from_arf(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "abuse" => ComplaintFeedback::Abuse,
            "auth-failure" | "auth_failure" => ComplaintFeedback::AuthFailure,
            "fraud" => ComplaintFeedback::Fraud,
            "not-spam" | "not_spam" => ComplaintFeedback::NotSpam,
            "virus" => ComplaintFeedback::Virus,
            _ => ComplaintFeedback::Other,
        }
    }
}

impl std::fmt::Display for ComplaintFeedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComplaintFeedback::Abuse => "abuse",
            ComplaintFeedback::AuthFailure => "auth_failure",
            ComplaintFeedback::Fraud => "fraud",
            ComplaintFeedback::NotSpam => "not_spam",
            ComplaintFeedback::Virus => "virus",
            ComplaintFeedback::Other => "other",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ComplaintFeedback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ComplaintFeedback::from_arf(s))
    }
}

/// Bounce detail triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceDetail {
    pub bounce_type: BounceType,
    pub category: BounceCategory,
    pub diagnostic: Option<String>,
}

/// Canonical delivery event, immutable once stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    /// Monotonic insertion sequence, used as the pagination cursor
    pub seq: i64,
    pub id: DeliveryEventId,
    pub workspace_id: WorkspaceId,
    pub provider: EmailProvider,
    pub integration_id: Option<IntegrationId>,
    pub event_type: DeliveryEventType,
    pub recipient_email: String,
    pub message_id: String,
    pub broadcast_id: Option<BroadcastId>,
    pub transactional_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub bounce: Option<BounceDetail>,
    pub complaint_feedback: Option<ComplaintFeedback>,
    pub link: Option<String>,
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Delivery event input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeliveryEvent {
    pub workspace_id: WorkspaceId,
    pub provider: EmailProvider,
    pub integration_id: Option<IntegrationId>,
    pub event_type: DeliveryEventType,
    pub recipient_email: String,
    pub message_id: String,
    pub broadcast_id: Option<BroadcastId>,
    pub transactional_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub bounce: Option<BounceDetail>,
    pub complaint_feedback: Option<ComplaintFeedback>,
    pub link: Option<String>,
    pub raw_payload: serde_json::Value,
}

/// Delivery event query filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryEventFilter {
    pub workspace_id: WorkspaceId,
    pub event_type: Option<DeliveryEventType>,
    pub recipient_email: Option<String>,
    pub message_id: Option<String>,
    pub broadcast_id: Option<BroadcastId>,
    pub transactional_id: Option<String>,
    pub timestamp_from: Option<DateTime<Utc>>,
    pub timestamp_to: Option<DateTime<Utc>>,
}

impl DeliveryEventFilter {
    /// In-process evaluation of the filter
    pub fn matches(&self, event: &DeliveryEvent) -> bool {
        event.workspace_id == self.workspace_id
            && self.event_type.map_or(true, |t| event.event_type == t)
            && self
                .recipient_email
                .as_ref()
                .map_or(true, |e| event.recipient_email.eq_ignore_ascii_case(e))
            && self.message_id.as_ref().map_or(true, |m| &event.message_id == m)
            && self.broadcast_id.map_or(true, |b| event.broadcast_id == Some(b))
            && self
                .transactional_id
                .as_ref()
                .map_or(true, |t| event.transactional_id.as_ref() == Some(t))
            && self.timestamp_from.map_or(true, |from| event.timestamp >= from)
            && self.timestamp_to.map_or(true, |to| event.timestamp <= to)
    }
}

/// Per-variation delivery event counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationEventCounts {
    pub delivered: i64,
    pub bounced: i64,
    pub complained: i64,
    pub opens: i64,
    pub clicks: i64,
}

impl VariationEventCounts {
    /// Bump the counter matching an event type
    pub fn add(&mut self, event_type: DeliveryEventType) {
        match event_type {
            DeliveryEventType::Delivered => self.delivered += 1,
            DeliveryEventType::Bounce => self.bounced += 1,
            DeliveryEventType::Complaint => self.complained += 1,
            DeliveryEventType::Open => self.opens += 1,
            DeliveryEventType::Click => self.clicks += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in BroadcastStatus::ALL {
            let parsed: BroadcastStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("completed".parse::<BroadcastStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(BroadcastStatus::Sent.is_terminal());
        assert!(BroadcastStatus::Cancelled.is_terminal());
        assert!(BroadcastStatus::Failed.is_terminal());
        assert!(!BroadcastStatus::Paused.is_terminal());
    }

    #[test]
    fn test_complaint_feedback_from_arf() {
        assert_eq!(ComplaintFeedback::from_arf("abuse"), ComplaintFeedback::Abuse);
        assert_eq!(
            ComplaintFeedback::from_arf("auth-failure"),
            ComplaintFeedback::AuthFailure
        );
        assert_eq!(ComplaintFeedback::from_arf("whatever"), ComplaintFeedback::Other);
    }

    #[test]
    fn test_provider_parse_is_case_insensitive() {
        assert_eq!("SparkPost".parse::<EmailProvider>().unwrap(), EmailProvider::SparkPost);
        assert!("sendgrid".parse::<EmailProvider>().is_err());
    }
}
