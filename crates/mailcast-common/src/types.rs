//! Common types for Mailcast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for workspaces (tenants)
pub type WorkspaceId = Uuid;

/// Unique identifier for broadcasts
pub type BroadcastId = Uuid;

/// Unique identifier for broadcast variations
pub type VariationId = Uuid;

/// Unique identifier for contact lists
pub type ListId = Uuid;

/// Unique identifier for segments
pub type SegmentId = Uuid;

/// Unique identifier for templates
pub type TemplateId = Uuid;

/// Unique identifier for provider integrations
pub type IntegrationId = Uuid;

/// Unique identifier for delivery events
pub type DeliveryEventId = Uuid;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.trim().splitn(2, '@').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() && !parts[1].contains('@')
        {
            Some(Self::new(parts[0], parts[1]))
        } else {
            None
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Canonical form used for comparing and ordering recipient addresses
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Canonical form of an RFC 5322 message id: surrounding whitespace and
/// angle brackets stripped. Providers report ids with or without brackets.
pub fn normalize_message_id(message_id: &str) -> String {
    message_id
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Paginated response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
        assert!(EmailAddress::parse("a@b@c").is_none());
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(normalize_message_id("<abc@mail.example.com>"), "abc@mail.example.com");
        assert_eq!(normalize_message_id(" abc@mail.example.com "), "abc@mail.example.com");
        assert_eq!(normalize_message_id("pm-1"), "pm-1");
    }
}
