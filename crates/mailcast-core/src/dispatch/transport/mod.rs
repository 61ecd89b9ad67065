//! Outbound email transports

mod mock;
mod smtp;

pub use mock::MockTransport;
pub use smtp::SmtpTransport;

use async_trait::async_trait;
use thiserror::Error;

/// A fully rendered message for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub from_name: Option<String>,
    pub from_email: String,
    pub reply_to: Option<String>,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub list_unsubscribe: Option<String>,
}

/// Failure reported by a transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub retryable: bool,
    pub message: String,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl From<TransportError> for mailcast_common::Error {
    fn from(e: TransportError) -> Self {
        mailcast_common::Error::Transport {
            retryable: e.retryable,
            message: e.message,
        }
    }
}

/// Something that can hand a message to a mail system
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the message and return the provider message id
    async fn send(&self, message: &OutboundMessage) -> Result<String, TransportError>;
}
