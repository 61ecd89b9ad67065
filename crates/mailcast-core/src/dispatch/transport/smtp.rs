//! SMTP relay transport

use super::{OutboundMessage, Transport, TransportError};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailcast_common::config::SmtpRelayConfig;
use mailcast_common::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Sends through a configured SMTP relay
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    /// Build the relay client from configuration
    pub fn new(config: &SmtpRelayConfig, timeout: Duration) -> Result<Self> {
        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| Error::Config(format!("Invalid SMTP relay: {}", e)))?
        } else if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| Error::Config(format!("Invalid SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        builder = builder.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.timeout(Some(timeout)).build(),
        })
    }

    fn build(message: &OutboundMessage) -> std::result::Result<Message, TransportError> {
        let from = Mailbox::new(
            message.from_name.clone(),
            message
                .from_email
                .parse()
                .map_err(|e| TransportError::permanent(format!("Invalid from address: {}", e)))?,
        );
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| TransportError::permanent(format!("Invalid to address: {}", e)))?;

        let mut builder = Message::builder()
            .message_id(Some(message.message_id.clone()))
            .from(from)
            .to(to)
            .subject(&message.subject);

        if let Some(reply_to) = &message.reply_to {
            let reply_to: Mailbox = reply_to
                .parse()
                .map_err(|e| TransportError::permanent(format!("Invalid reply-to: {}", e)))?;
            builder = builder.reply_to(reply_to);
        }

        builder
            .header(ContentType::TEXT_HTML)
            .body(message.html_body.clone())
            .map_err(|e| TransportError::permanent(format!("Failed to build email: {}", e)))
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<String, TransportError> {
        let email = Self::build(message)?;

        match self.mailer.send(email).await {
            Ok(response) => {
                debug!(to = %message.to, code = %response.code(), "Relay accepted message");
                Ok(message.message_id.clone())
            }
            Err(e) if e.is_permanent() => Err(TransportError::permanent(e.to_string())),
            Err(e) => Err(TransportError::retryable(e.to_string())),
        }
    }
}
