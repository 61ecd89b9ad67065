//! Building outbound messages for a variation

use super::template::Personalizer;
use super::transport::OutboundMessage;
use mailcast_common::types::BroadcastId;
use mailcast_storage::models::{Contact, Variation};
use uuid::Uuid;

/// Generate a Message-ID in the sender's domain
pub fn generate_message_id(from_email: &str) -> String {
    let domain = from_email
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
        .unwrap_or("mailcast.local");
    format!("<{}@{}>", Uuid::now_v7(), domain)
}

/// Personalize a rendered template for one recipient
pub fn compose(
    personalizer: &Personalizer,
    variation: &Variation,
    html_template: &str,
    contact: &Contact,
    broadcast_id: Option<BroadcastId>,
) -> OutboundMessage {
    OutboundMessage {
        message_id: generate_message_id(&variation.from_email),
        from_name: variation.from_name.clone(),
        from_email: variation.from_email.clone(),
        reply_to: variation.reply_to.clone(),
        to: contact.email.clone(),
        subject: personalizer.render_subject(&variation.subject, contact),
        html_body: personalizer.render(html_template, contact, broadcast_id),
        list_unsubscribe: Some(personalizer.list_unsubscribe_header(&contact.email, broadcast_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_message_id_uses_sender_domain() {
        let id = generate_message_id("news@shop.example");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@shop.example>"));

        let fallback = generate_message_id("broken");
        assert!(fallback.ends_with("@mailcast.local>"));
    }

    #[test]
    fn test_compose_personalizes() {
        let personalizer = Personalizer::new("https://mail.example/u", "secret");
        let variation = Variation {
            id: Uuid::new_v4(),
            broadcast_id: Uuid::new_v4(),
            position: 0,
            name: "A".to_string(),
            template_id: Uuid::new_v4(),
            template_version: 1,
            subject: "Hi {{first_name}}".to_string(),
            from_name: Some("Shop".to_string()),
            from_email: "news@shop.example".to_string(),
            reply_to: None,
            created_at: Utc::now(),
        };
        let mut contact = Contact::new("ada@example.com");
        contact.name = Some("Ada Lovelace".to_string());

        let message = compose(
            &personalizer,
            &variation,
            "<p>Hello {{name}}</p><a href=\"{{unsubscribe_url}}\">u</a>",
            &contact,
            Some(variation.broadcast_id),
        );

        assert_eq!(message.subject, "Hi Ada");
        assert!(message.html_body.contains("Hello Ada Lovelace"));
        assert!(message.html_body.contains("https://mail.example/u/"));
        assert_eq!(message.to, "ada@example.com");
        assert!(message.list_unsubscribe.unwrap().starts_with("<https://mail.example/u/"));
    }
}
