//! Template lookup and per-recipient personalization

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use mailcast_common::types::{BroadcastId, TemplateId};
use mailcast_common::{Error, Result};
use mailcast_storage::models::Contact;
use regex::Regex;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::sync::RwLock;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Source of template bodies
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    /// HTML body of a template version, or `TemplateNotFound`
    async fn render(&self, template_id: TemplateId, version: i32) -> Result<String>;
}

/// Templates held in memory
#[derive(Default)]
pub struct InMemoryTemplates {
    templates: RwLock<HashMap<(TemplateId, i32), String>>,
}

impl InMemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, template_id: TemplateId, version: i32, html: impl Into<String>) {
        self.templates
            .write()
            .await
            .insert((template_id, version), html.into());
    }
}

#[async_trait]
impl TemplateRenderer for InMemoryTemplates {
    async fn render(&self, template_id: TemplateId, version: i32) -> Result<String> {
        self.templates
            .read()
            .await
            .get(&(template_id, version))
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound(format!("{} v{}", template_id, version)))
    }
}

/// Compiled templates read from `<dir>/<template_id>/<version>.html`
pub struct FileTemplates {
    dir: PathBuf,
}

impl FileTemplates {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, template_id: TemplateId, version: i32) -> PathBuf {
        self.dir
            .join(template_id.to_string())
            .join(format!("{}.html", version))
    }
}

#[async_trait]
impl TemplateRenderer for FileTemplates {
    async fn render(&self, template_id: TemplateId, version: i32) -> Result<String> {
        let path = self.path(template_id, version);
        match tokio::fs::read_to_string(&path).await {
            Ok(html) => Ok(html),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::TemplateNotFound(
                format!("{} v{}", template_id, version),
            )),
            Err(e) => Err(Error::Internal(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{[^}]+\}\}").expect("valid placeholder pattern"))
}

/// Fills recipient placeholders and signs unsubscribe links
pub struct Personalizer {
    unsubscribe_base_url: String,
    link_secret: String,
}

impl Personalizer {
    pub fn new(unsubscribe_base_url: impl Into<String>, link_secret: impl Into<String>) -> Self {
        Self {
            unsubscribe_base_url: unsubscribe_base_url.into(),
            link_secret: link_secret.into(),
        }
    }

    /// Render a body with recipient data
    pub fn render(&self, template: &str, contact: &Contact, broadcast_id: Option<BroadcastId>) -> String {
        let mut result = self.substitute(template, contact);

        let unsubscribe_url = self.unsubscribe_url(&contact.email, broadcast_id);
        result = result.replace("{{unsubscribe_url}}", &unsubscribe_url);

        remove_unused_placeholders(&result)
    }

    /// Render a subject line with recipient data
    pub fn render_subject(&self, subject: &str, contact: &Contact) -> String {
        remove_unused_placeholders(&self.substitute(subject, contact))
    }

    fn substitute(&self, template: &str, contact: &Contact) -> String {
        let mut result = template.replace("{{email}}", &contact.email);
        result = result.replace("{{name}}", contact.name.as_deref().unwrap_or(""));

        let parts: Vec<&str> = contact
            .name
            .as_deref()
            .map(|n| n.split_whitespace().collect())
            .unwrap_or_default();
        let first_name = parts.first().copied().unwrap_or("");
        let last_name = if parts.len() > 1 {
            parts[1..].join(" ")
        } else {
            String::new()
        };
        result = result.replace("{{first_name}}", first_name);
        result = result.replace("{{last_name}}", &last_name);

        if let Some(attrs) = contact.attributes.as_object() {
            for (key, value) in attrs {
                let placeholder = format!("{{{{attributes.{}}}}}", key);
                let value_str = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => value.to_string(),
                };
                result = result.replace(&placeholder, &value_str);
            }
        }

        result
    }

    /// Signed unsubscribe URL for a recipient
    pub fn unsubscribe_url(&self, email: &str, broadcast_id: Option<BroadcastId>) -> String {
        format!(
            "{}/{}",
            self.unsubscribe_base_url.trim_end_matches('/'),
            self.unsubscribe_token(email, broadcast_id)
        )
    }

    /// `List-Unsubscribe` header value
    pub fn list_unsubscribe_header(&self, email: &str, broadcast_id: Option<BroadcastId>) -> String {
        format!("<{}>", self.unsubscribe_url(email, broadcast_id))
    }

    fn sign(&self, payload: &str) -> String {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(self.link_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(payload.as_bytes());
        hex::encode(&mac.finalize().into_bytes()[..16])
    }

    fn unsubscribe_token(&self, email: &str, broadcast_id: Option<BroadcastId>) -> String {
        let payload = match broadcast_id {
            Some(id) => format!("{}:{}", email, id),
            None => email.to_string(),
        };
        let token_data = format!("{}:{}", payload, self.sign(&payload));
        URL_SAFE_NO_PAD.encode(token_data.as_bytes())
    }

    /// Verify a token and extract the email and broadcast it was issued for
    pub fn parse_unsubscribe_token(&self, token: &str) -> Option<(String, Option<BroadcastId>)> {
        let decoded = URL_SAFE_NO_PAD.decode(token).ok()?;
        let token_data = String::from_utf8(decoded).ok()?;

        let (payload, signature) = token_data.rsplit_once(':')?;
        if self.sign(payload) != signature {
            return None;
        }

        match payload.rsplit_once(':') {
            Some((email, id)) if Uuid::parse_str(id).is_ok() => {
                Some((email.to_string(), Uuid::parse_str(id).ok()))
            }
            _ => Some((payload.to_string(), None)),
        }
    }
}

fn remove_unused_placeholders(content: &str) -> String {
    placeholder_pattern().replace_all(content, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact {
            email: "test@example.com".to_string(),
            name: Some("John Doe".to_string()),
            timezone: None,
            attributes: serde_json::json!({
                "company": "Acme Corp",
                "plan": "premium"
            }),
        }
    }

    fn personalizer() -> Personalizer {
        Personalizer::new("https://mail.example.com/unsubscribe", "secret")
    }

    #[tokio::test]
    async fn test_file_templates() {
        let dir = std::env::temp_dir().join(format!("mailcast-templates-{}", Uuid::new_v4()));
        let template_id = Uuid::new_v4();
        std::fs::create_dir_all(dir.join(template_id.to_string())).unwrap();
        std::fs::write(dir.join(template_id.to_string()).join("2.html"), "<p>v2</p>").unwrap();

        let templates = FileTemplates::new(&dir);
        assert_eq!(templates.render(template_id, 2).await.unwrap(), "<p>v2</p>");
        assert!(matches!(
            templates.render(template_id, 3).await,
            Err(Error::TemplateNotFound(_))
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_render_basic_variables() {
        let result = personalizer().render(
            "Hello {{first_name}} {{last_name}} <{{email}}>",
            &contact(),
            None,
        );
        assert_eq!(result, "Hello John Doe <test@example.com>");
    }

    #[test]
    fn test_render_attributes_and_unknown_placeholders() {
        let result = personalizer().render(
            "{{attributes.company}} on {{attributes.plan}}{{attributes.missing}}",
            &contact(),
            None,
        );
        assert_eq!(result, "Acme Corp on premium");
    }

    #[test]
    fn test_unsubscribe_token_round_trip() {
        let p = personalizer();
        let broadcast_id = Uuid::new_v4();
        let url = p.unsubscribe_url("test@example.com", Some(broadcast_id));
        let token = url.rsplit('/').next().unwrap();

        let parsed = p.parse_unsubscribe_token(token).unwrap();
        assert_eq!(parsed, ("test@example.com".to_string(), Some(broadcast_id)));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let p = personalizer();
        let forged = URL_SAFE_NO_PAD.encode(b"victim@example.com:deadbeef");
        assert!(p.parse_unsubscribe_token(&forged).is_none());

        let other = Personalizer::new("https://mail.example.com/unsubscribe", "other-secret");
        let url = other.unsubscribe_url("test@example.com", None);
        let token = url.rsplit('/').next().unwrap();
        assert!(p.parse_unsubscribe_token(token).is_none());
    }

    #[tokio::test]
    async fn test_in_memory_templates() {
        let templates = InMemoryTemplates::new();
        let id = Uuid::new_v4();
        templates.insert(id, 2, "<p>Hi</p>").await;

        assert_eq!(templates.render(id, 2).await.unwrap(), "<p>Hi</p>");
        assert!(matches!(
            templates.render(id, 1).await,
            Err(Error::TemplateNotFound(_))
        ));
    }
}
