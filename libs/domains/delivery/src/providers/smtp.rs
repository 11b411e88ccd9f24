//! SMTP driver using lettre.
//!
//! Points at a relay in production and at Mailpit/MailHog in development.

use super::{OutboundEmail, ProviderDriver, SendOutcome};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{debug, error};

/// SMTP transport configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Username/password; optional for dev servers like Mailpit.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Whether to use TLS (false for local dev servers).
    pub use_tls: bool,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            use_tls: false,
        }
    }

    /// Configuration from `SMTP_*` environment variables, defaulting to a
    /// local Mailpit/MailHog on port 1025.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("SMTP_PORT")
                .unwrap_or_else(|_| "1025".to_string())
                .parse()
                .unwrap_or(1025),
            username: std::env::var("SMTP_USERNAME").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
            use_tls: std::env::var("SMTP_USE_TLS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }
}

/// SMTP provider driver.
pub struct SmtpDriver {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpDriver {
    pub fn new(config: &SmtpConfig) -> Result<Self, String> {
        Ok(Self {
            transport: build_transport(config)?,
        })
    }
}

fn build_transport(config: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
    let mut builder = if config.use_tls {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| format!("failed to create SMTP relay: {}", e))?
            .port(config.port)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host).port(config.port)
    };

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
    }

    Ok(builder.build())
}

/// Build a lettre message, preserving recipient order in the "to" header.
fn build_message(email: &OutboundEmail) -> Result<Message, String> {
    let from: Mailbox = email
        .from
        .parse()
        .map_err(|e| format!("invalid from address: {}", e))?;

    let mut builder = Message::builder().from(from).subject(&email.subject);

    for recipient in &email.recipients {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| format!("invalid recipient '{}': {}", recipient, e))?;
        builder = builder.to(to);
    }

    let message = match (&email.html, &email.text) {
        (Some(html), Some(text)) => builder.multipart(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(text.clone()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(html.clone()),
                ),
        ),
        (Some(html), None) => builder.singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(html.clone()),
        ),
        (None, text) => builder.singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone().unwrap_or_default()),
        ),
    };

    message.map_err(|e| format!("failed to build message: {}", e))
}

/// Classify a lettre SMTP failure: permanent response codes (5xx) cannot be
/// retried, everything else (4xx, connection, I/O) can.
fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> SendOutcome {
    if err.is_permanent() {
        SendOutcome::Permanent(format!("smtp: {}", err))
    } else {
        SendOutcome::Transient(format!("smtp: {}", err))
    }
}

#[async_trait]
impl ProviderDriver for SmtpDriver {
    async fn send(&self, email: &OutboundEmail, deadline: Duration) -> SendOutcome {
        let message = match build_message(email) {
            Ok(message) => message,
            // A message we cannot even build will never send
            Err(reason) => return SendOutcome::Permanent(reason),
        };

        debug!(
            to = ?email.recipients,
            subject = %email.subject,
            "Dispatching via SMTP"
        );

        match tokio::time::timeout(deadline, self.transport.send(message)).await {
            Ok(Ok(response)) => {
                let message_id = response.message().next().map(|s| s.to_string());
                SendOutcome::Ok { message_id }
            }
            Ok(Err(e)) => {
                error!(error = %e, "SMTP dispatch failed");
                classify_smtp_error(&e)
            }
            Err(_) => SendOutcome::Transient(format!(
                "smtp dispatch timed out after {}s",
                deadline.as_secs()
            )),
        }
    }

    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn health_check(&self) -> bool {
        self.transport.test_connection().await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smtp_config_new() {
        let config = SmtpConfig::new("localhost", 1025);
        assert!(!config.use_tls);
        assert!(config.username.is_none());

        let config = SmtpConfig::new("smtp.example.com", 587)
            .with_tls(true)
            .with_credentials("user".to_string(), "pass".to_string());
        assert!(config.use_tls);
        assert_eq!(config.username.as_deref(), Some("user"));
    }

    #[test]
    fn test_build_message_preserves_recipient_order() {
        let email = OutboundEmail {
            from: "noreply@example.com".to_string(),
            recipients: vec![
                "first@example.com".to_string(),
                "second@example.com".to_string(),
            ],
            subject: "Hello".to_string(),
            html: Some("<p>Hi</p>".to_string()),
            text: Some("Hi".to_string()),
        };

        let message = build_message(&email).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        let first = raw.find("first@example.com").unwrap();
        let second = raw.find("second@example.com").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_build_message_rejects_bad_from() {
        let email = OutboundEmail {
            from: "not an address".to_string(),
            recipients: vec!["a@example.com".to_string()],
            subject: "x".to_string(),
            html: None,
            text: Some("body".to_string()),
        };

        assert!(build_message(&email).is_err());
    }

    #[test]
    fn test_build_message_text_only() {
        let email = OutboundEmail {
            from: "noreply@example.com".to_string(),
            recipients: vec!["a@example.com".to_string()],
            subject: "x".to_string(),
            html: None,
            text: Some("plain body".to_string()),
        };

        let message = build_message(&email).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("plain body"));
    }
}
