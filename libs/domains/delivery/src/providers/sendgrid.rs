//! SendGrid driver (v3 mail send API).

use super::{classify_request_error, classify_status, OutboundEmail, ProviderDriver, SendOutcome};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error};

/// SendGrid API configuration.
#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    /// API base URL; overridable for tests and regional endpoints.
    pub api_url: String,
}

impl SendGridConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: "https://api.sendgrid.com/v3".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, String> {
        let api_key =
            std::env::var("SENDGRID_API_KEY").map_err(|_| "SENDGRID_API_KEY not set".to_string())?;
        Ok(Self::new(api_key))
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

pub struct SendGridDriver {
    config: SendGridConfig,
    client: Client,
}

impl SendGridDriver {
    pub fn new(config: SendGridConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(Self::new(SendGridConfig::from_env()?))
    }
}

// SendGrid API request structures

#[derive(Debug, Serialize)]
struct SendGridRequest {
    personalizations: Vec<Personalization>,
    from: EmailAddress,
    subject: String,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Personalization {
    to: Vec<EmailAddress>,
}

#[derive(Debug, Serialize)]
struct EmailAddress {
    email: String,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(rename = "type")]
    content_type: String,
    value: String,
}

fn build_request(email: &OutboundEmail) -> SendGridRequest {
    // SendGrid requires plain text before HTML in the content array
    let mut content = Vec::new();
    if let Some(text) = &email.text {
        content.push(Content {
            content_type: "text/plain".to_string(),
            value: text.clone(),
        });
    }
    if let Some(html) = &email.html {
        content.push(Content {
            content_type: "text/html".to_string(),
            value: html.clone(),
        });
    }
    if content.is_empty() {
        content.push(Content {
            content_type: "text/plain".to_string(),
            value: String::new(),
        });
    }

    SendGridRequest {
        personalizations: vec![Personalization {
            to: email
                .recipients
                .iter()
                .map(|addr| EmailAddress {
                    email: addr.clone(),
                })
                .collect(),
        }],
        from: EmailAddress {
            email: email.from.clone(),
        },
        subject: email.subject.clone(),
        content,
    }
}

#[async_trait]
impl ProviderDriver for SendGridDriver {
    async fn send(&self, email: &OutboundEmail, deadline: Duration) -> SendOutcome {
        let request = build_request(email);

        debug!(
            to = ?email.recipients,
            subject = %email.subject,
            "Dispatching via SendGrid"
        );

        let response = match self
            .client
            .post(format!("{}/mail/send", self.config.api_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .timeout(deadline)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "SendGrid request failed");
                return classify_request_error(e);
            }
        };

        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            SendOutcome::Ok { message_id }
        } else {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "SendGrid rejected dispatch");
            classify_status(status, &body)
        }
    }

    fn name(&self) -> &'static str {
        "sendgrid"
    }

    async fn health_check(&self) -> bool {
        // No dedicated health endpoint; check the API key shape
        self.config.api_key.starts_with("SG.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_shapes_payload() {
        let email = OutboundEmail {
            from: "noreply@example.com".to_string(),
            recipients: vec!["a@x.io".to_string(), "b@x.io".to_string()],
            subject: "Hello".to_string(),
            html: Some("<p>Hi</p>".to_string()),
            text: Some("Hi".to_string()),
        };

        let request = build_request(&email);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["personalizations"][0]["to"][0]["email"], "a@x.io");
        assert_eq!(json["personalizations"][0]["to"][1]["email"], "b@x.io");
        assert_eq!(json["content"][0]["type"], "text/plain");
        assert_eq!(json["content"][1]["type"], "text/html");
    }

    #[test]
    fn test_build_request_empty_bodies() {
        let email = OutboundEmail {
            from: "noreply@example.com".to_string(),
            recipients: vec!["a@x.io".to_string()],
            subject: "Hello".to_string(),
            html: None,
            text: None,
        };

        let request = build_request(&email);
        assert_eq!(request.content.len(), 1);
        assert_eq!(request.content[0].content_type, "text/plain");
    }

    #[test]
    fn test_from_env_missing_key() {
        // Only meaningful when the variable is absent, which is the default
        if std::env::var("SENDGRID_API_KEY").is_err() {
            assert!(SendGridDriver::from_env().is_err());
        }
    }
}
