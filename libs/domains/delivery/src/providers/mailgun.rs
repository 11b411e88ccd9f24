//! Mailgun driver (messages API, form-encoded).

use super::{classify_request_error, classify_status, OutboundEmail, ProviderDriver, SendOutcome};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

/// Mailgun API configuration.
#[derive(Debug, Clone)]
pub struct MailgunConfig {
    pub api_key: String,
    /// Sending domain (e.g. "mg.example.com").
    pub domain: String,
    pub api_url: String,
}

impl MailgunConfig {
    pub fn new(api_key: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            domain: domain.into(),
            api_url: "https://api.mailgun.net/v3".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, String> {
        let api_key =
            std::env::var("MAILGUN_API_KEY").map_err(|_| "MAILGUN_API_KEY not set".to_string())?;
        let domain =
            std::env::var("MAILGUN_DOMAIN").map_err(|_| "MAILGUN_DOMAIN not set".to_string())?;
        Ok(Self::new(api_key, domain))
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

pub struct MailgunDriver {
    config: MailgunConfig,
    client: Client,
}

impl MailgunDriver {
    pub fn new(config: MailgunConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(Self::new(MailgunConfig::from_env()?))
    }
}

#[derive(Debug, Deserialize)]
struct MailgunResponse {
    #[serde(default)]
    id: Option<String>,
}

fn build_form(email: &OutboundEmail) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("from", email.from.clone()),
        // Mailgun takes the recipient list comma-joined, order preserved
        ("to", email.recipients.join(",")),
        ("subject", email.subject.clone()),
    ];

    if let Some(text) = &email.text {
        form.push(("text", text.clone()));
    }
    if let Some(html) = &email.html {
        form.push(("html", html.clone()));
    }
    if email.text.is_none() && email.html.is_none() {
        form.push(("text", String::new()));
    }

    form
}

#[async_trait]
impl ProviderDriver for MailgunDriver {
    async fn send(&self, email: &OutboundEmail, deadline: Duration) -> SendOutcome {
        let form = build_form(email);

        debug!(
            to = ?email.recipients,
            domain = %self.config.domain,
            "Dispatching via Mailgun"
        );

        let response = match self
            .client
            .post(format!(
                "{}/{}/messages",
                self.config.api_url, self.config.domain
            ))
            .basic_auth("api", Some(&self.config.api_key))
            .timeout(deadline)
            .form(&form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Mailgun request failed");
                return classify_request_error(e);
            }
        };

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .json::<MailgunResponse>()
                .await
                .ok()
                .and_then(|r| r.id);
            SendOutcome::Ok { message_id }
        } else {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Mailgun rejected dispatch");
            classify_status(status, &body)
        }
    }

    fn name(&self) -> &'static str {
        "mailgun"
    }

    async fn health_check(&self) -> bool {
        !self.config.api_key.is_empty() && !self.config.domain.is_empty()
    }
}
