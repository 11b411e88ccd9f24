//! AWS SES driver (SES v2 API).
//!
//! Credentials come from the standard AWS SDK resolution chain
//! (environment variables, IRSA web identity, instance profile, shared
//! credentials file). The driver is only registered when a region is
//! configured.

use super::{OutboundEmail, ProviderDriver, SendOutcome};
use async_trait::async_trait;
use aws_sdk_sesv2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sesv2::operation::send_email::SendEmailError;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use aws_sdk_sesv2::Client;
use std::time::Duration;
use tracing::{debug, error};

pub struct SesDriver {
    client: Client,
}

impl SesDriver {
    /// Create a driver with an existing SES client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create from the default AWS SDK config. Requires `AWS_SES_REGION`
    /// or `AWS_REGION` so the driver is never registered by accident.
    pub async fn from_env() -> Result<Self, String> {
        let region = std::env::var("AWS_SES_REGION")
            .or_else(|_| std::env::var("AWS_REGION"))
            .map_err(|_| "AWS_SES_REGION or AWS_REGION not set".to_string())?;

        let config = aws_config::from_env()
            .region(aws_config::Region::new(region))
            .load()
            .await;

        Ok(Self::new(Client::new(&config)))
    }

    /// Create with explicit credentials (useful for testing).
    pub fn with_credentials(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        let credentials = aws_sdk_sesv2::config::Credentials::new(
            access_key_id,
            secret_access_key,
            None, // session token
            None, // expiry
            "manual",
        );

        let config = aws_sdk_sesv2::Config::builder()
            .region(aws_sdk_sesv2::config::Region::new(region.into()))
            .credentials_provider(credentials)
            .build();

        Self::new(Client::from_conf(config))
    }
}

fn build_destination(email: &OutboundEmail) -> Destination {
    let mut destination = Destination::builder();
    for recipient in &email.recipients {
        destination = destination.to_addresses(recipient);
    }
    destination.build()
}

/// Classify an SES failure: transport faults and throttling are worth
/// retrying, modeled service rejections are not.
fn classify_ses_error(err: &SdkError<SendEmailError>) -> SendOutcome {
    let detail = format!("ses: {}", DisplayErrorContext(err));

    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            SendOutcome::Transient(detail)
        }
        SdkError::ServiceError(_) => {
            let code = err.code().unwrap_or("");
            if code == "TooManyRequestsException"
                || code == "LimitExceededException"
                || code.contains("Internal")
                || code.contains("ServiceUnavailable")
            {
                SendOutcome::Transient(detail)
            } else {
                SendOutcome::Permanent(detail)
            }
        }
        _ => SendOutcome::Permanent(detail),
    }
}

#[async_trait]
impl ProviderDriver for SesDriver {
    async fn send(&self, email: &OutboundEmail, deadline: Duration) -> SendOutcome {
        let destination = build_destination(email);

        let subject = match Content::builder()
            .data(&email.subject)
            .charset("UTF-8")
            .build()
        {
            Ok(subject) => subject,
            Err(e) => return SendOutcome::Permanent(format!("ses: invalid subject: {}", e)),
        };

        let mut body = Body::builder();
        if let Some(text) = &email.text {
            match Content::builder().data(text).charset("UTF-8").build() {
                Ok(content) => body = body.text(content),
                Err(e) => return SendOutcome::Permanent(format!("ses: invalid text body: {}", e)),
            }
        }
        if let Some(html) = &email.html {
            match Content::builder().data(html).charset("UTF-8").build() {
                Ok(content) => body = body.html(content),
                Err(e) => return SendOutcome::Permanent(format!("ses: invalid html body: {}", e)),
            }
        }

        let message = Message::builder().subject(subject).body(body.build()).build();
        let content = EmailContent::builder().simple(message).build();

        debug!(
            to = ?email.recipients,
            subject = %email.subject,
            "Dispatching via AWS SES"
        );

        let request = self
            .client
            .send_email()
            .from_email_address(&email.from)
            .destination(destination)
            .content(content);

        match tokio::time::timeout(deadline, request.send()).await {
            Ok(Ok(response)) => SendOutcome::Ok {
                message_id: response.message_id().map(str::to_string),
            },
            Ok(Err(e)) => {
                error!(error = %DisplayErrorContext(&e), "AWS SES dispatch failed");
                classify_ses_error(&e)
            }
            Err(_) => SendOutcome::Transient(format!(
                "ses dispatch timed out after {}s",
                deadline.as_secs()
            )),
        }
    }

    fn name(&self) -> &'static str {
        "aws_ses"
    }

    async fn health_check(&self) -> bool {
        // GetAccount is a lightweight call that confirms credentials
        self.client.get_account().send().await.is_ok()
    }
}
