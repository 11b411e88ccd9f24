//! Provider drivers.
//!
//! Each driver turns an [`OutboundEmail`] into a provider API call or SMTP
//! session and classifies the result into [`SendOutcome`]: the worker only
//! ever sees ok / transient / permanent.

mod mailgun;
mod sendgrid;
mod ses;
mod smtp;

pub use mailgun::{MailgunConfig, MailgunDriver};
pub use sendgrid::{SendGridConfig, SendGridDriver};
pub use ses::SesDriver;
pub use smtp::{SmtpConfig, SmtpDriver};

use crate::models::ProviderKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Rendered, addressed message handed to a driver.
#[derive(Debug, Clone, Default)]
pub struct OutboundEmail {
    pub from: String,
    /// Recipient order is preserved into the provider's "to" header.
    pub recipients: Vec<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
}

/// Result of a dispatch attempt, classified by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the provider.
    Ok {
        /// Provider-specific message id, when one is reported.
        message_id: Option<String>,
    },
    /// Worth retrying: network faults, timeouts, 5xx, 408, 429.
    Transient(String),
    /// Retrying cannot help: auth failures, rejected recipients, other 4xx.
    Permanent(String),
}

/// Trait for outbound email transports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Dispatch one message. Must honor `deadline` and never panic; all
    /// failures come back classified.
    async fn send(&self, email: &OutboundEmail, deadline: Duration) -> SendOutcome;

    /// Driver name for logging.
    fn name(&self) -> &'static str;

    /// Check whether the driver is configured/reachable.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Classify an HTTP response status for API providers: 408/429 and 5xx are
/// worth retrying, any other non-success is permanent.
pub(crate) fn classify_status(status: reqwest::StatusCode, detail: &str) -> SendOutcome {
    if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        SendOutcome::Transient(format!("{}: {}", status, detail))
    } else {
        SendOutcome::Permanent(format!("{}: {}", status, detail))
    }
}

/// Classify a reqwest transport error: connect/timeout failures are
/// transient by definition.
pub(crate) fn classify_request_error(err: reqwest::Error) -> SendOutcome {
    SendOutcome::Transient(format!("request failed: {}", err))
}

/// Driver lookup by provider kind.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<ProviderKind, Arc<dyn ProviderDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: ProviderKind, driver: Arc<dyn ProviderDriver>) -> Self {
        self.drivers.insert(kind, driver);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderDriver>> {
        self.drivers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.drivers.keys().copied().collect()
    }
}
