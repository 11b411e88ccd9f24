//! Data models for the delivery domain.

use crate::error::{DeliveryError, DeliveryResult};
use chrono::{DateTime, Utc};
use queue_store::Priority;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::ValidateEmail;

// ============================================================================
// Provider selection
// ============================================================================

/// Outbound transport for a job. Selects both a driver and a rate bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Smtp,
    Sendgrid,
    Mailgun,
    AwsSes,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Smtp,
        ProviderKind::Sendgrid,
        ProviderKind::Mailgun,
        ProviderKind::AwsSes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Smtp => "smtp",
            ProviderKind::Sendgrid => "sendgrid",
            ProviderKind::Mailgun => "mailgun",
            ProviderKind::AwsSes => "aws_ses",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "smtp" => Some(ProviderKind::Smtp),
            "sendgrid" => Some(ProviderKind::Sendgrid),
            "mailgun" => Some(ProviderKind::Mailgun),
            "aws_ses" => Some(ProviderKind::AwsSes),
            _ => None,
        }
    }

    /// Rate bucket key for this provider.
    pub fn bucket_key(&self) -> String {
        queue_store::keys::rate_bucket(self.as_str())
    }
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::Smtp
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job envelope
// ============================================================================

/// A persisted send request. Immutable after enqueue except for
/// `attempt_count`, which only the retry controller mutates, and
/// `scheduled_for`, which the retry path rewrites to place the next
/// attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendJob {
    /// Unique job identifier, assigned at enqueue time.
    pub job_id: Uuid,
    /// Ordered recipient addresses; duplicates allowed, order preserved.
    pub recipients: Vec<String>,
    /// Template resolved by the renderer.
    pub template_name: String,
    /// Free-form context handed to the renderer.
    #[serde(default)]
    pub template_context: serde_json::Map<String, serde_json::Value>,
    /// Subject override; the template may supply one instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub provider: ProviderKind,
    /// If set and in the future at enqueue time, the job is parked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Calling service identity, captured at enqueue.
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    /// Retry-controller passes completed so far.
    #[serde(default)]
    pub attempt_count: u32,
}

impl SendJob {
    /// Copy with an incremented attempt count and a new due time.
    pub fn for_retry(&self, due_at: DateTime<Utc>) -> Self {
        Self {
            attempt_count: self.attempt_count + 1,
            scheduled_for: Some(due_at),
            ..self.clone()
        }
    }
}

/// Syntactic validation for a recipient list: non-empty, every entry a
/// well-formed address.
pub fn validate_recipients(recipients: &[String]) -> DeliveryResult<()> {
    if recipients.is_empty() {
        return Err(DeliveryError::Validation(
            "recipients must not be empty".to_string(),
        ));
    }

    for recipient in recipients {
        if !recipient.validate_email() {
            return Err(DeliveryError::Validation(format!(
                "invalid email address: {}",
                recipient
            )));
        }
    }

    Ok(())
}

// ============================================================================
// Terminal states & audit
// ============================================================================

/// Terminal (or initial) status recorded in a job's audit record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Queued,
    Sent,
    FailedPermanent,
    Malformed,
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalStatus::Queued => write!(f, "queued"),
            FinalStatus::Sent => write!(f, "sent"),
            FinalStatus::FailedPermanent => write!(f, "failed_permanent"),
            FinalStatus::Malformed => write!(f, "malformed"),
        }
    }
}

/// Immutable-after-terminal record of a job's identity, attribution, and
/// final status. Keyed by job id; retained at least 30 days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub submitted_by: String,
    pub endpoint: String,
    pub submitted_at: DateTime<Utc>,
    pub template_name: String,
    pub recipient_count: usize,
    pub final_status: FinalStatus,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AuditRecord {
    /// The record written at enqueue time.
    pub fn queued(job: &SendJob, endpoint: &str) -> Self {
        Self {
            submitted_by: job.submitted_by.clone(),
            endpoint: endpoint.to_string(),
            submitted_at: job.submitted_at,
            template_name: job.template_name.clone(),
            recipient_count: job.recipients.len(),
            final_status: FinalStatus::Queued,
            attempt_count: 0,
            last_error: None,
        }
    }

    pub fn with_outcome(
        mut self,
        status: FinalStatus,
        attempt_count: u32,
        last_error: Option<String>,
    ) -> Self {
        self.final_status = status;
        self.attempt_count = attempt_count;
        self.last_error = last_error;
        self
    }
}

/// Terminal storage entry for a job that exceeded its attempts or failed
/// permanently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: Uuid,
    pub job: SendJob,
    pub failure_reason: String,
    pub final_attempt_count: u32,
    pub moved_at: DateTime<Utc>,
}

// ============================================================================
// Ingress contract
// ============================================================================

/// A send request as accepted from the ingress adapter, before the
/// enqueuer stamps identity and timestamps.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnqueueRequest {
    pub recipients: Vec<String>,
    pub template: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Label for per-service endpoint histograms (e.g. "send").
    #[serde(default = "default_endpoint_label")]
    pub endpoint_label: String,
}

fn default_endpoint_label() -> String {
    "send".to_string()
}

/// The enqueuer's answer: the job exists durably on its stream (or the
/// parked set) before this is returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub job_id: Uuid,
    pub status: FinalStatus,
    /// Approximate stream length at the time of enqueue.
    pub queue_position: u64,
}
