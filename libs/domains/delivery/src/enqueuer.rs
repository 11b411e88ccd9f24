//! Enqueuer: accepts validated requests and persists jobs.
//!
//! A job, its `queued` audit record, and the calling service's aggregates
//! are written in one atomic store transaction, so a returned job id means
//! the job durably exists and partial enqueue is impossible.

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{validate_recipients, AuditRecord, EnqueueRequest, EnqueueResult, FinalStatus, SendJob};
use chrono::Utc;
use queue_store::{EnqueueRecord, QueueStore};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct Enqueuer {
    store: Arc<dyn QueueStore>,
    config: DeliveryConfig,
}

impl Enqueuer {
    pub fn new(store: Arc<dyn QueueStore>, config: DeliveryConfig) -> Self {
        Self { store, config }
    }

    /// Validate and persist a send request on behalf of `submitted_by`.
    ///
    /// Future-dated jobs go to the parked set and re-enter through the
    /// scheduler; everything else lands on the ready stream for its
    /// priority. Validation failures surface before anything is written.
    pub async fn enqueue(
        &self,
        request: EnqueueRequest,
        submitted_by: &str,
    ) -> DeliveryResult<EnqueueResult> {
        validate_recipients(&request.recipients)?;
        if request.template.trim().is_empty() {
            return Err(DeliveryError::Validation(
                "template name must not be empty".to_string(),
            ));
        }

        let endpoint = request.endpoint_label.clone();
        let job = SendJob {
            job_id: Uuid::new_v4(),
            recipients: request.recipients,
            template_name: request.template,
            template_context: request.context,
            subject: request.subject,
            priority: request.priority.unwrap_or_default(),
            provider: request.provider.unwrap_or(self.config.default_provider),
            scheduled_for: request.scheduled_for,
            submitted_by: submitted_by.to_string(),
            submitted_at: Utc::now(),
            attempt_count: 0,
        };

        let payload = serde_json::to_string(&job)?;
        let audit_json = serde_json::to_string(&AuditRecord::queued(&job, &endpoint))?;
        let job_id = job.job_id.to_string();

        let record = EnqueueRecord {
            job_id: &job_id,
            payload: &payload,
            service: submitted_by,
            endpoint: &endpoint,
            recipient_count: job.recipients.len() as u64,
            audit_json: &audit_json,
            audit_ttl: self.config.audit_ttl,
        };

        // A timestamp exactly at now is already due: it goes ready, not parked.
        let now = Utc::now();
        let queue_position = match job.scheduled_for {
            Some(due_at) if due_at > now => {
                self.store
                    .enqueue_parked(due_at.timestamp_millis(), record)
                    .await?;
                let parked = self.store.parked_len().await?;
                debug!(job_id = %job_id, due_at = %due_at, "Parked future-dated job");
                parked
            }
            _ => {
                let (entry_id, stream_len) =
                    self.store.enqueue_ready(job.priority, record).await?;
                debug!(job_id = %job_id, entry_id = %entry_id, "Appended job to ready stream");
                stream_len
            }
        };

        info!(
            job_id = %job_id,
            service = %submitted_by,
            priority = %job.priority,
            provider = %job.provider,
            recipients = job.recipients.len(),
            "Enqueued send job"
        );

        Ok(EnqueueResult {
            job_id: job.job_id,
            status: FinalStatus::Queued,
            queue_position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_store::{MemoryQueueStore, Priority};

    fn request(recipients: Vec<&str>) -> EnqueueRequest {
        EnqueueRequest {
            recipients: recipients.into_iter().map(String::from).collect(),
            template: "welcome".to_string(),
            context: serde_json::Map::new(),
            subject: None,
            priority: None,
            provider: None,
            scheduled_for: None,
            endpoint_label: "send".to_string(),
        }
    }

    fn enqueuer() -> (Arc<MemoryQueueStore>, Enqueuer) {
        let store = Arc::new(MemoryQueueStore::new());
        let enqueuer = Enqueuer::new(store.clone(), DeliveryConfig::default());
        (store, enqueuer)
    }

    #[tokio::test]
    async fn test_enqueue_lands_exactly_once_on_its_stream() {
        let (store, enqueuer) = enqueuer();

        let result = enqueuer.enqueue(request(vec!["a@x.io"]), "billing").await.unwrap();
        assert_eq!(result.status, FinalStatus::Queued);
        assert_eq!(result.queue_position, 1);

        // On the medium stream, nowhere else
        assert_eq!(store.stream_len(Priority::Medium).await.unwrap(), 1);
        assert_eq!(store.stream_len(Priority::High).await.unwrap(), 0);
        assert_eq!(store.parked_len().await.unwrap(), 0);
        assert_eq!(store.dlq_len().await.unwrap(), 0);

        // Audit record written with queued status
        let audit = store
            .get_audit(&result.job_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(audit.contains("\"queued\""));
        assert!(audit.contains("billing"));
    }

    #[tokio::test]
    async fn test_empty_recipients_refused_before_persisting() {
        let (store, enqueuer) = enqueuer();

        let err = enqueuer.enqueue(request(vec![]), "billing").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
        assert_eq!(store.stream_len(Priority::Medium).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_recipient_refused() {
        let (_, enqueuer) = enqueuer();
        let err = enqueuer
            .enqueue(request(vec!["not an address"]), "billing")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_future_job_is_parked_not_ready() {
        let (store, enqueuer) = enqueuer();

        let mut req = request(vec!["a@x.io"]);
        req.scheduled_for = Some(Utc::now() + chrono::Duration::minutes(5));

        enqueuer.enqueue(req, "billing").await.unwrap();
        assert_eq!(store.parked_len().await.unwrap(), 1);
        assert_eq!(store.stream_len(Priority::Medium).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scheduled_for_in_past_goes_ready() {
        let (store, enqueuer) = enqueuer();

        let mut req = request(vec!["a@x.io"]);
        req.scheduled_for = Some(Utc::now() - chrono::Duration::seconds(1));

        enqueuer.enqueue(req, "billing").await.unwrap();
        assert_eq!(store.parked_len().await.unwrap(), 0);
        assert_eq!(store.stream_len(Priority::Medium).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_request_twice_yields_distinct_jobs() {
        let (store, enqueuer) = enqueuer();

        let first = enqueuer.enqueue(request(vec!["a@x.io"]), "billing").await.unwrap();
        let second = enqueuer.enqueue(request(vec!["a@x.io"]), "billing").await.unwrap();

        assert_ne!(first.job_id, second.job_id);
        assert_eq!(store.stream_len(Priority::Medium).await.unwrap(), 2);
        assert_eq!(second.queue_position, 2);
    }

    #[tokio::test]
    async fn test_priority_routes_to_matching_stream() {
        let (store, enqueuer) = enqueuer();

        let mut req = request(vec!["a@x.io"]);
        req.priority = Some(Priority::High);
        enqueuer.enqueue(req, "billing").await.unwrap();

        assert_eq!(store.stream_len(Priority::High).await.unwrap(), 1);
        assert_eq!(store.stream_len(Priority::Medium).await.unwrap(), 0);
    }
}
