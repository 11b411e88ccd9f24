//! Retry/DLQ controller.
//!
//! Decides what happens after a retriable failure: schedule a delayed
//! retry through the parked set, or move the job to the dead-letter map
//! once its attempts are spent. Retries always re-enter via the scheduler
//! so the delay is exact.

use crate::audit::AuditTrail;
use crate::config::DeliveryConfig;
use crate::error::DeliveryResult;
use crate::metrics::{self, JobStatus};
use crate::models::{DeadLetterEntry, FinalStatus, SendJob};
use chrono::Utc;
use queue_store::{keys, Priority, QueueStore};
use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// TTL on daily stat counters (48 h so yesterday stays readable).
const DAILY_COUNTER_TTL: Duration = Duration::from_secs(48 * 3600);

pub struct RetryController {
    store: Arc<dyn QueueStore>,
    audit: Arc<AuditTrail>,
    config: DeliveryConfig,
}

impl RetryController {
    pub fn new(store: Arc<dyn QueueStore>, audit: Arc<AuditTrail>, config: DeliveryConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    /// Handle a retriable failure for the given in-flight entry.
    ///
    /// Increments the attempt count; at `max_attempts` the job is
    /// dead-lettered, otherwise it is parked with an exponential backoff
    /// delay (±20% jitter). The original entry is acked in both paths.
    pub async fn on_retriable_failure(
        &self,
        job: &SendJob,
        entry_id: &str,
        priority: Priority,
        group: &str,
        reason: &str,
    ) -> DeliveryResult<()> {
        let attempts = job.attempt_count + 1;

        if attempts >= self.config.max_attempts {
            self.move_to_dlq(job, attempts, reason).await?;
            self.store.ack(priority, group, entry_id).await?;
            return Ok(());
        }

        let delay = self.retry_delay(attempts);
        let due_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let retry_job = job.for_retry(due_at);
        let payload = serde_json::to_string(&retry_job)?;

        self.store.park(&payload, due_at.timestamp_millis()).await?;
        self.store.ack(priority, group, entry_id).await?;

        metrics::record_retry(job.provider.as_str(), attempts);
        metrics::record_job_processed(job.provider.as_str(), JobStatus::Retried);

        info!(
            job_id = %job.job_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Scheduled retry"
        );

        Ok(())
    }

    /// Dead-letter a job immediately (permanent failure) and ack its entry.
    pub async fn on_permanent_failure(
        &self,
        job: &SendJob,
        entry_id: &str,
        priority: Priority,
        group: &str,
        reason: &str,
    ) -> DeliveryResult<()> {
        self.move_to_dlq(job, job.attempt_count, reason).await?;
        self.store.ack(priority, group, entry_id).await?;
        Ok(())
    }

    async fn move_to_dlq(&self, job: &SendJob, attempts: u32, reason: &str) -> DeliveryResult<()> {
        let entry = DeadLetterEntry {
            job_id: job.job_id,
            job: SendJob {
                attempt_count: attempts,
                ..job.clone()
            },
            failure_reason: reason.to_string(),
            final_attempt_count: attempts,
            moved_at: Utc::now(),
        };

        let job_id = job.job_id.to_string();
        self.store
            .dlq_put(&job_id, &serde_json::to_string(&entry)?)
            .await?;

        self.store.incr_counter(keys::STATS_FAILED, 1).await?;
        self.store
            .incr_counter_with_ttl(&keys::stats_failed_day(Utc::now()), 1, DAILY_COUNTER_TTL)
            .await?;

        self.audit
            .record_terminal(
                &job_id,
                FinalStatus::FailedPermanent,
                attempts,
                Some(reason.to_string()),
            )
            .await;

        metrics::record_job_processed(job.provider.as_str(), JobStatus::DeadLettered);

        warn!(
            job_id = %job.job_id,
            attempts = attempts,
            reason = %reason,
            "Job moved to dead-letter queue"
        );

        Ok(())
    }

    /// Exponential backoff with ±20% jitter: `base · 2^(attempt-1)`.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_retry_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));

        let jitter = rand::rng().random_range(0.8..=1.2);
        Duration::from_millis((exp_ms as f64 * jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use queue_store::MemoryQueueStore;
    use uuid::Uuid;

    fn job(attempt_count: u32) -> SendJob {
        SendJob {
            job_id: Uuid::new_v4(),
            recipients: vec!["a@example.com".to_string()],
            template_name: "welcome".to_string(),
            template_context: serde_json::Map::new(),
            subject: None,
            priority: Priority::Medium,
            provider: ProviderKind::Smtp,
            scheduled_for: None,
            submitted_by: "svc".to_string(),
            submitted_at: Utc::now(),
            attempt_count,
        }
    }

    fn controller(base_delay: Duration, max_attempts: u32) -> (Arc<MemoryQueueStore>, RetryController) {
        let store = Arc::new(MemoryQueueStore::new());
        let mut config = DeliveryConfig::default();
        config.base_retry_delay = base_delay;
        config.max_attempts = max_attempts;
        let audit = Arc::new(AuditTrail::new(store.clone(), config.audit_ttl));
        let controller = RetryController::new(store.clone(), audit, config);
        (store, controller)
    }

    async fn deliver_one(store: &Arc<MemoryQueueStore>, payload: &str) -> String {
        store.append(Priority::Medium, payload).await.unwrap();
        let entries = store
            .read_group("g", "c", &Priority::ALL, 1, 0)
            .await
            .unwrap();
        entries[0].entry_id.clone()
    }

    #[tokio::test]
    async fn test_first_failure_parks_with_incremented_attempt() {
        let (store, controller) = controller(Duration::from_secs(60), 3);
        let job = job(0);
        let entry_id = deliver_one(&store, &serde_json::to_string(&job).unwrap()).await;

        controller
            .on_retriable_failure(&job, &entry_id, Priority::Medium, "g", "timeout")
            .await
            .unwrap();

        assert_eq!(store.parked_len().await.unwrap(), 1);
        assert_eq!(store.dlq_len().await.unwrap(), 0);

        // Entry is acked
        let pending = store.pending(Priority::Medium, "g", 10).await.unwrap();
        assert!(pending.is_empty());

        // Parked payload carries attempt_count = 1 and a future due time
        let parked = store.promote_due(i64::MAX, 10).await.unwrap();
        assert_eq!(parked, 1);
        let entries = store
            .read_group("g", "c", &Priority::ALL, 1, 0)
            .await
            .unwrap();
        let retried: SendJob = serde_json::from_str(&entries[0].payload).unwrap();
        assert_eq!(retried.attempt_count, 1);
        assert!(retried.scheduled_for.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_move_to_dlq() {
        let (store, controller) = controller(Duration::from_secs(1), 3);
        let job = job(2);
        let entry_id = deliver_one(&store, &serde_json::to_string(&job).unwrap()).await;

        controller
            .on_retriable_failure(&job, &entry_id, Priority::Medium, "g", "still failing")
            .await
            .unwrap();

        assert_eq!(store.parked_len().await.unwrap(), 0);
        assert_eq!(store.dlq_len().await.unwrap(), 1);
        assert_eq!(store.get_counter(keys::STATS_FAILED).await.unwrap(), 1);

        let entry_json = store
            .dlq_get(&job.job_id.to_string())
            .await
            .unwrap()
            .unwrap();
        let entry: DeadLetterEntry = serde_json::from_str(&entry_json).unwrap();
        assert_eq!(entry.final_attempt_count, 3);
        assert_eq!(entry.failure_reason, "still failing");

        // Audit reflects the terminal state
        let audit = store
            .get_audit(&job.job_id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(audit.contains("failed_permanent"));
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let (store, controller) = controller(Duration::from_secs(60), 3);
        let job = job(0);
        let entry_id = deliver_one(&store, &serde_json::to_string(&job).unwrap()).await;

        controller
            .on_permanent_failure(&job, &entry_id, Priority::Medium, "g", "550 no such user")
            .await
            .unwrap();

        assert_eq!(store.parked_len().await.unwrap(), 0);
        assert_eq!(store.dlq_len().await.unwrap(), 1);
    }

    #[test]
    fn test_retry_delay_doubles_with_jitter() {
        let (_, controller) = {
            let store = Arc::new(MemoryQueueStore::new());
            let mut config = DeliveryConfig::default();
            config.base_retry_delay = Duration::from_secs(60);
            let audit = Arc::new(AuditTrail::new(store.clone(), config.audit_ttl));
            (store.clone(), RetryController::new(store, audit, config))
        };

        let first = controller.retry_delay(1).as_millis() as f64;
        let second = controller.retry_delay(2).as_millis() as f64;

        // 60s and 120s centers, each within ±20%
        assert!((48_000.0..=72_000.0).contains(&first), "{first}");
        assert!((96_000.0..=144_000.0).contains(&second), "{second}");
    }
}
