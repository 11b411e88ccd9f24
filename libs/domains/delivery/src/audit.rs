//! Audit trail: per-job records and per-service aggregates.
//!
//! The enqueue-time record is written inside the enqueuer's store
//! transaction; everything here happens after that. Terminal writes are
//! best-effort: a failure is logged and absorbed, never surfaced into the
//! dispatch path.

use crate::models::{AuditRecord, FinalStatus};
use crate::{DeliveryError, DeliveryResult};
use queue_store::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct AuditTrail {
    store: Arc<dyn QueueStore>,
    ttl: Duration,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn QueueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Record a terminal transition for a job. Best-effort: errors are
    /// logged at `warn` and swallowed.
    pub async fn record_terminal(
        &self,
        job_id: &str,
        status: FinalStatus,
        attempt_count: u32,
        last_error: Option<String>,
    ) {
        if let Err(e) = self
            .try_record_terminal(job_id, status, attempt_count, last_error)
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to write audit record");
        }
    }

    async fn try_record_terminal(
        &self,
        job_id: &str,
        status: FinalStatus,
        attempt_count: u32,
        last_error: Option<String>,
    ) -> DeliveryResult<()> {
        // Preserve attribution from the enqueue-time record when present;
        // a missing record (expired, or enqueue raced a crash) still gets
        // a terminal stub so the job's outcome is queryable.
        let record = match self.fetch(job_id).await? {
            Some(existing) => existing.with_outcome(status, attempt_count, last_error),
            None => AuditRecord {
                submitted_by: String::new(),
                endpoint: String::new(),
                submitted_at: chrono::Utc::now(),
                template_name: String::new(),
                recipient_count: 0,
                final_status: status,
                attempt_count,
                last_error,
            },
        };

        let json = serde_json::to_string(&record)?;
        self.store.put_audit(job_id, &json, self.ttl).await?;
        Ok(())
    }

    /// Fetch the audit record for a job.
    pub async fn fetch(&self, job_id: &str) -> DeliveryResult<Option<AuditRecord>> {
        let Some(json) = self.store.get_audit(job_id).await? else {
            return Ok(None);
        };

        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| DeliveryError::Internal(format!("corrupt audit record: {}", e)))
    }
}
