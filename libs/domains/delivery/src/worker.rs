//! Delivery worker: the central state machine.
//!
//! Each worker polls the priority streams through the shared consumer
//! group, gates on the provider rate bucket, renders, dispatches, and
//! routes the outcome: ack on success, DLQ on permanent failure, retry
//! controller on transient failure. A periodic reclaim pass picks up
//! entries abandoned by crashed workers.

use crate::audit::AuditTrail;
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::metrics::{self, JobStatus};
use crate::models::{FinalStatus, SendJob};
use crate::providers::{DriverRegistry, OutboundEmail, SendOutcome};
use crate::ratelimit::RateLimiter;
use crate::retry::RetryController;
use crate::templates::{self, RenderedEmail, TemplateEngine, TemplateError, FALLBACK_SUBJECT};
use crate::CONSUMER_GROUP;
use chrono::Utc;
use queue_store::{keys, Priority, QueueStore, QueuedEntry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// TTL on daily stat counters (48 h so yesterday stays readable).
const DAILY_COUNTER_TTL: Duration = Duration::from_secs(48 * 3600);

/// Pending entries examined per priority per reclaim pass.
const RECLAIM_BATCH: usize = 100;

const MAX_BACKOFF_SECS: u64 = 30;

/// Shared dependencies for every worker in the process.
pub struct WorkerContext {
    pub store: Arc<dyn QueueStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub templates: Arc<TemplateEngine>,
    pub drivers: Arc<DriverRegistry>,
    pub retry: Arc<RetryController>,
    pub audit: Arc<AuditTrail>,
    pub config: DeliveryConfig,
    in_flight: AtomicUsize,
}

impl WorkerContext {
    /// Wire up the engine around a store, drivers, and templates.
    pub fn new(
        store: Arc<dyn QueueStore>,
        config: DeliveryConfig,
        drivers: DriverRegistry,
        templates: TemplateEngine,
    ) -> Arc<Self> {
        let audit = Arc::new(AuditTrail::new(store.clone(), config.audit_ttl));
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), config.clone()));
        let retry = Arc::new(RetryController::new(
            store.clone(),
            audit.clone(),
            config.clone(),
        ));

        Arc::new(Self {
            store,
            rate_limiter,
            templates: Arc::new(templates),
            drivers: Arc::new(drivers),
            retry,
            audit,
            config,
            in_flight: AtomicUsize::new(0),
        })
    }
}

/// One long-running consumer.
pub struct Worker {
    ctx: Arc<WorkerContext>,
    /// Consumer name within the shared group; process identity plus slot.
    consumer: String,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>, consumer: impl Into<String>) -> Self {
        Self {
            ctx,
            consumer: consumer.into(),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Run the worker loop until shutdown.
    ///
    /// Store errors back the loop off exponentially without consuming
    /// jobs; a drain signal lets the in-flight job finish and then exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DeliveryResult<()> {
        info!(
            consumer = %self.consumer,
            group = %CONSUMER_GROUP,
            "Starting delivery worker"
        );

        self.ctx.store.ensure_group(CONSUMER_GROUP).await?;

        let block_ms = self.ctx.config.poll_block.as_millis() as u64;
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!(consumer = %self.consumer, "Received shutdown signal, stopping worker");
                break;
            }

            let read = tokio::select! {
                result = self.ctx.store.read_group(
                    CONSUMER_GROUP,
                    &self.consumer,
                    &Priority::ALL,
                    1,
                    block_ms,
                ) => result,
                changed = shutdown.changed() => {
                    // A dropped sender means nobody can drain us; stop.
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match read {
                Ok(entries) => {
                    if consecutive_errors > 0 {
                        info!("Store connection recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }

                    for entry in entries {
                        self.process_entry(entry).await;
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
                Err(e) if e.is_nogroup_error() => {
                    warn!("Consumer group missing, recreating...");
                    if let Err(create_err) = self.ctx.store.ensure_group(CONSUMER_GROUP).await {
                        error!(error = %create_err, "Failed to recreate consumer group");
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);

                    if e.is_connection_error() {
                        warn!(
                            error = %e,
                            consecutive_errors = %consecutive_errors,
                            backoff_secs = %backoff_secs,
                            "Store connection error, backing off"
                        );
                    } else {
                        error!(error = %e, "Error reading from queue store");
                    }

                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                }
            }
        }

        info!(consumer = %self.consumer, "Delivery worker stopped");
        Ok(())
    }

    /// Process one delivered entry end to end. Absorbs every failure:
    /// a job that cannot even be finalized stays pending and is picked up
    /// by a later reclaim pass.
    pub async fn process_entry(&self, entry: QueuedEntry) {
        let job: SendJob = match serde_json::from_str(&entry.payload) {
            Ok(job) => job,
            Err(e) => {
                self.discard_malformed(&entry, &e.to_string()).await;
                return;
            }
        };

        debug!(
            job_id = %job.job_id,
            entry_id = %entry.entry_id,
            priority = %entry.priority,
            attempt = job.attempt_count,
            "Processing job"
        );

        let current = self.ctx.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_in_flight_jobs(current as f64);

        let result = self.dispatch_job(&job, &entry).await;

        let current = self.ctx.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_in_flight_jobs(current as f64);

        if let Err(e) = result {
            // Left unacked on purpose: the entry becomes reclaimable after
            // the pending timeout, and the attempt count is unchanged.
            error!(
                job_id = %job.job_id,
                entry_id = %entry.entry_id,
                error = %e,
                "Failed to finalize job; entry left pending for reclaim"
            );
        }
    }

    async fn dispatch_job(&self, job: &SendJob, entry: &QueuedEntry) -> DeliveryResult<()> {
        // Rate gate: a refused token never consumes the job
        match self.ctx.rate_limiter.acquire(job.provider).await {
            Ok(()) => {}
            Err(DeliveryError::RateWaitExhausted(_)) => {
                return self
                    .ctx
                    .retry
                    .on_retriable_failure(
                        job,
                        &entry.entry_id,
                        entry.priority,
                        CONSUMER_GROUP,
                        "rate limit wait exhausted",
                    )
                    .await;
            }
            Err(e) => return Err(e),
        }

        let email = self.build_email(job);

        let Some(driver) = self.ctx.drivers.get(job.provider) else {
            let reason = format!("no driver configured for provider {}", job.provider);
            return self.handle_unclassified(job, entry, &reason).await;
        };

        let started = std::time::Instant::now();
        let timeout = self.ctx.config.dispatch_timeout;
        // The driver gets the deadline, and the worker enforces it too
        let outcome = match tokio::time::timeout(timeout, driver.send(&email, timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                SendOutcome::Transient(format!("dispatch timed out after {}s", timeout.as_secs()))
            }
        };
        metrics::record_dispatch_duration(job.provider.as_str(), started.elapsed());

        match outcome {
            SendOutcome::Ok { message_id } => self.complete_sent(job, entry, message_id).await,
            SendOutcome::Transient(reason) => {
                warn!(
                    job_id = %job.job_id,
                    provider = %job.provider,
                    reason = %reason,
                    "Transient dispatch failure"
                );
                self.ctx
                    .retry
                    .on_retriable_failure(job, &entry.entry_id, entry.priority, CONSUMER_GROUP, &reason)
                    .await
            }
            SendOutcome::Permanent(reason) => {
                warn!(
                    job_id = %job.job_id,
                    provider = %job.provider,
                    reason = %reason,
                    "Permanent dispatch failure"
                );
                self.ctx
                    .retry
                    .on_permanent_failure(job, &entry.entry_id, entry.priority, CONSUMER_GROUP, &reason)
                    .await
            }
        }
    }

    async fn complete_sent(
        &self,
        job: &SendJob,
        entry: &QueuedEntry,
        message_id: Option<String>,
    ) -> DeliveryResult<()> {
        self.ctx
            .store
            .ack(entry.priority, CONSUMER_GROUP, &entry.entry_id)
            .await?;

        // The entry is acked; counter writes past this point must not put
        // the job back on the failure path
        if let Err(e) = self.ctx.store.incr_counter(keys::STATS_SENT, 1).await {
            warn!(error = %e, "Failed to increment sent counter");
        }
        if let Err(e) = self
            .ctx
            .store
            .incr_counter_with_ttl(&keys::stats_sent_day(Utc::now()), 1, DAILY_COUNTER_TTL)
            .await
        {
            warn!(error = %e, "Failed to increment daily sent counter");
        }

        self.ctx
            .audit
            .record_terminal(
                &job.job_id.to_string(),
                FinalStatus::Sent,
                job.attempt_count,
                None,
            )
            .await;

        metrics::record_job_processed(job.provider.as_str(), JobStatus::Sent);

        info!(
            job_id = %job.job_id,
            provider = %job.provider,
            recipients = job.recipients.len(),
            message_id = ?message_id,
            "Email dispatched"
        );

        Ok(())
    }

    /// Conservative default when nothing classified the failure:
    /// retriable on the first attempt, permanent afterward.
    async fn handle_unclassified(
        &self,
        job: &SendJob,
        entry: &QueuedEntry,
        reason: &str,
    ) -> DeliveryResult<()> {
        if job.attempt_count == 0 {
            self.ctx
                .retry
                .on_retriable_failure(job, &entry.entry_id, entry.priority, CONSUMER_GROUP, reason)
                .await
        } else {
            self.ctx
                .retry
                .on_permanent_failure(job, &entry.entry_id, entry.priority, CONSUMER_GROUP, reason)
                .await
        }
    }

    /// Render the job into an outbound email. Rendering is best-effort:
    /// an unknown template or a render failure falls back to a plain-text
    /// dump of the context.
    fn build_email(&self, job: &SendJob) -> OutboundEmail {
        let rendered = match self
            .ctx
            .templates
            .render(&job.template_name, &job.template_context)
        {
            Ok(rendered) => rendered,
            Err(TemplateError::NotFound(name)) => {
                debug!(template = %name, job_id = %job.job_id, "Template not found, using fallback body");
                RenderedEmail {
                    subject: None,
                    html: None,
                    text: Some(templates::fallback_text(&job.template_context)),
                }
            }
            Err(TemplateError::Render(e)) => {
                warn!(error = %e, job_id = %job.job_id, "Template rendering failed, using fallback body");
                RenderedEmail {
                    subject: None,
                    html: None,
                    text: Some(templates::fallback_text(&job.template_context)),
                }
            }
        };

        let subject = job
            .subject
            .clone()
            .or(rendered.subject)
            .unwrap_or_else(|| FALLBACK_SUBJECT.to_string());

        OutboundEmail {
            from: self.ctx.config.mail_from.clone(),
            recipients: job.recipients.clone(),
            subject,
            html: rendered.html,
            text: rendered.text,
        }
    }

    /// Ack and discard an entry whose payload does not deserialize.
    async fn discard_malformed(&self, entry: &QueuedEntry, parse_error: &str) {
        warn!(
            entry_id = %entry.entry_id,
            error = %parse_error,
            "Malformed job payload, discarding"
        );

        if let Err(e) = self
            .ctx
            .store
            .ack(entry.priority, CONSUMER_GROUP, &entry.entry_id)
            .await
        {
            error!(entry_id = %entry.entry_id, error = %e, "Failed to ack malformed entry");
            return;
        }

        // Audit it when a job id is still recoverable from the payload
        let job_id = serde_json::from_str::<serde_json::Value>(&entry.payload)
            .ok()
            .and_then(|v| v.get("job_id").and_then(|id| id.as_str().map(String::from)));
        if let Some(job_id) = job_id {
            self.ctx
                .audit
                .record_terminal(
                    &job_id,
                    FinalStatus::Malformed,
                    0,
                    Some(parse_error.to_string()),
                )
                .await;
        }

        metrics::record_job_processed("unknown", JobStatus::Malformed);
    }

    /// Reclaim pass: claim entries idle past the pending timeout and run
    /// them through the normal processing path. The attempt count is not
    /// touched - this is a delivery reattempt, not a retry.
    pub async fn reclaim_pass(&self) -> DeliveryResult<usize> {
        let mut reclaimed = 0;

        for priority in Priority::ALL {
            let pending = self
                .ctx
                .store
                .pending(priority, CONSUMER_GROUP, RECLAIM_BATCH)
                .await?;

            let stale: Vec<String> = pending
                .into_iter()
                .filter(|p| p.idle_ms as u128 > self.ctx.config.pending_timeout.as_millis())
                .map(|p| p.entry_id)
                .collect();

            if stale.is_empty() {
                continue;
            }

            let claimed = self
                .ctx
                .store
                .claim(
                    priority,
                    CONSUMER_GROUP,
                    &self.consumer,
                    &stale,
                    self.ctx.config.pending_timeout,
                )
                .await?;

            for entry in claimed {
                reclaimed += 1;
                self.process_entry(entry).await;
            }
        }

        if reclaimed > 0 {
            info!(count = reclaimed, consumer = %self.consumer, "Reprocessed reclaimed entries");
        }

        Ok(reclaimed)
    }
}
