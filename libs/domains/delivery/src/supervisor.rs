//! Worker supervisor.
//!
//! Owns the process's worker tasks plus the singleton reclaim and
//! heartbeat loops. An exited worker is restarted with exponential
//! backoff; a drain signal lets in-flight jobs finish, and whatever is
//! still running after the drain timeout is aborted (its entries stay
//! pending and will be reclaimed elsewhere).

use crate::error::DeliveryResult;
use crate::metrics;
use crate::worker::{Worker, WorkerContext};
use queue_store::Priority;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const RESTART_BACKOFF_CAP_SECS: u64 = 30;

/// A worker that ran this long before exiting is considered to have been
/// healthy, so its restart backoff resets.
const STABLE_RUN: Duration = Duration::from_secs(60);

/// Stable per-process worker identity: host plus pid, shared by every
/// consumer in the process.
pub fn process_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

pub struct WorkerSupervisor {
    ctx: Arc<WorkerContext>,
    process_id: String,
}

impl WorkerSupervisor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            process_id: process_identity(),
        }
    }

    /// Override the process identity (tests).
    pub fn with_process_id(ctx: Arc<WorkerContext>, process_id: impl Into<String>) -> Self {
        Self {
            ctx,
            process_id: process_id.into(),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Start all workers and run until shutdown, then drain.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> DeliveryResult<()> {
        info!(
            process_id = %self.process_id,
            worker_count = self.ctx.config.worker_count,
            "Starting worker supervisor"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();

        for slot in 0..self.ctx.config.worker_count {
            let consumer = format!("{}#{}", self.process_id, slot);
            tasks.spawn(Self::supervise_worker(
                self.ctx.clone(),
                consumer,
                shutdown.clone(),
            ));
        }

        tasks.spawn(Self::reclaim_loop(
            self.ctx.clone(),
            format!("{}#reclaim", self.process_id),
            shutdown.clone(),
        ));
        tasks.spawn(Self::heartbeat_loop(
            self.ctx.clone(),
            self.process_id.clone(),
            shutdown.clone(),
        ));

        // Wait for the shutdown signal
        let mut shutdown_rx = shutdown.clone();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!(
            drain_timeout_s = self.ctx.config.drain_timeout.as_secs(),
            "Draining workers"
        );

        let drained = tokio::time::timeout(self.ctx.config.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Drain timeout elapsed, aborting remaining workers");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        } else {
            info!("All workers drained cleanly");
        }

        Ok(())
    }

    /// Run one worker slot, restarting on failure with 1s..30s backoff.
    async fn supervise_worker(
        ctx: Arc<WorkerContext>,
        consumer: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff_secs: u64 = 1;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let worker = Worker::new(ctx.clone(), consumer.clone());
            let started = std::time::Instant::now();

            match worker.run(shutdown.clone()).await {
                // A clean exit means the worker observed shutdown
                Ok(()) => break,
                Err(e) => {
                    if started.elapsed() >= STABLE_RUN {
                        backoff_secs = 1;
                    }

                    error!(
                        consumer = %consumer,
                        error = %e,
                        restart_in_s = backoff_secs,
                        "Worker exited with error, restarting"
                    );

                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(RESTART_BACKOFF_CAP_SECS);
                }
            }
        }
    }

    /// Periodic reclaim of entries abandoned past the pending timeout.
    /// One per process; claimed entries run through the normal path.
    async fn reclaim_loop(
        ctx: Arc<WorkerContext>,
        consumer: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = ctx.config.reclaim_interval;
        let worker = Worker::new(ctx, consumer);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = worker.reclaim_pass().await {
                        debug!(error = %e, "Reclaim pass failed");
                    }
                }
            }
        }
    }

    /// Refresh the process heartbeat and the queue-depth gauges.
    async fn heartbeat_loop(
        ctx: Arc<WorkerContext>,
        process_id: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let ttl = ctx.config.heartbeat_ttl;
        let interval = ttl / 3;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = ctx.store.heartbeat(&process_id, ttl).await {
                debug!(error = %e, "Heartbeat write failed");
            }

            for priority in Priority::ALL {
                if let Ok(depth) = ctx.store.stream_len(priority).await {
                    metrics::set_queue_depth(priority.as_str(), depth as f64);
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
