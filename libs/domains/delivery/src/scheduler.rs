//! Scheduler: promotes due parked jobs onto their ready streams.
//!
//! One logical promoter must run per deployment. Instances race for a
//! short-lived leader lock each tick; whoever holds it promotes, everyone
//! else idles. The promotion itself is a single atomic store script, so a
//! lost leadership mid-batch cannot duplicate a job.

use crate::config::DeliveryConfig;
use crate::error::DeliveryResult;
use chrono::Utc;
use queue_store::{keys, QueueStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Jobs promoted per tick at most.
const PROMOTE_BATCH: usize = 128;

pub struct Scheduler {
    store: Arc<dyn QueueStore>,
    config: DeliveryConfig,
    /// Lock owner identity; stable for the process lifetime.
    owner: String,
}

impl Scheduler {
    pub fn new(store: Arc<dyn QueueStore>, config: DeliveryConfig, owner: impl Into<String>) -> Self {
        Self {
            store,
            config,
            owner: owner.into(),
        }
    }

    /// Run the promotion loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DeliveryResult<()> {
        info!(owner = %self.owner, tick_ms = self.config.scheduler_tick.as_millis() as u64, "Starting scheduler");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(promoted) if promoted > 0 => {
                    debug!(count = promoted, "Promoted parked jobs");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Scheduler tick failed");
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.scheduler_tick) => {}
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// One promotion pass: acquire (or refresh) leadership, then move every
    /// parked job due by now. Returns how many jobs were promoted; zero if
    /// not the leader.
    pub async fn tick(&self) -> DeliveryResult<u64> {
        if !self
            .store
            .try_lock(keys::SCHEDULER_LEADER, &self.owner, self.lock_ttl())
            .await?
        {
            return Ok(0);
        }

        let promoted = self
            .store
            .promote_due(Utc::now().timestamp_millis(), PROMOTE_BATCH)
            .await?;
        Ok(promoted)
    }

    /// Lock outlives three missed ticks, so a crashed leader is replaced
    /// quickly without flapping on slow ticks.
    fn lock_ttl(&self) -> Duration {
        self.config.scheduler_tick * 3
    }
}
