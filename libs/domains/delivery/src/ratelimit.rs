//! Per-provider rate gate.
//!
//! Bucket state lives in the queue store so every worker process draws
//! from the same budget; the check-and-consume itself is a single
//! server-side script. This module is the worker-facing gate: a
//! non-consuming soft wait with jittered backoff.

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::metrics;
use crate::models::ProviderKind;
use queue_store::QueueStore;
use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Bounds for the jittered pause between acquisition attempts.
const BACKOFF_MIN_MS: u64 = 50;
const BACKOFF_MAX_MS: u64 = 500;

pub struct RateLimiter {
    store: Arc<dyn QueueStore>,
    config: DeliveryConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QueueStore>, config: DeliveryConfig) -> Self {
        Self { store, config }
    }

    /// Single atomic check-and-consume against the provider's bucket.
    pub async fn try_acquire(&self, provider: ProviderKind) -> DeliveryResult<bool> {
        let bucket = self.config.bucket(provider);
        let allowed = self
            .store
            .try_acquire(
                &provider.bucket_key(),
                bucket.capacity,
                bucket.refill_rate,
                1.0,
            )
            .await?;
        Ok(allowed)
    }

    /// Soft wait at the gate: re-acquire with a short jittered pause until
    /// a token is granted or `rate_wait_max` elapses. Refusal never
    /// consumes tokens, and exhaustion is reported as a distinct error the
    /// worker treats as transient.
    pub async fn acquire(&self, provider: ProviderKind) -> DeliveryResult<()> {
        let started = tokio::time::Instant::now();
        let deadline = started + self.config.rate_wait_max;

        loop {
            if self.try_acquire(provider).await? {
                metrics::record_rate_gate_wait(provider.as_str(), started.elapsed());
                return Ok(());
            }

            let pause = Duration::from_millis(rand::rng().random_range(BACKOFF_MIN_MS..=BACKOFF_MAX_MS));

            if tokio::time::Instant::now() + pause >= deadline {
                metrics::record_rate_gate_wait(provider.as_str(), started.elapsed());
                debug!(provider = %provider, "Rate gate wait exhausted");
                return Err(DeliveryError::RateWaitExhausted(provider.to_string()));
            }

            tokio::time::sleep(pause).await;
        }
    }
}
