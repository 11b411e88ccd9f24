//! Engine configuration.
//!
//! Every knob is an environment variable with a default, loaded once at
//! startup. Durations are seconds in the environment.

use crate::models::ProviderKind;
use std::collections::HashMap;
use std::time::Duration;

/// A provider rate bucket: maximum burst and sustained refill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub capacity: f64,
    /// Tokens regenerated per second.
    pub refill_rate: f64,
}

impl BucketConfig {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Built-in defaults per provider.
    pub fn default_for(provider: ProviderKind) -> Self {
        match provider {
            ProviderKind::Smtp => Self::new(100.0, 10.0),
            ProviderKind::Sendgrid => Self::new(600.0, 100.0),
            ProviderKind::Mailgun => Self::new(300.0, 50.0),
            ProviderKind::AwsSes => Self::new(200.0, 14.0),
        }
    }
}

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent workers per process.
    pub worker_count: usize,
    /// Retry-controller passes before a job is dead-lettered.
    pub max_attempts: u32,
    /// Base delay for the exponential retry schedule.
    pub base_retry_delay: Duration,
    /// Idle time after which a pending entry may be reclaimed.
    pub pending_timeout: Duration,
    /// How long a drain waits for in-flight jobs before aborting workers.
    pub drain_timeout: Duration,
    /// Hard per-dispatch deadline.
    pub dispatch_timeout: Duration,
    /// Longest a worker waits at the rate gate before treating the job as
    /// transiently failed.
    pub rate_wait_max: Duration,
    /// Scheduler promotion interval.
    pub scheduler_tick: Duration,
    /// Long-poll window for an empty read.
    pub poll_block: Duration,
    /// Interval between reclaim passes.
    pub reclaim_interval: Duration,
    /// Worker heartbeat TTL.
    pub heartbeat_ttl: Duration,
    /// Audit record retention.
    pub audit_ttl: Duration,
    /// Per-provider rate buckets.
    pub buckets: HashMap<ProviderKind, BucketConfig>,
    /// Provider used when a request does not name one.
    pub default_provider: ProviderKind,
    /// From-address handed to drivers.
    pub mail_from: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            max_attempts: 3,
            base_retry_delay: Duration::from_secs(60),
            pending_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(30),
            rate_wait_max: Duration::from_secs(30),
            scheduler_tick: Duration::from_secs(1),
            poll_block: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(30),
            audit_ttl: Duration::from_secs(30 * 24 * 3600),
            buckets: ProviderKind::ALL
                .iter()
                .map(|&p| (p, BucketConfig::default_for(p)))
                .collect(),
            default_provider: ProviderKind::Smtp,
            mail_from: "noreply@localhost".to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut buckets = HashMap::new();
        for provider in ProviderKind::ALL {
            let prefix = provider.as_str().to_uppercase();
            let fallback = BucketConfig::default_for(provider);
            buckets.insert(
                provider,
                BucketConfig::new(
                    env_f64(&format!("RATE_{}_CAPACITY", prefix), fallback.capacity),
                    env_f64(&format!("RATE_{}_REFILL", prefix), fallback.refill_rate),
                ),
            );
        }

        Self {
            worker_count: env_u64("WORKER_COUNT", defaults.worker_count as u64).max(1) as usize,
            max_attempts: env_u64("MAX_ATTEMPTS", defaults.max_attempts as u64).max(1) as u32,
            base_retry_delay: env_secs("BASE_RETRY_DELAY_S", defaults.base_retry_delay),
            pending_timeout: env_secs("PENDING_TIMEOUT_S", defaults.pending_timeout),
            drain_timeout: env_secs("DRAIN_TIMEOUT_S", defaults.drain_timeout),
            dispatch_timeout: env_secs("DISPATCH_TIMEOUT_S", defaults.dispatch_timeout),
            rate_wait_max: env_secs("RATE_WAIT_MAX_S", defaults.rate_wait_max),
            scheduler_tick: env_secs("SCHEDULER_TICK_S", defaults.scheduler_tick),
            poll_block: defaults.poll_block,
            reclaim_interval: defaults.reclaim_interval,
            heartbeat_ttl: defaults.heartbeat_ttl,
            audit_ttl: defaults.audit_ttl,
            buckets,
            default_provider: std::env::var("DEFAULT_PROVIDER")
                .ok()
                .and_then(|s| ProviderKind::parse(&s))
                .unwrap_or(defaults.default_provider),
            mail_from: std::env::var("MAIL_FROM").unwrap_or(defaults.mail_from),
        }
    }

    /// The bucket for a provider; every known provider has one.
    pub fn bucket(&self, provider: ProviderKind) -> BucketConfig {
        self.buckets
            .get(&provider)
            .copied()
            .unwrap_or_else(|| BucketConfig::default_for(provider))
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
