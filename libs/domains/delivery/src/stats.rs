//! Read-only stats and health views over the queue store.

use crate::config::DeliveryConfig;
use crate::error::DeliveryResult;
use crate::models::{DeadLetterEntry, ProviderKind};
use chrono::Utc;
use queue_store::{keys, Priority, QueueStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Ready-stream depths per priority.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

/// Configured limits plus observed tokens for one provider bucket.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderBucketInfo {
    pub capacity: f64,
    pub refill_rate: f64,
    /// Live token count; absent until the bucket has been touched.
    pub tokens: Option<f64>,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub queues: QueueDepths,
    pub parked: u64,
    pub dead_letters: u64,
    pub sent_total: i64,
    pub failed_total: i64,
    pub sent_today: i64,
    pub failed_today: i64,
    pub providers: BTreeMap<String, ProviderBucketInfo>,
    pub workers_alive: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// "healthy" or "degraded".
    pub status: &'static str,
    pub queue_store_connected: bool,
    pub workers_alive: usize,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// One page of dead letters plus the total count.
#[derive(Debug, Clone, Serialize)]
pub struct DlqPage {
    pub total: u64,
    pub offset: usize,
    pub entries: Vec<DeadLetterEntry>,
}

pub struct StatsService {
    store: Arc<dyn QueueStore>,
    config: DeliveryConfig,
}

impl StatsService {
    pub fn new(store: Arc<dyn QueueStore>, config: DeliveryConfig) -> Self {
        Self { store, config }
    }

    /// Collect queue depths, counters, bucket state, and worker liveness.
    pub async fn snapshot(&self) -> DeliveryResult<StatsSnapshot> {
        let now = Utc::now();

        let queues = QueueDepths {
            high: self.store.stream_len(Priority::High).await?,
            medium: self.store.stream_len(Priority::Medium).await?,
            low: self.store.stream_len(Priority::Low).await?,
        };

        let mut providers = BTreeMap::new();
        for provider in ProviderKind::ALL {
            let bucket = self.config.bucket(provider);
            let state = self.store.bucket_state(&provider.bucket_key()).await?;
            providers.insert(
                provider.as_str().to_string(),
                ProviderBucketInfo {
                    capacity: bucket.capacity,
                    refill_rate: bucket.refill_rate,
                    tokens: state.map(|s| s.tokens),
                },
            );
        }

        Ok(StatsSnapshot {
            queues,
            parked: self.store.parked_len().await?,
            dead_letters: self.store.dlq_len().await?,
            sent_total: self.store.get_counter(keys::STATS_SENT).await?,
            failed_total: self.store.get_counter(keys::STATS_FAILED).await?,
            sent_today: self.store.get_counter(&keys::stats_sent_day(now)).await?,
            failed_today: self
                .store
                .get_counter(&keys::stats_failed_day(now))
                .await?,
            providers,
            workers_alive: self.store.alive_workers().await?,
        })
    }

    /// Health: the store answers and at least one worker heartbeat is
    /// fresh. Never errors; an unreachable store reports as degraded.
    pub async fn health(&self) -> HealthStatus {
        let queue_store_connected = self.store.ping().await.is_ok();
        let workers_alive = if queue_store_connected {
            self.store.alive_workers().await.map(|w| w.len()).unwrap_or(0)
        } else {
            0
        };

        let status = if queue_store_connected && workers_alive > 0 {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status,
            queue_store_connected,
            workers_alive,
        }
    }

    /// Aggregates recorded for one calling service.
    pub async fn service_stats(&self, service: &str) -> DeliveryResult<BTreeMap<String, i64>> {
        let fields = self.store.service_metrics(service).await?;
        Ok(fields.into_iter().collect())
    }

    /// Page through the dead-letter queue.
    pub async fn dlq_page(&self, offset: usize, limit: usize) -> DeliveryResult<DlqPage> {
        let total = self.store.dlq_len().await?;
        let raw = self.store.dlq_list(offset, limit).await?;

        let entries = raw
            .into_iter()
            .filter_map(|(_, json)| serde_json::from_str(&json).ok())
            .collect();

        Ok(DlqPage {
            total,
            offset,
            entries,
        })
    }
}
