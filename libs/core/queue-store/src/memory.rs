//! In-memory queue store for tests.
//!
//! Full-parity implementation of [`QueueStore`] so the delivery engine can
//! be exercised without a running Redis. Consumer-group semantics mirror
//! the Redis implementation: entries delivered past a per-group cursor,
//! pending until acked, reclaimable by idle time.

use crate::store::{EnqueueRecord, QueueStore};
use crate::types::{BucketState, PendingEntry, Priority, QueuedEntry};
use crate::StoreResult;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const POLL_STEP: Duration = Duration::from_millis(5);

#[derive(Default)]
struct MemStream {
    entries: Vec<(String, String)>,
    next_seq: u64,
}

struct MemPending {
    payload: String,
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct GroupState {
    cursor: usize,
    pending: BTreeMap<String, MemPending>,
}

struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<Priority, MemStream>,
    groups: HashMap<(String, Priority), GroupState>,
    parked: Vec<(i64, String)>,
    dlq: BTreeMap<String, String>,
    counters: HashMap<String, i64>,
    audit: HashMap<String, String>,
    buckets: HashMap<String, Bucket>,
    heartbeats: HashMap<String, Instant>,
    locks: HashMap<String, (String, Instant)>,
}

impl Inner {
    fn next_entry_id(&mut self, priority: Priority) -> String {
        let stream = self.streams.entry(priority).or_default();
        stream.next_seq += 1;
        format!("{}-{}", Utc::now().timestamp_millis(), stream.next_seq)
    }

    fn append(&mut self, priority: Priority, payload: &str) -> String {
        let entry_id = self.next_entry_id(priority);
        let stream = self.streams.entry(priority).or_default();
        stream.entries.push((entry_id.clone(), payload.to_string()));
        entry_id
    }

    fn deliver(
        &mut self,
        group: &str,
        consumer: &str,
        priority: Priority,
        count: usize,
    ) -> Vec<QueuedEntry> {
        let key = (group.to_string(), priority);
        let cursor = self.groups.entry(key.clone()).or_default().cursor;

        let batch: Vec<(String, String)> = match self.streams.get(&priority) {
            Some(s) if cursor < s.entries.len() => {
                let end = (cursor + count).min(s.entries.len());
                s.entries[cursor..end].to_vec()
            }
            _ => return Vec::new(),
        };

        let Some(state) = self.groups.get_mut(&key) else {
            return Vec::new();
        };

        let mut delivered = Vec::new();
        for (entry_id, payload) in batch {
            state.pending.insert(
                entry_id.clone(),
                MemPending {
                    payload: payload.clone(),
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            state.cursor += 1;
            delivered.push(QueuedEntry {
                priority,
                entry_id,
                payload,
            });
        }

        delivered
    }

    fn apply_bookkeeping(&mut self, record: &EnqueueRecord<'_>) {
        self.audit
            .insert(record.job_id.to_string(), record.audit_json.to_string());

        let metrics = crate::keys::audit_service_metrics(record.service);
        *self
            .counters
            .entry(format!("{}:total_calls", metrics))
            .or_default() += 1;
        *self
            .counters
            .entry(format!("{}:total_emails", metrics))
            .or_default() += record.recipient_count as i64;
        *self
            .counters
            .entry(format!("{}:endpoint:{}", metrics, record.endpoint))
            .or_default() += 1;
    }
}

/// In-memory [`QueueStore`] with the same observable semantics as the
/// Redis implementation.
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn ensure_group(&self, group: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        for priority in Priority::ALL {
            inner
                .groups
                .entry((group.to_string(), priority))
                .or_default();
        }
        Ok(())
    }

    async fn append(&self, priority: Priority, payload: &str) -> StoreResult<String> {
        let mut inner = self.inner.lock().await;
        Ok(inner.append(priority, payload))
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        priorities: &[Priority],
        count: usize,
        block_ms: u64,
    ) -> StoreResult<Vec<QueuedEntry>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(block_ms);

        loop {
            {
                let mut inner = self.inner.lock().await;
                for &priority in priorities {
                    let delivered = inner.deliver(group, consumer, priority, count);
                    if !delivered.is_empty() {
                        return Ok(delivered);
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(vec![]);
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    async fn ack(&self, priority: Priority, group: &str, entry_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.groups.get_mut(&(group.to_string(), priority)) {
            state.pending.remove(entry_id);
        }
        Ok(())
    }

    async fn pending(
        &self,
        priority: Priority,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let inner = self.inner.lock().await;

        let Some(state) = inner.groups.get(&(group.to_string(), priority)) else {
            return Ok(vec![]);
        };

        Ok(state
            .pending
            .iter()
            .take(count)
            .map(|(entry_id, p)| PendingEntry {
                priority,
                entry_id: entry_id.clone(),
                consumer: p.consumer.clone(),
                idle_ms: p.delivered_at.elapsed().as_millis() as u64,
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        priority: Priority,
        group: &str,
        consumer: &str,
        entry_ids: &[String],
        min_idle: Duration,
    ) -> StoreResult<Vec<QueuedEntry>> {
        let mut inner = self.inner.lock().await;

        let Some(state) = inner.groups.get_mut(&(group.to_string(), priority)) else {
            return Ok(vec![]);
        };

        let mut claimed = Vec::new();
        for entry_id in entry_ids {
            if let Some(p) = state.pending.get_mut(entry_id) {
                if p.delivered_at.elapsed() >= min_idle {
                    p.consumer = consumer.to_string();
                    p.delivered_at = Instant::now();
                    p.delivery_count += 1;
                    claimed.push(QueuedEntry {
                        priority,
                        entry_id: entry_id.clone(),
                        payload: p.payload.clone(),
                    });
                }
            }
        }

        Ok(claimed)
    }

    async fn stream_len(&self, priority: Priority) -> StoreResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(&priority).map_or(0, |s| s.entries.len()) as u64)
    }

    async fn enqueue_ready(
        &self,
        priority: Priority,
        record: EnqueueRecord<'_>,
    ) -> StoreResult<(String, u64)> {
        let mut inner = self.inner.lock().await;
        let entry_id = inner.append(priority, record.payload);
        inner.apply_bookkeeping(&record);
        let len = inner.streams.get(&priority).map_or(0, |s| s.entries.len()) as u64;
        Ok((entry_id, len))
    }

    async fn enqueue_parked(&self, due_at_ms: i64, record: EnqueueRecord<'_>) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.parked.push((due_at_ms, record.payload.to_string()));
        inner.apply_bookkeeping(&record);
        Ok(())
    }

    async fn park(&self, payload: &str, due_at_ms: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.parked.push((due_at_ms, payload.to_string()));
        Ok(())
    }

    async fn promote_due(&self, now_ms: i64, limit: usize) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.parked.sort_by_key(|(due, _)| *due);

        let mut moved = 0u64;
        while moved < limit as u64 {
            let due = matches!(inner.parked.first(), Some((due, _)) if *due <= now_ms);
            if !due {
                break;
            }

            let (_, payload) = inner.parked.remove(0);
            let priority = serde_json::from_str::<serde_json::Value>(&payload)
                .ok()
                .and_then(|v| {
                    v.get("priority")
                        .and_then(|p| p.as_str())
                        .and_then(Priority::parse)
                })
                .unwrap_or_default();
            inner.append(priority, &payload);
            moved += 1;
        }

        Ok(moved)
    }

    async fn parked_len(&self) -> StoreResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.parked.len() as u64)
    }

    async fn dlq_put(&self, job_id: &str, entry_json: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.dlq.insert(job_id.to_string(), entry_json.to_string());
        Ok(())
    }

    async fn dlq_get(&self, job_id: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.dlq.get(job_id).cloned())
    }

    async fn dlq_list(&self, offset: usize, limit: usize) -> StoreResult<Vec<(String, String)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dlq
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn dlq_len(&self) -> StoreResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.dlq.len() as u64)
    }

    async fn incr_counter(&self, key: &str, by: i64) -> StoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let value = inner.counters.entry(key.to_string()).or_default();
        *value += by;
        Ok(*value)
    }

    async fn incr_counter_with_ttl(&self, key: &str, by: i64, _ttl: Duration) -> StoreResult<i64> {
        // Expiry is not modelled; daily keys simply accumulate in tests.
        self.incr_counter(key, by).await
    }

    async fn get_counter(&self, key: &str) -> StoreResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.counters.get(key).copied().unwrap_or(0))
    }

    async fn put_audit(&self, job_id: &str, record_json: &str, _ttl: Duration) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .audit
            .insert(job_id.to_string(), record_json.to_string());
        Ok(())
    }

    async fn get_audit(&self, job_id: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.audit.get(job_id).cloned())
    }

    async fn service_metrics(&self, service: &str) -> StoreResult<Vec<(String, i64)>> {
        let inner = self.inner.lock().await;
        let prefix = format!("{}:", crate::keys::audit_service_metrics(service));

        let mut fields: Vec<(String, i64)> = inner
            .counters
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|field| (field.to_string(), *value))
            })
            .collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(fields)
    }

    async fn try_acquire(
        &self,
        bucket: &str,
        capacity: f64,
        refill_rate: f64,
        n: f64,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let now_ms = Utc::now().timestamp_millis();

        let state = inner.buckets.entry(bucket.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill_ms: now_ms,
        });

        let elapsed_ms = (now_ms - state.last_refill_ms).max(0);
        state.tokens = (state.tokens + (elapsed_ms as f64 / 1000.0) * refill_rate).min(capacity);
        state.last_refill_ms = now_ms;

        if state.tokens >= n {
            state.tokens -= n;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn bucket_state(&self, bucket: &str) -> StoreResult<Option<BucketState>> {
        let inner = self.inner.lock().await;
        Ok(inner.buckets.get(bucket).map(|b| BucketState {
            tokens: b.tokens,
            last_refill_ms: b.last_refill_ms,
        }))
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .heartbeats
            .insert(worker_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn alive_workers(&self) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.heartbeats.retain(|_, expires| *expires > now);
        Ok(inner.heartbeats.keys().cloned().collect())
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        match inner.locks.get(key) {
            Some((holder, expires)) if holder != owner && *expires > now => Ok(false),
            _ => {
                inner
                    .locks
                    .insert(key.to_string(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(job_id: &'a str, payload: &'a str) -> EnqueueRecord<'a> {
        EnqueueRecord {
            job_id,
            payload,
            service: "svc",
            endpoint: "send",
            recipient_count: 1,
            audit_json: "{}",
            audit_ttl: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_append_read_ack_cycle() {
        let store = MemoryQueueStore::new();
        store.ensure_group("g").await.unwrap();

        store.append(Priority::Medium, "payload-1").await.unwrap();

        let entries = store
            .read_group("g", "c1", &Priority::ALL, 1, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "payload-1");

        // Delivered entry is pending until acked
        let pending = store.pending(Priority::Medium, "g", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");
        assert_eq!(pending[0].delivery_count, 1);

        store
            .ack(Priority::Medium, "g", &entries[0].entry_id)
            .await
            .unwrap();
        let pending = store.pending(Priority::Medium, "g", 10).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_read_group_priority_order() {
        let store = MemoryQueueStore::new();
        store.ensure_group("g").await.unwrap();

        store.append(Priority::Low, "low").await.unwrap();
        store.append(Priority::High, "high").await.unwrap();

        let entries = store
            .read_group("g", "c1", &Priority::ALL, 1, 0)
            .await
            .unwrap();
        assert_eq!(entries[0].payload, "high");

        let entries = store
            .read_group("g", "c1", &Priority::ALL, 1, 0)
            .await
            .unwrap();
        assert_eq!(entries[0].payload, "low");
    }

    #[tokio::test]
    async fn test_entries_delivered_to_one_consumer() {
        let store = MemoryQueueStore::new();
        store.ensure_group("g").await.unwrap();

        store.append(Priority::High, "only").await.unwrap();

        let first = store
            .read_group("g", "c1", &Priority::ALL, 1, 0)
            .await
            .unwrap();
        let second = store
            .read_group("g", "c2", &Priority::ALL, 1, 0)
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_claim_reassigns_idle_entries() {
        let store = MemoryQueueStore::new();
        store.ensure_group("g").await.unwrap();

        store.append(Priority::Medium, "stuck").await.unwrap();
        let entries = store
            .read_group("g", "dead-consumer", &Priority::ALL, 1, 0)
            .await
            .unwrap();
        let entry_id = entries[0].entry_id.clone();

        // Not idle long enough yet
        let claimed = store
            .claim(
                Priority::Medium,
                "g",
                "live-consumer",
                &[entry_id.clone()],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(claimed.is_empty());

        let claimed = store
            .claim(
                Priority::Medium,
                "g",
                "live-consumer",
                &[entry_id.clone()],
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, "stuck");

        let pending = store.pending(Priority::Medium, "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "live-consumer");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_promote_due_routes_by_priority() {
        let store = MemoryQueueStore::new();
        store.ensure_group("g").await.unwrap();

        let now = Utc::now().timestamp_millis();
        store
            .park(r#"{"priority":"high","n":1}"#, now - 10)
            .await
            .unwrap();
        store
            .park(r#"{"priority":"low","n":2}"#, now + 60_000)
            .await
            .unwrap();

        let moved = store.promote_due(now, 10).await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(store.parked_len().await.unwrap(), 1);
        assert_eq!(store.stream_len(Priority::High).await.unwrap(), 1);
        assert_eq!(store.stream_len(Priority::Low).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_ready_writes_audit_and_counters() {
        let store = MemoryQueueStore::new();

        let (entry_id, len) = store
            .enqueue_ready(Priority::Medium, record("job-1", r#"{"priority":"medium"}"#))
            .await
            .unwrap();
        assert!(!entry_id.is_empty());
        assert_eq!(len, 1);

        assert!(store.get_audit("job-1").await.unwrap().is_some());
        let calls = store
            .get_counter("audit:service:svc:metrics:total_calls")
            .await
            .unwrap();
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_bucket_consumes_and_refills() {
        let store = MemoryQueueStore::new();

        // Capacity 2, no refill: exactly two acquisitions succeed
        assert!(store.try_acquire("rate:bucket:smtp", 2.0, 0.0, 1.0).await.unwrap());
        assert!(store.try_acquire("rate:bucket:smtp", 2.0, 0.0, 1.0).await.unwrap());
        assert!(!store.try_acquire("rate:bucket:smtp", 2.0, 0.0, 1.0).await.unwrap());

        // With refill, tokens come back after 1/refill_rate seconds
        assert!(store.try_acquire("rate:bucket:fast", 1.0, 50.0, 1.0).await.unwrap());
        assert!(!store.try_acquire("rate:bucket:fast", 1.0, 50.0, 1.0).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.try_acquire("rate:bucket:fast", 1.0, 50.0, 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeats_expire() {
        let store = MemoryQueueStore::new();

        store
            .heartbeat("w1", Duration::from_millis(10))
            .await
            .unwrap();
        store.heartbeat("w2", Duration::from_secs(30)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let alive = store.alive_workers().await.unwrap();
        assert_eq!(alive, vec!["w2".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_but_reentrant() {
        let store = MemoryQueueStore::new();

        assert!(store
            .try_lock("scheduler:leader", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!store
            .try_lock("scheduler:leader", "b", Duration::from_secs(5))
            .await
            .unwrap());
        // Holder refreshes
        assert!(store
            .try_lock("scheduler:leader", "a", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_dlq_round_trip() {
        let store = MemoryQueueStore::new();

        store.dlq_put("job-9", r#"{"reason":"boom"}"#).await.unwrap();
        assert_eq!(store.dlq_len().await.unwrap(), 1);
        assert!(store.dlq_get("job-9").await.unwrap().is_some());
        assert!(store.dlq_get("job-0").await.unwrap().is_none());

        let page = store.dlq_list(0, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0, "job-9");
    }
}
