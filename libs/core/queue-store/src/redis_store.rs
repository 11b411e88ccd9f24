//! Redis-backed queue store.
//!
//! Maps the store contract onto Redis Streams (ready logs + consumer
//! groups), a sorted set (parked jobs), hashes (DLQ, rate buckets, service
//! aggregates), and plain keys (counters, audit records, heartbeats).
//! Multi-step updates run as `MULTI` pipelines or Lua scripts so concurrent
//! workers observe them atomically.

use crate::error::StoreError;
use crate::keys;
use crate::store::{EnqueueRecord, QueueStore};
use crate::types::{BucketState, PendingEntry, Priority, QueuedEntry};
use crate::StoreResult;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum ready-stream length before approximate trimming.
const MAX_STREAM_LENGTH: i64 = 100_000;

/// Sleep between poll rounds while a blocking read waits for entries.
///
/// Blocking XREADGROUP would pin the shared ConnectionManager connection
/// and starve every other command, so reads poll instead.
const POLL_STEP: Duration = Duration::from_millis(100);

/// Retention for the per-service daily call timeline.
const SERVICE_CALLS_TTL_SECS: i64 = 45 * 24 * 3600;

/// Atomic token-bucket refill-and-consume. Runs server-side so two
/// concurrent workers can never overspend a bucket.
const RATE_ACQUIRE_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local n = tonumber(ARGV[4])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now_ms
end
local elapsed = now_ms - last
if elapsed < 0 then elapsed = 0 end
tokens = tokens + (elapsed / 1000.0) * refill
if tokens > capacity then tokens = capacity end
local allowed = 0
if tokens >= n then
  tokens = tokens - n
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill_ms', tostring(now_ms))
return allowed
"#;

/// Atomically move due parked jobs onto the ready stream for their
/// priority. The payload is decoded to read its `priority` field.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local moved = 0
for _, payload in ipairs(due) do
  if redis.call('ZREM', KEYS[1], payload) == 1 then
    local ok, job = pcall(cjson.decode, payload)
    local priority = 'medium'
    if ok and type(job) == 'table' and type(job['priority']) == 'string' then
      priority = job['priority']
    end
    redis.call('XADD', ARGV[3] .. priority, '*', 'job', payload)
    moved = moved + 1
  end
end
return moved
"#;

/// Acquire-or-refresh a lock: the holder may re-assert, anyone else only
/// wins once the key expires.
const LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return 1
end
return 0
"#;

/// Production queue store over a shared Redis connection.
pub struct RedisQueueStore {
    redis: ConnectionManager,
    rate_script: Script,
    promote_script: Script,
    lock_script: Script,
}

impl RedisQueueStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            rate_script: Script::new(RATE_ACQUIRE_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
            lock_script: Script::new(LOCK_SCRIPT),
        }
    }

    /// Get a clone of the underlying connection manager.
    pub fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }

    /// Read one priority stream for the consumer, non-blocking.
    async fn read_one(
        &self,
        priority: Priority,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<Vec<QueuedEntry>> {
        let mut conn = self.redis.clone();
        let stream = keys::ready_stream(priority);

        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        let result: Result<StreamReadReply, _> =
            conn.xread_options(&[&stream], &[">"], &opts).await;

        let reply = match result {
            Ok(reply) => reply,
            // A timeout here means no entries arrived, not a failure
            Err(e) if e.to_string().to_lowercase().contains("timed out") => return Ok(vec![]),
            Err(e) => return Err(StoreError::Redis(e)),
        };

        Ok(Self::parse_entries(priority, reply))
    }

    fn parse_entries(priority: Priority, reply: StreamReadReply) -> Vec<QueuedEntry> {
        let mut entries = Vec::new();

        for stream_key in reply.keys {
            for message in stream_key.ids {
                let payload = match message.map.get("job") {
                    Some(redis::Value::BulkString(bytes)) => {
                        String::from_utf8_lossy(bytes).to_string()
                    }
                    Some(redis::Value::SimpleString(s)) => s.clone(),
                    _ => {
                        // Delivered without a job field: surface it with an
                        // empty payload so the worker can ack and discard
                        // instead of leaving it pending forever.
                        warn!(entry_id = %message.id, "Stream entry missing 'job' field");
                        String::new()
                    }
                };
                entries.push(QueuedEntry {
                    priority,
                    entry_id: message.id,
                    payload,
                });
            }
        }

        entries
    }

    fn claimed_entries(priority: Priority, reply: redis::streams::StreamClaimReply) -> Vec<QueuedEntry> {
        reply
            .ids
            .into_iter()
            .map(|message| {
                let payload = match message.map.get("job") {
                    Some(redis::Value::BulkString(bytes)) => {
                        String::from_utf8_lossy(bytes).to_string()
                    }
                    Some(redis::Value::SimpleString(s)) => s.clone(),
                    _ => String::new(),
                };
                QueuedEntry {
                    priority,
                    entry_id: message.id,
                    payload,
                }
            })
            .collect()
    }

    /// Append the audit + per-service aggregate commands shared by both
    /// composite enqueue paths.
    fn push_enqueue_bookkeeping(pipe: &mut redis::Pipeline, record: &EnqueueRecord<'_>) {
        let now = Utc::now();
        let metrics_key = keys::audit_service_metrics(record.service);
        let calls_key = keys::audit_service_calls(record.service, now);

        pipe.cmd("SET")
            .arg(keys::audit_job(record.job_id))
            .arg(record.audit_json)
            .arg("EX")
            .arg(record.audit_ttl.as_secs())
            .ignore()
            .cmd("HINCRBY")
            .arg(&metrics_key)
            .arg("total_calls")
            .arg(1)
            .ignore()
            .cmd("HINCRBY")
            .arg(&metrics_key)
            .arg("total_emails")
            .arg(record.recipient_count)
            .ignore()
            .cmd("HINCRBY")
            .arg(&metrics_key)
            .arg(format!("endpoint:{}", record.endpoint))
            .arg(1)
            .ignore()
            .cmd("ZADD")
            .arg(&calls_key)
            .arg(now.timestamp_millis())
            .arg(record.endpoint)
            .ignore()
            .cmd("EXPIRE")
            .arg(&calls_key)
            .arg(SERVICE_CALLS_TTL_SECS)
            .ignore();
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn ensure_group(&self, group: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();

        for priority in Priority::ALL {
            let stream = keys::ready_stream(priority);

            // Created at "0" so a backlog enqueued before the first worker
            // boot is still delivered.
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(_) => {
                    info!(stream = %stream, group = %group, "Created consumer group");
                }
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(stream = %stream, group = %group, "Consumer group already exists");
                }
                Err(e) => return Err(StoreError::ConsumerGroup(e.to_string())),
            }
        }

        Ok(())
    }

    async fn append(&self, priority: Priority, payload: &str) -> StoreResult<String> {
        let mut conn = self.redis.clone();

        let entry_id: String = redis::cmd("XADD")
            .arg(keys::ready_stream(priority))
            .arg("MAXLEN")
            .arg("~")
            .arg(MAX_STREAM_LENGTH)
            .arg("*")
            .arg("job")
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        debug!(priority = %priority, entry_id = %entry_id, "Appended entry");
        Ok(entry_id)
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
            // Strict priority order per poll round
            for &priority in priorities {
                let entries = self.read_one(priority, group, consumer, count).await?;
                if !entries.is_empty() {
                    return Ok(entries);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(vec![]);
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    async fn ack(&self, priority: Priority, group: &str, entry_id: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();

        let _: () = conn
            .xack(keys::ready_stream(priority), group, &[entry_id])
            .await?;

        debug!(entry_id = %entry_id, "Acknowledged entry");
        Ok(())
    }

    async fn pending(
        &self,
        priority: Priority,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let mut conn = self.redis.clone();

        let reply: redis::streams::StreamPendingCountReply = conn
            .xpending_count(keys::ready_stream(priority), group, "-", "+", count)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                priority,
                entry_id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
                delivery_count: p.times_delivered as u64,
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
        if entry_ids.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.redis.clone();

        let reply: redis::streams::StreamClaimReply = conn
            .xclaim(
                keys::ready_stream(priority),
                group,
                consumer,
                min_idle.as_millis() as u64,
                entry_ids,
            )
            .await?;

        let claimed = Self::claimed_entries(priority, reply);
        if !claimed.is_empty() {
            info!(
                count = claimed.len(),
                consumer = %consumer,
                priority = %priority,
                "Claimed idle pending entries"
            );
        }
        Ok(claimed)
    }

    async fn stream_len(&self, priority: Priority) -> StoreResult<u64> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.xlen(keys::ready_stream(priority)).await?;
        Ok(len)
    }

    async fn enqueue_ready(
        &self,
        priority: Priority,
        record: EnqueueRecord<'_>,
    ) -> StoreResult<(String, u64)> {
        let mut conn = self.redis.clone();
        let stream = keys::ready_stream(priority);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(&stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(MAX_STREAM_LENGTH)
            .arg("*")
            .arg("job")
            .arg(record.payload)
            .cmd("XLEN")
            .arg(&stream);
        Self::push_enqueue_bookkeeping(&mut pipe, &record);

        let (entry_id, stream_len): (String, u64) = pipe.query_async(&mut conn).await?;

        debug!(
            job_id = %record.job_id,
            entry_id = %entry_id,
            priority = %priority,
            "Enqueued job"
        );

        Ok((entry_id, stream_len))
    }

    async fn enqueue_parked(&self, due_at_ms: i64, record: EnqueueRecord<'_>) -> StoreResult<()> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(keys::PARKED)
            .arg(due_at_ms)
            .arg(record.payload)
            .ignore();
        Self::push_enqueue_bookkeeping(&mut pipe, &record);

        let _: () = pipe.query_async(&mut conn).await?;

        debug!(job_id = %record.job_id, due_at_ms = %due_at_ms, "Parked job");
        Ok(())
    }

    async fn park(&self, payload: &str, due_at_ms: i64) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let _: () = conn.zadd(keys::PARKED, payload, due_at_ms).await?;
        Ok(())
    }

    async fn promote_due(&self, now_ms: i64, limit: usize) -> StoreResult<u64> {
        let mut conn = self.redis.clone();

        let moved: u64 = self
            .promote_script
            .key(keys::PARKED)
            .arg(now_ms)
            .arg(limit)
            .arg(keys::READY_PREFIX)
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            debug!(count = moved, "Promoted due parked jobs");
        }
        Ok(moved)
    }

    async fn parked_len(&self) -> StoreResult<u64> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.zcard(keys::PARKED).await?;
        Ok(len)
    }

    async fn dlq_put(&self, job_id: &str, entry_json: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let _: () = conn.hset(keys::DLQ, job_id, entry_json).await?;
        warn!(job_id = %job_id, "Moved job to DLQ");
        Ok(())
    }

    async fn dlq_get(&self, job_id: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        let entry: Option<String> = conn.hget(keys::DLQ, job_id).await?;
        Ok(entry)
    }

    async fn dlq_list(&self, offset: usize, limit: usize) -> StoreResult<Vec<(String, String)>> {
        let mut conn = self.redis.clone();

        // The DLQ is bounded by MAX_ATTEMPTS semantics, so a full read and
        // in-process page is acceptable for an admin surface.
        let mut all: Vec<(String, String)> = conn.hgetall(keys::DLQ).await?;
        all.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn dlq_len(&self) -> StoreResult<u64> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.hlen(keys::DLQ).await?;
        Ok(len)
    }

    async fn incr_counter(&self, key: &str, by: i64) -> StoreResult<i64> {
        let mut conn = self.redis.clone();
        let value: i64 = conn.incr(key, by).await?;
        Ok(value)
    }

    async fn incr_counter_with_ttl(&self, key: &str, by: i64, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.redis.clone();

        let (value,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCRBY")
            .arg(key)
            .arg(by)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(value)
    }

    async fn get_counter(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.redis.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn put_audit(&self, job_id: &str, record_json: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.redis.clone();

        let _: () = redis::cmd("SET")
            .arg(keys::audit_job(job_id))
            .arg(record_json)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn get_audit(&self, job_id: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        let record: Option<String> = conn.get(keys::audit_job(job_id)).await?;
        Ok(record)
    }

    async fn service_metrics(&self, service: &str) -> StoreResult<Vec<(String, i64)>> {
        let mut conn = self.redis.clone();
        let mut fields: Vec<(String, i64)> = conn
            .hgetall(keys::audit_service_metrics(service))
            .await?;
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
        let mut conn = self.redis.clone();

        let allowed: i64 = self
            .rate_script
            .key(bucket)
            .arg(capacity)
            .arg(refill_rate)
            .arg(Utc::now().timestamp_millis())
            .arg(n)
            .invoke_async(&mut conn)
            .await?;

        Ok(allowed == 1)
    }

    async fn bucket_state(&self, bucket: &str) -> StoreResult<Option<BucketState>> {
        let mut conn = self.redis.clone();

        let (tokens, last_refill_ms): (Option<f64>, Option<i64>) = redis::cmd("HMGET")
            .arg(bucket)
            .arg("tokens")
            .arg("last_refill_ms")
            .query_async(&mut conn)
            .await?;

        match (tokens, last_refill_ms) {
            (Some(tokens), Some(last_refill_ms)) => Ok(Some(BucketState {
                tokens,
                last_refill_ms,
            })),
            _ => Ok(None),
        }
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.redis.clone();

        let _: () = redis::cmd("SET")
            .arg(keys::worker_heartbeat(worker_id))
            .arg(Utc::now().timestamp_millis())
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn alive_workers(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", keys::HEARTBEAT_PREFIX);
        let mut workers = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            workers.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(keys::HEARTBEAT_PREFIX).map(String::from)),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(workers)
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.redis.clone();

        let held: i64 = self
            .lock_script
            .key(key)
            .arg(owner)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(held == 1)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;

        if response != "PONG" {
            return Err(StoreError::Internal(format!(
                "PING returned unexpected response: {}",
                response
            )));
        }
        Ok(())
    }
}
