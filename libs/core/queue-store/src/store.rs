//! The `QueueStore` trait - the storage contract the delivery engine runs on.

use crate::types::{BucketState, PendingEntry, Priority, QueuedEntry};
use crate::StoreResult;
use async_trait::async_trait;
use std::time::Duration;

/// Everything the enqueuer writes in one atomic transaction: the job
/// payload plus its audit record and the calling service's aggregates.
/// Partial enqueue must be impossible, so the store applies these together.
#[derive(Debug, Clone)]
pub struct EnqueueRecord<'a> {
    pub job_id: &'a str,
    /// Serialized job, stored under the stream entry's `job` field.
    pub payload: &'a str,
    /// Calling service identity (audit attribution).
    pub service: &'a str,
    /// Endpoint label the request arrived through.
    pub endpoint: &'a str,
    pub recipient_count: u64,
    /// Serialized audit record with `final_status = "queued"`.
    pub audit_json: &'a str,
    pub audit_ttl: Duration,
}

/// Durable, ordered, consumer-group-enabled storage for the delivery engine.
///
/// Implementations: [`crate::RedisQueueStore`] (production; Redis Streams,
/// sorted sets, and Lua scripts) and [`crate::MemoryQueueStore`] (tests).
///
/// Multi-step updates are atomic inside the store: the composite enqueue
/// ops run as one transaction, parked-set promotion moves each due job in a
/// single script, and the token-bucket check is a single server-side script
/// so concurrent workers can never overspend a bucket.
#[async_trait]
pub trait QueueStore: Send + Sync {
    // -- consumer-group log ------------------------------------------------

    /// Ensure the consumer group exists on every priority stream.
    async fn ensure_group(&self, group: &str) -> StoreResult<()>;

    /// Append a payload to a ready stream. Returns the entry id.
    async fn append(&self, priority: Priority, payload: &str) -> StoreResult<String>;

    /// Read up to `count` entries for `consumer`, polling `priorities`
    /// strictly in the order given. Returns the first non-empty batch, or
    /// empty once `block_ms` has elapsed with nothing available.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        priorities: &[Priority],
        count: usize,
        block_ms: u64,
    ) -> StoreResult<Vec<QueuedEntry>>;

    /// Acknowledge an entry, removing it from the consumer's pending set.
    async fn ack(&self, priority: Priority, group: &str, entry_id: &str) -> StoreResult<()>;

    /// List delivered-but-unacknowledged entries for the group.
    async fn pending(
        &self,
        priority: Priority,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>>;

    /// Reassign ownership of pending entries idle longer than `min_idle`
    /// to `consumer`. Returns the successfully claimed entries.
    async fn claim(
        &self,
        priority: Priority,
        group: &str,
        consumer: &str,
        entry_ids: &[String],
        min_idle: Duration,
    ) -> StoreResult<Vec<QueuedEntry>>;

    /// Current length of a ready stream.
    async fn stream_len(&self, priority: Priority) -> StoreResult<u64>;

    // -- atomic enqueue ----------------------------------------------------

    /// Append a job plus its audit record and service aggregates in one
    /// transaction. Returns `(entry_id, stream_len_after_append)`.
    async fn enqueue_ready(
        &self,
        priority: Priority,
        record: EnqueueRecord<'_>,
    ) -> StoreResult<(String, u64)>;

    /// Park a future-dated job plus its audit record and service aggregates
    /// in one transaction.
    async fn enqueue_parked(&self, due_at_ms: i64, record: EnqueueRecord<'_>) -> StoreResult<()>;

    // -- parked set --------------------------------------------------------

    /// Park a payload keyed by its due time (used by the retry path).
    async fn park(&self, payload: &str, due_at_ms: i64) -> StoreResult<()>;

    /// Atomically move every parked job due at or before `now_ms` onto the
    /// ready stream for its priority. Returns how many were promoted.
    async fn promote_due(&self, now_ms: i64, limit: usize) -> StoreResult<u64>;

    async fn parked_len(&self) -> StoreResult<u64>;

    // -- dead letters ------------------------------------------------------

    async fn dlq_put(&self, job_id: &str, entry_json: &str) -> StoreResult<()>;

    async fn dlq_get(&self, job_id: &str) -> StoreResult<Option<String>>;

    /// Page through DLQ entries as `(job_id, entry_json)` pairs.
    async fn dlq_list(&self, offset: usize, limit: usize) -> StoreResult<Vec<(String, String)>>;

    async fn dlq_len(&self) -> StoreResult<u64>;

    // -- counters ----------------------------------------------------------

    async fn incr_counter(&self, key: &str, by: i64) -> StoreResult<i64>;

    /// Increment a counter and (re)set its TTL - used for daily keys.
    async fn incr_counter_with_ttl(&self, key: &str, by: i64, ttl: Duration) -> StoreResult<i64>;

    async fn get_counter(&self, key: &str) -> StoreResult<i64>;

    // -- audit key/value ---------------------------------------------------

    async fn put_audit(&self, job_id: &str, record_json: &str, ttl: Duration) -> StoreResult<()>;

    async fn get_audit(&self, job_id: &str) -> StoreResult<Option<String>>;

    /// Aggregate counters recorded for a calling service at enqueue time
    /// (`total_calls`, `total_emails`, `endpoint:*`), as field/value pairs.
    async fn service_metrics(&self, service: &str) -> StoreResult<Vec<(String, i64)>>;

    // -- rate buckets ------------------------------------------------------

    /// Atomic token-bucket check-and-consume: refill by elapsed time at
    /// `refill_rate` capped at `capacity`, then take `n` tokens if
    /// available. Never partially consumes.
    async fn try_acquire(
        &self,
        bucket: &str,
        capacity: f64,
        refill_rate: f64,
        n: f64,
    ) -> StoreResult<bool>;

    async fn bucket_state(&self, bucket: &str) -> StoreResult<Option<BucketState>>;

    // -- liveness & coordination -------------------------------------------

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> StoreResult<()>;

    /// Worker ids with a fresh heartbeat.
    async fn alive_workers(&self) -> StoreResult<Vec<String>>;

    /// Acquire or refresh a named lock for `owner`. Returns whether the
    /// caller holds the lock afterwards.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool>;

    /// Cheap reachability check.
    async fn ping(&self) -> StoreResult<()>;
}
