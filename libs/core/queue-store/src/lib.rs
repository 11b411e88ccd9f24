//! Queue Store - Priority-Stream Queue Abstraction
//!
//! The durable storage contract for the delivery engine:
//! - Three append-only logs (one per priority) with consumer-group semantics
//! - A parked sorted set for future-dated jobs, with atomic promotion
//! - A dead-letter map keyed by job id
//! - Atomic counters, audit key/value records, per-service aggregates
//! - A server-side token-bucket check for shared rate limits
//! - Worker heartbeats and a small distributed lock for singleton roles
//!
//! # Architecture
//!
//! ```text
//! Enqueuer ──► queue:ready:{high,medium,low}   (Redis Streams)
//!    │                 │ (consumer group "email-workers")
//!    │                 ▼
//!    └──► queue:parked (ZSET) ──promote──► ready streams
//!                      │
//!                Worker pool ──failure──► queue:dlq (HASH)
//! ```
//!
//! Two implementations share the [`QueueStore`] trait: [`RedisQueueStore`]
//! for production and [`MemoryQueueStore`] for tests, so the engine can be
//! exercised without a running Redis.

mod connect;
mod error;
pub mod keys;
mod memory;
mod redis_store;
mod store;
mod types;

pub use connect::{connect, connect_with_retry, RetryConfig};
pub use error::StoreError;
pub use memory::MemoryQueueStore;
pub use redis_store::RedisQueueStore;
pub use store::{EnqueueRecord, QueueStore};
pub use types::{BucketState, PendingEntry, Priority, QueuedEntry};

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
