//! Persisted key layout.
//!
//! Every key the store touches is derived here so the layout stays in one
//! place:
//!
//! - `queue:ready:{priority}` - the three ready streams
//! - `queue:parked` - sorted set, score = scheduled epoch ms
//! - `queue:dlq` - hash, `job_id -> DeadLetterEntry`
//! - `stats:sent`, `stats:failed`, `stats:sent:{yyyy-mm-dd}` - counters
//! - `rate:bucket:{provider}` - hash `{tokens, last_refill_ms}`
//! - `audit:job:{job_id}` - audit record
//! - `audit:service:{name}:calls:{yyyy-mm-dd}` - sorted set (score=ts, value=endpoint)
//! - `audit:service:{name}:metrics` - hash of counters
//! - `worker:heartbeat:{worker_id}` - liveness, short TTL

use crate::types::Priority;
use chrono::{DateTime, Utc};

pub const PARKED: &str = "queue:parked";
pub const DLQ: &str = "queue:dlq";
pub const STATS_SENT: &str = "stats:sent";
pub const STATS_FAILED: &str = "stats:failed";
pub const SCHEDULER_LEADER: &str = "scheduler:leader";
pub const HEARTBEAT_PREFIX: &str = "worker:heartbeat:";

/// Stream key prefix shared with the parked-promotion script.
pub const READY_PREFIX: &str = "queue:ready:";

pub fn ready_stream(priority: Priority) -> String {
    format!("{}{}", READY_PREFIX, priority.as_str())
}

pub fn stats_sent_day(day: DateTime<Utc>) -> String {
    format!("{}:{}", STATS_SENT, day.format("%Y-%m-%d"))
}

pub fn stats_failed_day(day: DateTime<Utc>) -> String {
    format!("{}:{}", STATS_FAILED, day.format("%Y-%m-%d"))
}

pub fn rate_bucket(provider: &str) -> String {
    format!("rate:bucket:{}", provider)
}

pub fn audit_job(job_id: &str) -> String {
    format!("audit:job:{}", job_id)
}

pub fn audit_service_calls(service: &str, day: DateTime<Utc>) -> String {
    format!("audit:service:{}:calls:{}", service, day.format("%Y-%m-%d"))
}

pub fn audit_service_metrics(service: &str) -> String {
    format!("audit:service:{}:metrics", service)
}

pub fn worker_heartbeat(worker_id: &str) -> String {
    format!("{}{}", HEARTBEAT_PREFIX, worker_id)
}
