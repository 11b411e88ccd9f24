//! Delivery Domain
//!
//! The queue-and-delivery engine behind the email dispatch service.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   Gateway    │  ← validates + authenticates callers
//! └──────┬───────┘
//!        │ enqueue
//! ┌──────▼───────┐       ┌─────────────┐
//! │   Enqueuer   │──────►│ Queue store │ queue:ready:{priority}
//! └──────────────┘       │  (streams)  │ queue:parked / queue:dlq
//!        ┌───────────────┴──────┬──────┘
//!        │ promote due          │ consumer group
//! ┌──────▼───────┐       ┌──────▼──────┐      ┌───────────────┐
//! │  Scheduler   │       │ Worker pool │─────►│ Rate limiter  │
//! └──────────────┘       └──────┬──────┘      └───────────────┘
//!                               │ render + dispatch
//!                        ┌──────▼──────┐      ┌───────────────┐
//!                        │  Providers  │      │ Retry / DLQ   │
//!                        │ smtp/api    │◄─────┤  controller   │
//!                        └─────────────┘      └───────────────┘
//! ```
//!
//! Every transition is recorded in the audit trail and the Prometheus
//! metrics fabric. Workers in different processes share one consumer group
//! and one set of rate buckets; all coordination goes through the store.

pub mod audit;
pub mod config;
pub mod enqueuer;
pub mod error;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod ratelimit;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod supervisor;
pub mod templates;
pub mod worker;

// Re-export commonly used types
pub use audit::AuditTrail;
pub use config::{BucketConfig, DeliveryConfig};
pub use enqueuer::Enqueuer;
pub use error::{DeliveryError, DeliveryResult};
pub use models::{
    AuditRecord, DeadLetterEntry, EnqueueRequest, EnqueueResult, FinalStatus, ProviderKind,
    SendJob,
};
pub use providers::{DriverRegistry, OutboundEmail, ProviderDriver, SendOutcome};
pub use queue_store::Priority;
pub use ratelimit::RateLimiter;
pub use retry::RetryController;
pub use scheduler::Scheduler;
pub use stats::{HealthStatus, StatsService, StatsSnapshot};
pub use supervisor::WorkerSupervisor;
pub use templates::{RenderedEmail, TemplateEngine};
pub use worker::{Worker, WorkerContext};

/// Consumer group shared by every worker process.
pub const CONSUMER_GROUP: &str = "email-workers";
