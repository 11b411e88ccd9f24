//! Shared application state passed to request handlers.

use crate::identity::ServiceDirectory;
use domain_delivery::{Enqueuer, StatsService};
use std::sync::Arc;

/// Cloned per handler; inexpensive Arc clones.
#[derive(Clone)]
pub struct AppState {
    /// Accepts validated jobs into the queue.
    pub enqueuer: Arc<Enqueuer>,
    /// Read-only queue/health view.
    pub stats: Arc<StatsService>,
    /// Service-token directory.
    pub identity: Arc<ServiceDirectory>,
}
