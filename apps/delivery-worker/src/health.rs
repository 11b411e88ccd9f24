//! Health and admin endpoints for the worker process.
//!
//! - `/health`, `/live` - liveness
//! - `/ready` - readiness (store reachable, heartbeat fresh)
//! - `/metrics` - Prometheus text exposition
//! - `/admin/dlq/stats`, `/admin/dlq/messages` - read-only DLQ inspection

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use domain_delivery::{metrics, StatsService};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct HealthState {
    pub stats: Arc<StatsService>,
    pub app_name: String,
    pub app_version: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(live_handler))
        .route("/live", get(live_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .route("/admin/dlq/messages", get(dlq_list_handler))
        .with_state(state)
}

/// Liveness: the process answers.
async fn live_handler(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "status": "alive",
        "name": state.app_name,
        "version": state.app_version,
    }))
}

/// Readiness: the engine can actually work - store reachable, at least
/// one worker heartbeat fresh.
async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let health = state.stats.health().await;
    let code = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

async fn dlq_stats_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let page = state
        .stats
        .dlq_page(0, 0)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({ "dead_letters": page.total })))
}

#[derive(Debug, Deserialize)]
struct DlqListParams {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

async fn dlq_list_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqListParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let limit = params.limit.min(100);
    let page = state
        .stats
        .dlq_page(params.offset, limit)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "total": page.total,
        "offset": page.offset,
        "count": page.entries.len(),
        "entries": page.entries,
    })))
}

fn internal_error(err: domain_delivery::DeliveryError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}
