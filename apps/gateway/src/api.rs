//! HTTP handlers and router for the gateway.

use crate::identity::ServiceIdentity;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use domain_delivery::{metrics, DeliveryError, EnqueueRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/send", post(send_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .route("/live", get(live_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map core errors onto HTTP responses: validation is the caller's fault,
/// a store failure is ours.
fn error_response(err: DeliveryError) -> (StatusCode, Json<Value>) {
    match err {
        DeliveryError::Validation(reason) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "validation", "reason": reason })),
        ),
        DeliveryError::Store(e) => {
            error!(error = %e, "Queue store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "queue_store_unavailable" })),
            )
        }
        other => {
            error!(error = %other, "Enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            )
        }
    }
}

/// `POST /send` - enqueue a send job on behalf of the calling service.
async fn send_handler(
    State(state): State<AppState>,
    identity: ServiceIdentity,
    Json(request): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let result = state
        .enqueuer
        .enqueue(request, &identity.service)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::ACCEPTED, Json(result)))
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    /// Optionally include one service's aggregates.
    service: Option<String>,
}

/// `GET /stats` - queue depths, counters, bucket state, worker liveness.
async fn stats_handler(
    State(state): State<AppState>,
    _identity: ServiceIdentity,
    Query(params): Query<StatsParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let snapshot = state.stats.snapshot().await.map_err(error_response)?;

    let mut body = serde_json::to_value(&snapshot)
        .map_err(|e| error_response(DeliveryError::Internal(e.to_string())))?;

    if let Some(service) = params.service {
        let aggregates = state
            .stats
            .service_stats(&service)
            .await
            .map_err(error_response)?;
        body["service"] = json!({ "name": service, "metrics": aggregates });
    }

    Ok(Json(body))
}

/// `GET /health` - deep check: store reachable and workers alive.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.stats.health().await;
    let code = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

/// `GET /live` - shallow liveness: the process answers.
async fn live_handler() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

/// `GET /metrics` - Prometheus text exposition.
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
