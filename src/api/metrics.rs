//! Prometheus metrics endpoint
//!
//! Exposes application metrics in Prometheus format, plus the request
//! counting middleware used by the other routers.

use axum::{
    Router,
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::data::QueueStatus;
use crate::metrics::{DELIVERY_QUEUE_ROWS, HTTP_REQUESTS_TOTAL, REGISTRY};

/// Count a routed request by method, route template and status.
pub async fn track_http_requests(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, response.status().as_str()])
        .inc();
    response
}

async fn refresh_queue_gauges(state: &AppState) {
    for status in [QueueStatus::Standby, QueueStatus::Running, QueueStatus::Success] {
        match state.db.count_by_status(status).await {
            Ok(count) => DELIVERY_QUEUE_ROWS
                .with_label_values(&[status.as_str()])
                .set(count),
            Err(e) => tracing::warn!(error = %e, "Failed to count queue rows"),
        }
    }
}

/// Metrics endpoint handler
///
/// Returns all metrics in Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    refresh_queue_gauges(&state).await;

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

/// Create metrics router
///
/// Exposes the `/metrics` endpoint.
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
