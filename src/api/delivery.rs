//! Delivery API
//!
//! - POST /api/v1/deliveries - queue an activity
//! - GET /api/v1/deliveries/:token - rows of a delivery
//! - POST /async/token/:token - hand a token to the workers

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::data::{DeliveryToken, QueueItem};
use crate::error::AppError;
use crate::federation::{InstancePath, OutboundActivity, PathType, Priority};

pub fn delivery_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/deliveries", post(create_delivery))
        .route("/api/v1/deliveries/:token", get(delivery_status))
        .route("/async/token/:token", post(trigger_token))
}

/// One declared target
#[derive(Debug, Clone, Deserialize)]
pub struct TargetRequest {
    pub uri: String,
    #[serde(rename = "type")]
    pub path_type: PathType,
    pub priority: Priority,
}

/// Body of `POST /api/v1/deliveries`
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryRequest {
    /// Local actor whose key signs the deliveries
    pub author: String,
    pub activity: serde_json::Value,
    pub targets: Vec<TargetRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryCreated {
    pub token: DeliveryToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStatus {
    pub token: DeliveryToken,
    pub items: Vec<QueueItem>,
}

/// Check `Authorization: Bearer <token>` when an API token is configured.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.config.server.api_token.as_deref() else {
        return Ok(());
    };

    let provided = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

/// POST /api/v1/deliveries
async fn create_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeliveryRequest>,
) -> Result<(StatusCode, Json<DeliveryCreated>), AppError> {
    authorize(&state, &headers)?;

    let targets = request
        .targets
        .iter()
        .map(|t| InstancePath::new(&t.uri, t.path_type, t.priority))
        .collect::<Result<Vec<_>, _>>()?;
    let activity = OutboundActivity::from_payload(&request.author, request.activity, targets)?;

    let token = state.dispatcher.request(&activity).await?;
    Ok((StatusCode::ACCEPTED, Json(DeliveryCreated { token })))
}

/// GET /api/v1/deliveries/:token
///
/// Delivered rows stay listed as `success`; rows for gone targets disappear.
async fn delivery_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeliveryStatus>, AppError> {
    authorize(&state, &headers)?;

    let token = DeliveryToken::from(token);
    let items = state.dispatcher.get_queue_status(&token).await?;
    Ok(Json(DeliveryStatus { token, items }))
}

/// POST /async/token/:token
async fn trigger_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    authorize(&state, &headers)?;

    if state.trigger.trigger(DeliveryToken::from(token)) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Ok(StatusCode::SERVICE_UNAVAILABLE)
    }
}
