//! ActivityPub inbox endpoints
//!
//! Inbound activities are authenticated and acknowledged; applying their
//! side effects is left to whatever consumes this service.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, State},
    http::StatusCode,
    routing::post,
};
use chrono::Utc;
use http::HeaderMap;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{
    ActivityType, InboundRequest, VerifiedOrigin, key_id_matches_actor, verify_request,
};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, SIGNATURE_VERIFICATIONS_TOTAL,
};

/// Create ActivityPub router
///
/// Routes:
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let actor_uri = format!("{}/users/{}", state.config.server.base_url(), username);
    if state.db.get_local_actor(&actor_uri).await?.is_none() {
        return Err(AppError::NotFound);
    }

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    receive(&state, &path, &headers, &body).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /inbox
///
/// Shared inbox for all actors on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    receive(&state, &path, &headers, &body).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Verify an inbound delivery.
///
/// # Steps
/// 1. Reject unsigned requests
/// 2. Parse the activity and its actor
/// 3. Verify the HTTP signature
/// 4. Require the signing key to belong to the activity's actor
async fn receive(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<VerifiedOrigin, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let result = authenticate(state, path, headers, body).await;

    let label = match &result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };
    SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&[label]).inc();
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", label])
        .inc();

    result
}

async fn authenticate(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<VerifiedOrigin, AppError> {
    if headers.get("signature").is_none() {
        return Err(AppError::Unauthorized);
    }

    let activity: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    let actor_id = activity
        .get("actor")
        .and_then(|a| a.as_str())
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;

    let request = InboundRequest {
        method: "POST",
        path,
        headers,
        body: Some(body),
    };
    let origin = verify_request(
        &request,
        state.public_keys.as_ref(),
        state.config.federation.signature_max_age(),
        Utc::now(),
    )
    .await?;

    if !key_id_matches_actor(&origin.key_id, actor_id) {
        tracing::warn!(
            key_id = %origin.key_id,
            actor = %actor_id,
            "Signature key does not belong to activity actor"
        );
        return Err(AppError::Unauthorized);
    }

    let activity_type = activity
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown");
    if activity_type.parse::<ActivityType>().is_err() {
        tracing::debug!(activity_type, "Received unsupported activity type");
    }
    tracing::info!(
        actor = %actor_id,
        origin = %origin.host,
        activity_type,
        "Accepted signed activity"
    );

    Ok(origin)
}
